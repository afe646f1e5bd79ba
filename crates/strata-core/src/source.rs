use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Result, Tier};

/// What a store holds for one relative path at one tier.
///
/// `text` is `None` when the path names a directory at that tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub tier: Tier,
    pub origin: String,
    pub text: Option<String>,
}

impl SourceEntry {
    pub fn file(tier: Tier, origin: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tier,
            origin: origin.into(),
            text: Some(text.into()),
        }
    }

    pub fn directory(tier: Tier, origin: impl Into<String>) -> Self {
        Self {
            tier,
            origin: origin.into(),
            text: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.text.is_none()
    }

    pub fn into_unit(self, path: &str) -> Option<SourceUnit> {
        let text = self.text?;
        Some(SourceUnit {
            tier: self.tier,
            path: path.to_string(),
            origin: Arc::from(self.origin),
            text: Arc::from(text),
        })
    }
}

/// One tier's source text for a module, immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    pub tier: Tier,
    pub path: String,
    pub origin: Arc<str>,
    pub text: Arc<str>,
}

/// Authoritative storage of script source, organised by tier.
pub trait SourceStore: Send + Sync {
    /// All entries for `path` across tiers, lowest tier first. Tiers with
    /// nothing at `path` are omitted.
    fn fetch_tiers(&self, path: &str) -> Result<Vec<SourceEntry>>;

    /// Human-readable label for logs.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

impl<S: SourceStore + ?Sized> SourceStore for Arc<S> {
    fn fetch_tiers(&self, path: &str) -> Result<Vec<SourceEntry>> {
        (**self).fetch_tiers(path)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
