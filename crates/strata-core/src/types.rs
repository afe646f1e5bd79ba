use std::{
    cmp::Ordering,
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, StrataError};

/// A hierarchical, dotted script name (`Wind.Speed`). Independent of the tier
/// that supplies it. Always has at least one segment and no segment is empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleName(Vec<String>);

impl ModuleName {
    pub fn parse(dotted: &str) -> crate::Result<Self> {
        Self::from_segments(dotted.split('.'))
            .map_err(|_| StrataError::InvalidModuleName(dotted.to_string()))
    }

    pub fn from_segments<I>(segments: I) -> crate::Result<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let segments: Vec<String> = segments
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        if segments.is_empty() || !segments.iter().all(|s| Self::valid_segment(s)) {
            return Err(StrataError::InvalidModuleName(segments.join(".")));
        }
        Ok(Self(segments))
    }

    fn valid_segment(segment: &str) -> bool {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    }

    pub fn as_dotted(&self) -> String {
        self.0.join(".")
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Last segment, e.g. `Speed` for `Wind.Speed`.
    pub fn leaf(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    pub fn parent(&self) -> Option<ModuleName> {
        if self.0.len() < 2 {
            return None;
        }
        Some(ModuleName(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn child(&self, segment: &str) -> crate::Result<ModuleName> {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self::from_segments(segments)
    }

    /// Store-relative path with `/` separators, without extension.
    pub fn to_path(&self) -> String {
        self.0.join("/")
    }
}

impl Display for ModuleName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_dotted())
    }
}

impl FromStr for ModuleName {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ModuleName {
    type Error = StrataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ModuleName> for String {
    fn from(value: ModuleName) -> Self {
        value.as_dotted()
    }
}

/// A named override layer. Higher rank wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Tier {
    pub rank: u32,
    pub name: String,
}

impl Tier {
    pub fn new(rank: u32, name: impl Into<String>) -> Self {
        Self {
            rank,
            name: name.into(),
        }
    }
}

impl Ord for Tier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for Tier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

pub const DEFAULT_TIERS: [&str; 4] = ["base", "configured", "site", "user"];

/// The ordered set of tiers a deployment uses, lowest priority first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierSet(Vec<Tier>);

impl TierSet {
    pub fn from_names<I>(names: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut tiers: Vec<Tier> = Vec::new();
        for (rank, name) in names.into_iter().enumerate() {
            let name = name.as_ref().trim();
            if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
                return Err(ConfigError::InvalidTierName(name.to_string()));
            }
            if tiers.iter().any(|t| t.name == name) {
                return Err(ConfigError::DuplicateTier(name.to_string()));
            }
            tiers.push(Tier::new(rank as u32, name));
        }
        if tiers.is_empty() {
            return Err(ConfigError::EmptyTierList);
        }
        Ok(Self(tiers))
    }

    pub fn get(&self, name: &str) -> Option<&Tier> {
        self.0.iter().find(|t| t.name == name)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Tier> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for TierSet {
    fn default() -> Self {
        Self(
            DEFAULT_TIERS
                .iter()
                .enumerate()
                .map(|(rank, name)| Tier::new(rank as u32, *name))
                .collect(),
        )
    }
}
