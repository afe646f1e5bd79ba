use std::{
    fs,
    path::{Path, PathBuf},
};

use strata_core::{ModuleName, Result, SourceEntry, SourceStore, Tier, TierSet};
use tracing::trace;

/// Reads tiers from sibling directories: `root/<tier>/<path>`.
#[derive(Debug, Clone)]
pub struct FsSourceStore {
    root: PathBuf,
    tiers: TierSet,
    extension: String,
    package_init: String,
}

impl FsSourceStore {
    pub fn new(root: impl Into<PathBuf>, tiers: TierSet) -> Self {
        Self {
            root: root.into(),
            tiers,
            extension: "strata".to_string(),
            package_init: "__init__".to_string(),
        }
    }

    pub fn with_layout(mut self, extension: impl Into<String>, package_init: impl Into<String>) -> Self {
        self.extension = extension.into();
        self.package_init = package_init.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tiers(&self) -> &TierSet {
        &self.tiers
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn tier_dir(&self, tier: &Tier) -> PathBuf {
        self.root.join(&tier.name)
    }

    /// One directory per configured tier, lowest first.
    pub fn tier_dirs(&self) -> Vec<(Tier, PathBuf)> {
        self.tiers
            .iter()
            .map(|t| (t.clone(), self.tier_dir(t)))
            .collect()
    }

    /// Maps a script file path back to its tier and module name. Package
    /// init files map to their directory's name.
    pub fn module_name_for(&self, path: &Path) -> Option<(Tier, ModuleName)> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut components = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        if components.len() < 2 {
            return None;
        }
        let tier = self.tiers.get(components.remove(0))?.clone();

        let file = components.pop()?;
        let stem = file.strip_suffix(&format!(".{}", self.extension))?;
        if stem != self.package_init {
            components.push(stem);
        }
        let name = ModuleName::from_segments(components).ok()?;
        Some((tier, name))
    }

    /// Whether any tier still holds a script file for `name`.
    pub fn has_module(&self, name: &ModuleName) -> bool {
        let regular = format!("{}.{}", name.to_path(), self.extension);
        let package = format!(
            "{}/{}.{}",
            name.to_path(),
            self.package_init,
            self.extension
        );
        self.tiers.iter().any(|tier| {
            let dir = self.tier_dir(tier);
            dir.join(&regular).is_file() || dir.join(&package).is_file()
        })
    }
}

impl SourceStore for FsSourceStore {
    fn fetch_tiers(&self, path: &str) -> Result<Vec<SourceEntry>> {
        let mut entries = Vec::new();
        for tier in self.tiers.iter() {
            let candidate = self.tier_dir(tier).join(path.trim_matches('/'));
            let origin = candidate.display().to_string();
            if candidate.is_file() {
                trace!(tier = %tier, origin = %origin, "reading source file");
                let text = fs::read_to_string(&candidate)?;
                entries.push(SourceEntry::file(tier.clone(), origin, text));
            } else if candidate.is_dir() {
                entries.push(SourceEntry::directory(tier.clone(), origin));
            }
        }
        Ok(entries)
    }

    fn describe(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }
}
