use std::collections::BTreeMap;

use parking_lot::RwLock;
use strata_core::{Result, SourceEntry, SourceStore, Tier, TierSet};

/// Keeps source text in memory, keyed by tier and store-relative path.
/// Directories are implied by the stored paths.
#[derive(Debug, Default)]
pub struct MemorySourceStore {
    tiers: TierSet,
    files: RwLock<BTreeMap<String, BTreeMap<Tier, String>>>,
}

impl MemorySourceStore {
    pub fn new(tiers: TierSet) -> Self {
        Self {
            tiers,
            files: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn tiers(&self) -> &TierSet {
        &self.tiers
    }

    /// Stores `text` at `path` for the named tier. Returns false when the
    /// tier is unknown.
    pub fn put(&self, tier: &str, path: &str, text: impl Into<String>) -> bool {
        let Some(tier) = self.tiers.get(tier).cloned() else {
            return false;
        };
        self.files
            .write()
            .entry(normalize(path))
            .or_default()
            .insert(tier, text.into());
        true
    }

    pub fn remove(&self, tier: &str, path: &str) -> bool {
        let Some(tier) = self.tiers.get(tier) else {
            return false;
        };
        let path = normalize(path);
        let mut files = self.files.write();
        let Some(by_tier) = files.get_mut(&path) else {
            return false;
        };
        let removed = by_tier.remove(tier).is_some();
        if by_tier.is_empty() {
            files.remove(&path);
        }
        removed
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }

    fn origin(tier: &Tier, path: &str) -> String {
        format!("mem://{}/{}", tier.name, path)
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

impl SourceStore for MemorySourceStore {
    fn fetch_tiers(&self, path: &str) -> Result<Vec<SourceEntry>> {
        let path = normalize(path);
        let files = self.files.read();
        let mut entries = Vec::new();

        if let Some(by_tier) = files.get(&path) {
            for (tier, text) in by_tier {
                entries.push(SourceEntry::file(
                    tier.clone(),
                    Self::origin(tier, &path),
                    text.clone(),
                ));
            }
        }

        let prefix = format!("{}/", path);
        for tier in self.tiers.iter() {
            let has_children = files
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .any(|(_, by_tier)| by_tier.contains_key(tier));
            if has_children {
                entries.push(SourceEntry::directory(
                    tier.clone(),
                    Self::origin(tier, &path),
                ));
            }
        }

        entries.sort_by(|a, b| a.tier.cmp(&b.tier));
        Ok(entries)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_are_ordered_by_tier() {
        let store = MemorySourceStore::new(TierSet::default());
        assert!(store.put("user", "Wind.strata", "let K = 3"));
        assert!(store.put("base", "Wind.strata", "let K = 1"));
        let entries = store.fetch_tiers("Wind.strata").unwrap();
        let tiers: Vec<_> = entries.iter().map(|e| e.tier.name.as_str()).collect();
        assert_eq!(tiers, vec!["base", "user"]);
        assert_eq!(entries[0].origin, "mem://base/Wind.strata");
    }

    #[test]
    fn test_directories_are_inferred() {
        let store = MemorySourceStore::new(TierSet::default());
        store.put("site", "Wind/Speed.strata", "let S = 1");
        let entries = store.fetch_tiers("Wind").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_directory());
        assert_eq!(entries[0].tier.name, "site");
        assert!(store.fetch_tiers("Win").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_tier_and_remove() {
        let store = MemorySourceStore::new(TierSet::default());
        assert!(!store.put("nope", "A.strata", ""));
        store.put("base", "A.strata", "");
        assert!(store.remove("base", "A.strata"));
        assert!(!store.remove("base", "A.strata"));
        assert!(store.paths().is_empty());
    }
}
