use std::{collections::BTreeSet, sync::Arc};

use parking_lot::Mutex;
use strata_core::ModuleName;
use tracing::{debug, info};

use crate::cache::{LoadObserver, ModuleCache, ObserverId};
use crate::module::ResolvedModule;

struct ImportRecorder {
    managed_root: String,
    imported: Mutex<BTreeSet<ModuleName>>,
}

impl LoadObserver for ImportRecorder {
    fn on_load(&self, module: &ResolvedModule) {
        let managed = module
            .sources
            .iter()
            .any(|p| under_root(&p.origin, &self.managed_root));
        if managed {
            self.imported.lock().insert(module.name.clone());
        }
    }
}

/// Whether `origin` lies under `root` on a path component boundary, so that
/// `/srv/scripts` does not claim `/srv/scripts-old/X.strata`.
fn under_root(origin: &str, root: &str) -> bool {
    let is_separator = |c: char| c == '/' || c == std::path::MAIN_SEPARATOR;
    match origin.strip_prefix(root) {
        Some(rest) => {
            root.is_empty()
                || rest.is_empty()
                || root.ends_with(is_separator)
                || rest.starts_with(is_separator)
        }
        None => false,
    }
}

/// Tracks modules loaded from under a managed root during one batch so they
/// can be evicted afterwards. Names cached before the scope began are never
/// evicted.
pub struct RollbackScope {
    cache: Arc<ModuleCache>,
    recorder: Arc<ImportRecorder>,
    snapshot: BTreeSet<ModuleName>,
    observer: ObserverId,
}

impl RollbackScope {
    pub fn begin(cache: Arc<ModuleCache>, managed_root: impl Into<String>) -> Self {
        let recorder = Arc::new(ImportRecorder {
            managed_root: managed_root.into(),
            imported: Mutex::new(BTreeSet::new()),
        });
        let (snapshot, observer) = cache.snapshot_and_observe(recorder.clone());
        debug!(
            managed_root = %recorder.managed_root,
            preexisting = snapshot.len(),
            "rollback scope started"
        );
        Self {
            cache,
            recorder,
            snapshot,
            observer,
        }
    }

    pub fn managed_root(&self) -> &str {
        &self.recorder.managed_root
    }

    /// Names cached when the scope began.
    pub fn snapshot(&self) -> &BTreeSet<ModuleName> {
        &self.snapshot
    }

    /// Managed names loaded since the scope began (or since the last rollback).
    pub fn imported(&self) -> BTreeSet<ModuleName> {
        self.recorder.imported.lock().clone()
    }

    /// Evicts every recorded name absent from the snapshot and clears the
    /// record. Returns the names actually evicted.
    pub fn rollback(&self) -> Vec<ModuleName> {
        let recorded = std::mem::take(&mut *self.recorder.imported.lock());
        let fresh: Vec<&ModuleName> = recorded
            .iter()
            .filter(|name| !self.snapshot.contains(*name))
            .collect();
        let evicted = self.cache.evict_all(fresh);
        if !evicted.is_empty() {
            info!(count = evicted.len(), "rolled back newly imported modules");
        }
        evicted
    }
}

impl Drop for RollbackScope {
    fn drop(&mut self) {
        self.cache.remove_observer(self.observer);
    }
}

impl std::fmt::Debug for RollbackScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackScope")
            .field("managed_root", &self.recorder.managed_root)
            .field("snapshot", &self.snapshot.len())
            .finish()
    }
}
