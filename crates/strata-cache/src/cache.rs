use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::SystemTime,
};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use strata_core::ModuleName;
use tracing::debug;

use crate::module::ResolvedModule;

/// Cache entry metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub module: Arc<ResolvedModule>,
    pub created_at: SystemTime,
    pub last_accessed: SystemTime,
    pub access_count: u64,
}

impl CacheEntry {
    pub fn new(module: Arc<ResolvedModule>) -> Self {
        let now = SystemTime::now();
        Self {
            module,
            created_at: now,
            last_accessed: now,
            access_count: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_accessed = SystemTime::now();
        self.access_count += 1;
    }
}

/// Cache performance statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }
}

/// Notified after every insertion, while the cache is still locked.
pub trait LoadObserver: Send + Sync {
    fn on_load(&self, module: &ResolvedModule);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    insertions: u64,
    evictions: u64,
}

/// Process-wide table of resolved modules keyed by logical name.
///
/// Lock order is always `modules` then `observers`, so a snapshot taken under
/// the modules lock together with an observer registration cannot miss an
/// insertion.
pub struct ModuleCache {
    modules: RwLock<HashMap<ModuleName, CacheEntry>>,
    observers: RwLock<Vec<(ObserverId, Arc<dyn LoadObserver>)>>,
    counters: Mutex<Counters>,
    next_generation: AtomicU64,
    next_observer: AtomicU64,
}

impl Default for ModuleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("entries", &self.modules.read().len())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

impl ModuleCache {
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            counters: Mutex::new(Counters::default()),
            next_generation: AtomicU64::new(1),
            next_observer: AtomicU64::new(1),
        }
    }

    pub fn get(&self, name: &ModuleName) -> Option<Arc<ResolvedModule>> {
        let mut modules = self.modules.write();
        let found = modules.get_mut(name).map(|entry| {
            entry.touch();
            entry.module.clone()
        });
        let mut counters = self.counters.lock();
        if found.is_some() {
            counters.hits += 1;
        } else {
            counters.misses += 1;
        }
        found
    }

    /// Stores `module` under its name with a fresh generation, replacing any
    /// previous entry, then notifies load observers.
    pub fn insert(&self, mut module: ResolvedModule) -> Arc<ResolvedModule> {
        let mut modules = self.modules.write();
        module.generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let module = Arc::new(module);
        modules.insert(module.name.clone(), CacheEntry::new(module.clone()));
        self.counters.lock().insertions += 1;
        debug!(
            module = %module.name,
            generation = module.generation,
            "cached module"
        );

        let observers = self.observers.read();
        for (_, observer) in observers.iter() {
            observer.on_load(&module);
        }
        module
    }

    pub fn evict(&self, name: &ModuleName) -> Option<Arc<ResolvedModule>> {
        let removed = self.modules.write().remove(name).map(|entry| entry.module);
        if removed.is_some() {
            self.counters.lock().evictions += 1;
            debug!(module = %name, "evicted module");
        }
        removed
    }

    /// Evicts each name, returning those that were present.
    pub fn evict_all<'a, I>(&self, names: I) -> Vec<ModuleName>
    where
        I: IntoIterator<Item = &'a ModuleName>,
    {
        let mut modules = self.modules.write();
        let mut evicted = Vec::new();
        for name in names {
            if modules.remove(name).is_some() {
                evicted.push(name.clone());
            }
        }
        self.counters.lock().evictions += evicted.len() as u64;
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted modules");
        }
        evicted
    }

    pub fn clear(&self) {
        let mut modules = self.modules.write();
        let count = modules.len();
        modules.clear();
        self.counters.lock().evictions += count as u64;
    }

    pub fn contains(&self, name: &ModuleName) -> bool {
        self.modules.read().contains_key(name)
    }

    pub fn names(&self) -> BTreeSet<ModuleName> {
        self.modules.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }

    pub fn entry(&self, name: &ModuleName) -> Option<CacheEntry> {
        self.modules.read().get(name).cloned()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.modules.read().len();
        let counters = self.counters.lock();
        CacheStats {
            hits: counters.hits,
            misses: counters.misses,
            insertions: counters.insertions,
            evictions: counters.evictions,
            entries,
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn LoadObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::SeqCst));
        self.observers.write().push((id, observer));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Captures the cached names and registers `observer` with no insertion
    /// able to slip between the two.
    pub fn snapshot_and_observe(
        &self,
        observer: Arc<dyn LoadObserver>,
    ) -> (BTreeSet<ModuleName>, ObserverId) {
        let modules = self.modules.read();
        let snapshot = modules.keys().cloned().collect();
        let id = self.add_observer(observer);
        drop(modules);
        (snapshot, id)
    }
}
