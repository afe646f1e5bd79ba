use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Arc,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use strata_cache::{ResolvedModule, RollbackScope};
use strata_core::{ImportErrorRecord, ModuleName, RegistryConfig, Result, StrataError};
use strata_lang::{ClassDef, Instance, Kwargs, SourceExecutor};
use tracing::{debug, error, info, warn};

use crate::discovery::{collect_script_files, DiscoveryConfig};
use crate::resolver::TieredModuleResolver;

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub exclude_suffixes: Vec<String>,
    pub invalidate_on_reload: bool,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            exclude_suffixes: vec!["Interface".to_string()],
            invalidate_on_reload: true,
        }
    }
}

impl From<&RegistryConfig> for RegistryOptions {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            exclude_suffixes: config.exclude_suffixes.clone(),
            invalidate_on_reload: config.invalidate_on_reload,
        }
    }
}

/// An object built from a resolved module's class, owned by the registry.
#[derive(Debug, Clone)]
pub struct LiveInstance {
    pub class_name: String,
    pub instance: Arc<Instance>,
    /// The module the instance was built from; its generation identifies
    /// which load the class definitions came from.
    pub module: Arc<ResolvedModule>,
}

impl LiveInstance {
    pub fn generation(&self) -> u64 {
        self.module.generation
    }
}

/// Outcome of a bulk reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    pub reloaded: Vec<ModuleName>,
    pub removed: Vec<ModuleName>,
    pub failed: Vec<ModuleName>,
}

impl ReloadReport {
    pub fn is_empty(&self) -> bool {
        self.reloaded.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }

    pub fn merge(&mut self, other: ReloadReport) {
        self.reloaded.extend(other.reloaded);
        self.removed.extend(other.removed);
        self.failed.extend(other.failed);
    }
}

#[derive(Default)]
struct RegistryState {
    scripts: Vec<ModuleName>,
    instances: HashMap<ModuleName, LiveInstance>,
}

impl RegistryState {
    fn track(&mut self, name: &ModuleName) {
        if !self.scripts.contains(name) {
            self.scripts.push(name.clone());
        }
    }

    fn untrack(&mut self, name: &ModuleName) -> bool {
        let before = self.scripts.len();
        self.scripts.retain(|n| n != name);
        self.scripts.len() != before
    }
}

/// Discovers, loads, instantiates and reloads scripts, keeping at most one
/// live instance per module name.
///
/// Lock order: per-name lock, then the registry state lock. Every cache load
/// or eviction happens under the state lock, so a rollback scope never races
/// a load. Module top-level code therefore runs with the state lock held;
/// `init` and method bodies run under the per-name lock only.
pub struct InstanceRegistry {
    resolver: Arc<TieredModuleResolver>,
    options: RegistryOptions,
    state: Mutex<RegistryState>,
    name_locks: DashMap<ModuleName, Arc<Mutex<()>>>,
    import_errors: Mutex<Vec<ImportErrorRecord>>,
}

impl InstanceRegistry {
    pub fn new(resolver: Arc<TieredModuleResolver>, options: RegistryOptions) -> Self {
        Self {
            resolver,
            options,
            state: Mutex::new(RegistryState::default()),
            name_locks: DashMap::new(),
            import_errors: Mutex::new(Vec::new()),
        }
    }

    pub fn resolver(&self) -> &Arc<TieredModuleResolver> {
        &self.resolver
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    fn executor(&self) -> &Arc<dyn SourceExecutor> {
        self.resolver.executor()
    }

    fn name_lock(&self, name: &ModuleName) -> Arc<Mutex<()>> {
        self.name_locks.entry(name.clone()).or_default().clone()
    }

    /// Drops the per-name lock entry unless another caller holds a clone.
    fn release_name_lock(&self, name: &ModuleName) {
        self.name_locks
            .remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Resolves `name` under the state lock. The caller holds the name lock.
    fn load(&self, name: &ModuleName) -> Result<Arc<ResolvedModule>> {
        let _state = self.state.lock();
        self.resolver.resolve(name)
    }

    /// Cached module for `name`, loading it if needed. A name loaded here is
    /// cached but not tracked, and an active rollback scope records it.
    fn loaded(&self, name: &ModuleName) -> Result<Arc<ResolvedModule>> {
        if let Some(module) = self.resolver.cache().get(name) {
            return Ok(module);
        }
        let lock = self.name_lock(name);
        let _guard = lock.lock();
        self.load(name)
    }

    fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            extension: self.resolver.layout().extension.clone(),
            exclude_suffixes: self.options.exclude_suffixes.clone(),
            exclude_patterns: Vec::new(),
        }
    }

    /// Imports every script found directly inside each path. Missing paths
    /// are created. Failures become import error records and never stop the
    /// batch. Returns the names that were added.
    pub fn import_modules(&self, paths: &[PathBuf]) -> Vec<ModuleName> {
        let config = self.discovery_config();
        let mut added = Vec::new();
        for path in paths {
            if !path.exists() {
                info!("Creating missing script directory: {:?}", path);
                if let Err(e) = fs::create_dir_all(path) {
                    warn!("Could not create script directory {:?}: {}", path, e);
                }
                continue;
            }
            let scripts = match collect_script_files(path, &config) {
                Ok(scripts) => scripts,
                Err(e) => {
                    error!("Failed to list scripts in {:?}: {}", path, e);
                    self.add_import_error(ImportErrorRecord::from_error(
                        path.display().to_string(),
                        &e,
                    ));
                    continue;
                }
            };
            for (file, stem) in scripts {
                let result = ModuleName::parse(&stem).and_then(|name| {
                    self.add_module(&name)?;
                    Ok(name)
                });
                match result {
                    Ok(name) => added.push(name),
                    Err(e) => {
                        error!(
                            module = %stem,
                            file = %file.display(),
                            error = %e,
                            "failed to import script"
                        );
                        self.add_import_error(ImportErrorRecord::from_error(stem, &e));
                    }
                }
            }
        }
        added
    }

    /// Evicts any cached state for `name`, resolves it afresh and tracks it.
    pub fn add_module(&self, name: &ModuleName) -> Result<Arc<ResolvedModule>> {
        let lock = self.name_lock(name);
        let _guard = lock.lock();
        let mut state = self.state.lock();

        if self.resolver.evict(name) {
            debug!(module = %name, "evicted stale module before add");
        }
        if self.options.invalidate_on_reload {
            state.instances.remove(name);
        }
        let module = self.resolver.resolve(name)?;
        state.track(name);
        info!(module = %name, generation = module.generation, "added module");
        Ok(module)
    }

    /// Drops the live instance, evicts the module and stops tracking it.
    pub fn remove_module(&self, name: &ModuleName) {
        {
            let lock = self.name_lock(name);
            let _guard = lock.lock();
            let mut state = self.state.lock();

            let had_instance = state.instances.remove(name).is_some();
            let evicted = self.resolver.evict(name);
            let tracked = state.untrack(name);
            if had_instance || evicted || tracked {
                info!(module = %name, "removed module");
            }
        }
        self.release_name_lock(name);
    }

    /// Rebuilds a cached module from every tier. Does nothing for a module
    /// that is not cached.
    pub fn reload_module(&self, name: &ModuleName) -> Result<()> {
        let lock = self.name_lock(name);
        let _guard = lock.lock();
        let mut state = self.state.lock();

        if !self.resolver.cache().contains(name) {
            debug!(module = %name, "reload skipped, module not loaded");
            return Ok(());
        }
        self.refresh(&mut state, name)
    }

    fn refresh(&self, state: &mut RegistryState, name: &ModuleName) -> Result<()> {
        match self.resolver.reload(name) {
            Ok(module) => {
                if self.options.invalidate_on_reload && state.instances.remove(name).is_some() {
                    debug!(module = %name, "dropped live instance after reload");
                }
                debug!(module = %name, generation = module.generation, "reloaded module");
                Ok(())
            }
            Err(StrataError::SourceNotFound(_)) => {
                self.resolver.evict(name);
                Err(StrataError::ModuleVanished(name.clone()))
            }
            Err(e) => {
                self.resolver.evict(name);
                Err(e)
            }
        }
    }

    /// Reloads every tracked module. Vanished modules are removed; other
    /// failures are logged and recorded as import errors.
    pub fn reload_modules(&self) -> ReloadReport {
        let names = self.scripts();
        let mut report = ReloadReport::default();
        for name in names {
            let result = {
                let lock = self.name_lock(&name);
                let _guard = lock.lock();
                let mut state = self.state.lock();
                self.refresh(&mut state, &name)
            };
            match result {
                Ok(()) => report.reloaded.push(name),
                Err(StrataError::ModuleVanished(_)) => {
                    warn!(module = %name, "module no longer exists, removing it");
                    self.remove_module(&name);
                    report.removed.push(name);
                }
                Err(e) => {
                    error!(module = %name, error = %e, "failed to reload module");
                    self.add_import_error(ImportErrorRecord::from_error(name.to_string(), &e));
                    report.failed.push(name);
                }
            }
        }
        info!(
            reloaded = report.reloaded.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "reloaded modules"
        );
        report
    }

    /// Builds the single live instance for `name` from `class`, replacing any
    /// previous one. Loads `name` if it is not cached, without tracking it.
    ///
    /// `init` runs under the per-name lock only, so a slow constructor does
    /// not block operations on other names.
    pub fn instantiate(&self, name: &ModuleName, class: &str, kwargs: &Kwargs) -> Result<()> {
        let lock = self.name_lock(name);
        let _guard = lock.lock();

        let module = self.load(name)?;
        let class_def = Self::find_class(&module, class)?;
        let instance = self
            .executor()
            .construct(&class_def, kwargs, &module.namespace)?;
        self.state.lock().instances.insert(
            name.clone(),
            LiveInstance {
                class_name: class.to_string(),
                instance,
                module: module.clone(),
            },
        );
        debug!(module = %name, class = %class, generation = module.generation, "instantiated");
        Ok(())
    }

    /// Invokes `method` on the live instance of `name`, which must have been
    /// built from `class`. The method body runs under the per-name lock only.
    pub fn run_method(
        &self,
        name: &ModuleName,
        class: &str,
        method: &str,
        kwargs: &Kwargs,
    ) -> Result<serde_json::Value> {
        let lock = self.name_lock(name);
        let _guard = lock.lock();

        let live = self
            .state
            .lock()
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| StrataError::NotInstantiated(name.clone()))?;
        if live.class_name != class {
            return Err(StrataError::ClassNotFound {
                module: name.clone(),
                class: class.to_string(),
                origins: live.module.origin_summary(),
            });
        }
        if !live.instance.class.has_method(method) {
            return Err(StrataError::MethodNotFound {
                module: name.clone(),
                class: class.to_string(),
                method: method.to_string(),
            });
        }
        let result = self
            .executor()
            .invoke(&live.instance, method, kwargs, &live.module.namespace)?;
        Ok(result)
    }

    /// Introspection loads `name` like `instantiate` does when it is not
    /// cached yet.
    pub fn has_method(&self, name: &ModuleName, class: &str, method: &str) -> Result<bool> {
        let module = self.loaded(name)?;
        Ok(Self::find_class(&module, class)?.has_method(method))
    }

    /// Declared parameter names, without the implicit receiver.
    pub fn method_args(&self, name: &ModuleName, class: &str, method: &str) -> Result<Vec<String>> {
        let module = self.loaded(name)?;
        let class_def = Self::find_class(&module, class)?;
        class_def
            .method(method)
            .map(|def| def.param_names())
            .ok_or_else(|| StrataError::MethodNotFound {
                module: name.clone(),
                class: class.to_string(),
                method: method.to_string(),
            })
    }

    pub fn method_info(&self, name: &ModuleName, class: &str, method: &str) -> Result<Option<String>> {
        let module = self.loaded(name)?;
        let class_def = Self::find_class(&module, class)?;
        class_def
            .method(method)
            .map(|def| def.doc.clone())
            .ok_or_else(|| StrataError::MethodNotFound {
                module: name.clone(),
                class: class.to_string(),
                method: method.to_string(),
            })
    }

    fn find_class(module: &ResolvedModule, class: &str) -> Result<Arc<ClassDef>> {
        module
            .class(class)
            .cloned()
            .ok_or_else(|| StrataError::ClassNotFound {
                module: module.name.clone(),
                class: class.to_string(),
                origins: module.origin_summary(),
            })
    }

    pub fn is_instantiated(&self, name: &ModuleName) -> bool {
        self.state.lock().instances.contains_key(name)
    }

    pub fn live_instance(&self, name: &ModuleName) -> Option<LiveInstance> {
        self.state.lock().instances.get(name).cloned()
    }

    /// Tracked module names in the order they were first added.
    pub fn scripts(&self) -> Vec<ModuleName> {
        self.state.lock().scripts.clone()
    }

    /// Resolves `name` through the cache without tracking it.
    pub fn module(&self, name: &ModuleName) -> Result<Arc<ResolvedModule>> {
        self.loaded(name)
    }

    #[cfg(test)]
    fn name_lock_count(&self) -> usize {
        self.name_locks.len()
    }

    /// Returns and clears the accumulated import errors.
    pub fn import_errors(&self) -> Vec<ImportErrorRecord> {
        std::mem::take(&mut *self.import_errors.lock())
    }

    pub fn add_import_error(&self, record: ImportErrorRecord) {
        self.import_errors.lock().push(record);
    }

    /// Starts recording modules loaded from under `managed_root`.
    pub fn track_imports(&self, managed_root: impl Into<String>) -> RollbackScope {
        let _state = self.state.lock();
        RollbackScope::begin(self.resolver.cache().clone(), managed_root)
    }

    /// Evicts what `scope` recorded that was not cached when it began.
    pub fn rollback(&self, scope: &RollbackScope) -> Vec<ModuleName> {
        let _state = self.state.lock();
        scope.rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySourceStore;
    use serde_json::json;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::{thread, time::Duration};
    use strata_cache::ModuleCache;
    use strata_core::{ScriptError, SourceUnit, TierSet};
    use strata_lang::{Namespace, ScriptEngine};

    fn registry_with(options: RegistryOptions) -> (Arc<MemorySourceStore>, InstanceRegistry) {
        let store = Arc::new(MemorySourceStore::new(TierSet::default()));
        let resolver = Arc::new(TieredModuleResolver::new(
            store.clone(),
            Arc::new(ScriptEngine::new()),
            Arc::new(ModuleCache::new()),
        ));
        (store, InstanceRegistry::new(resolver, options))
    }

    fn name(s: &str) -> ModuleName {
        ModuleName::parse(s).unwrap()
    }

    fn kwargs(value: serde_json::Value) -> Kwargs {
        value.as_object().cloned().unwrap_or_default()
    }

    const COUNTER: &str = r#"
class Counter {
    "Counts things."
    fn init(start = 0) { self.n = start }
    fn bump(by = 1) "Adds to the count." { self.n = self.n + by  return self.n }
}
"#;

    #[test]
    fn test_instantiate_and_run() {
        let (store, registry) = registry_with(RegistryOptions::default());
        store.put("base", "Counter.strata", COUNTER);
        registry.add_module(&name("Counter")).unwrap();
        registry
            .instantiate(&name("Counter"), "Counter", &kwargs(json!({"start": 5})))
            .unwrap();
        assert!(registry.is_instantiated(&name("Counter")));
        let n = registry
            .run_method(&name("Counter"), "Counter", "bump", &kwargs(json!({"by": 2})))
            .unwrap();
        assert_eq!(n, json!(7.0));
        let n = registry
            .run_method(&name("Counter"), "Counter", "bump", &Kwargs::new())
            .unwrap();
        assert_eq!(n, json!(8.0));
    }

    #[test]
    fn test_run_method_errors() {
        let (store, registry) = registry_with(RegistryOptions::default());
        store.put("base", "Counter.strata", COUNTER);
        let counter = name("Counter");

        let err = registry
            .run_method(&counter, "Counter", "bump", &Kwargs::new())
            .unwrap_err();
        assert!(matches!(err, StrataError::NotInstantiated(_)));

        registry.instantiate(&counter, "Counter", &Kwargs::new()).unwrap();
        let err = registry
            .run_method(&counter, "Other", "bump", &Kwargs::new())
            .unwrap_err();
        assert!(matches!(err, StrataError::ClassNotFound { .. }));

        let err = registry
            .run_method(&counter, "Counter", "nope", &Kwargs::new())
            .unwrap_err();
        assert!(matches!(err, StrataError::MethodNotFound { .. }));

        let err = registry
            .run_method(&counter, "Counter", "bump", &kwargs(json!({"by": "x"})))
            .unwrap_err();
        assert!(matches!(err, StrataError::Script(_)));
    }

    #[test]
    fn test_class_not_found_names_origins() {
        let (store, registry) = registry_with(RegistryOptions::default());
        store.put("base", "Counter.strata", COUNTER);
        let err = registry
            .instantiate(&name("Counter"), "Missing", &Kwargs::new())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("mem://base/Counter.strata"), "{message}");
        assert!(message.contains("Missing"));
    }

    #[test]
    fn test_introspection() {
        let (store, registry) = registry_with(RegistryOptions::default());
        store.put("base", "Counter.strata", COUNTER);
        let counter = name("Counter");
        assert!(registry.has_method(&counter, "Counter", "bump").unwrap());
        assert!(!registry.has_method(&counter, "Counter", "nope").unwrap());
        assert_eq!(
            registry.method_args(&counter, "Counter", "bump").unwrap(),
            vec!["by"]
        );
        assert_eq!(
            registry.method_info(&counter, "Counter", "bump").unwrap().as_deref(),
            Some("Adds to the count.")
        );
        assert_eq!(registry.method_info(&counter, "Counter", "init").unwrap(), None);
    }

    #[test]
    fn test_reload_drops_instance_by_default() {
        let (store, registry) = registry_with(RegistryOptions::default());
        store.put("base", "Counter.strata", COUNTER);
        let counter = name("Counter");
        registry.add_module(&counter).unwrap();
        registry.instantiate(&counter, "Counter", &Kwargs::new()).unwrap();
        registry.reload_module(&counter).unwrap();
        assert!(!registry.is_instantiated(&counter));
    }

    #[test]
    fn test_reload_keeps_stale_instance_when_configured() {
        let (store, registry) = registry_with(RegistryOptions {
            invalidate_on_reload: false,
            ..RegistryOptions::default()
        });
        store.put("base", "Counter.strata", COUNTER);
        let counter = name("Counter");
        registry.add_module(&counter).unwrap();
        registry.instantiate(&counter, "Counter", &Kwargs::new()).unwrap();
        let before = registry.live_instance(&counter).unwrap().generation();
        registry.reload_module(&counter).unwrap();
        let live = registry.live_instance(&counter).unwrap();
        assert_eq!(live.generation(), before);
        assert!(registry.module(&counter).unwrap().generation > before);
    }

    #[test]
    fn test_reload_of_uncached_module_is_noop() {
        let (_, registry) = registry_with(RegistryOptions::default());
        registry.reload_module(&name("Ghost")).unwrap();
    }

    #[test]
    fn test_reload_vanished_module() {
        let (store, registry) = registry_with(RegistryOptions::default());
        store.put("base", "Gone.strata", "let K = 1");
        let gone = name("Gone");
        registry.add_module(&gone).unwrap();
        store.remove("base", "Gone.strata");
        let err = registry.reload_module(&gone).unwrap_err();
        assert!(matches!(err, StrataError::ModuleVanished(_)));
        assert!(!registry.resolver().cache().contains(&gone));
    }

    #[test]
    fn test_reload_failure_evicts_stale_entry() {
        let (store, registry) = registry_with(RegistryOptions::default());
        store.put("base", "Flaky.strata", "let K = 1");
        let flaky = name("Flaky");
        registry.add_module(&flaky).unwrap();
        store.put("base", "Flaky.strata", "raise \"broken\"");
        let err = registry.reload_module(&flaky).unwrap_err();
        assert!(matches!(err, StrataError::Execution { .. }));
        assert!(!registry.resolver().cache().contains(&flaky));
    }

    #[test]
    fn test_scripts_keep_insertion_order_without_duplicates() {
        let (store, registry) = registry_with(RegistryOptions::default());
        store.put("base", "B.strata", "");
        store.put("base", "A.strata", "");
        registry.add_module(&name("B")).unwrap();
        registry.add_module(&name("A")).unwrap();
        registry.add_module(&name("B")).unwrap();
        assert_eq!(registry.scripts(), vec![name("B"), name("A")]);
        registry.remove_module(&name("B"));
        assert_eq!(registry.scripts(), vec![name("A")]);
        registry.remove_module(&name("Never"));
    }

    #[test]
    fn test_self_referencing_result_is_rendered() {
        let (store, registry) = registry_with(RegistryOptions::default());
        store.put(
            "base",
            "Loop.strata",
            "class Loop { fn init() { self.me = self } fn get() { return self } }",
        );
        let looped = name("Loop");
        registry.instantiate(&looped, "Loop", &Kwargs::new()).unwrap();
        let value = registry
            .run_method(&looped, "Loop", "get", &Kwargs::new())
            .unwrap();
        assert_eq!(value, json!({"me": "<Loop instance>"}));
    }

    #[test]
    fn test_introspection_caches_without_tracking() {
        let (store, registry) = registry_with(RegistryOptions::default());
        store.put("base", "Counter.strata", COUNTER);
        let counter = name("Counter");
        let scope = registry.track_imports("mem://");

        assert!(registry.has_method(&counter, "Counter", "bump").unwrap());
        assert!(registry.resolver().cache().contains(&counter));
        assert!(registry.scripts().is_empty());
        assert!(scope.imported().contains(&counter));

        assert_eq!(registry.rollback(&scope), vec![counter.clone()]);
        assert!(!registry.resolver().cache().contains(&counter));
    }

    #[test]
    fn test_remove_module_releases_name_lock() {
        let (store, registry) = registry_with(RegistryOptions::default());
        store.put("base", "A.strata", "let K = 1");
        store.put("base", "B.strata", "let K = 1");
        registry.add_module(&name("A")).unwrap();
        registry.add_module(&name("B")).unwrap();
        assert_eq!(registry.name_lock_count(), 2);

        registry.remove_module(&name("A"));
        registry.remove_module(&name("Never"));
        assert_eq!(registry.name_lock_count(), 1);

        let held = registry.name_lock(&name("B"));
        registry.remove_module(&name("B"));
        assert_eq!(registry.name_lock_count(), 1);
        drop(held);
        registry.remove_module(&name("B"));
        assert_eq!(registry.name_lock_count(), 0);
    }

    /// Parks `init` of class `Slow` and method `hold` until released.
    struct GatedEngine {
        inner: ScriptEngine,
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl GatedEngine {
        fn park(&self) {
            let _ = self.entered.send(());
            let _ = self.release.recv_timeout(Duration::from_secs(10));
        }
    }

    impl SourceExecutor for GatedEngine {
        fn execute(
            &self,
            unit: &SourceUnit,
            namespace: &mut Namespace,
        ) -> std::result::Result<(), ScriptError> {
            self.inner.execute(unit, namespace)
        }

        fn construct(
            &self,
            class: &Arc<ClassDef>,
            kwargs: &Kwargs,
            globals: &Namespace,
        ) -> std::result::Result<Arc<Instance>, ScriptError> {
            if class.name == "Slow" {
                self.park();
            }
            self.inner.construct(class, kwargs, globals)
        }

        fn invoke(
            &self,
            instance: &Arc<Instance>,
            method: &str,
            kwargs: &Kwargs,
            globals: &Namespace,
        ) -> std::result::Result<serde_json::Value, ScriptError> {
            if method == "hold" {
                self.park();
            }
            self.inner.invoke(instance, method, kwargs, globals)
        }
    }

    #[test]
    fn test_hosted_code_does_not_block_other_names() {
        let (entered_tx, entered) = unbounded();
        let (release, release_rx) = unbounded();
        let store = Arc::new(MemorySourceStore::new(TierSet::default()));
        let engine = GatedEngine {
            inner: ScriptEngine::new(),
            entered: entered_tx,
            release: release_rx,
        };
        let resolver = Arc::new(TieredModuleResolver::new(
            store.clone(),
            Arc::new(engine),
            Arc::new(ModuleCache::new()),
        ));
        let registry = Arc::new(InstanceRegistry::new(resolver, RegistryOptions::default()));
        store.put("base", "Busy.strata", "class Busy { fn hold() { return 1 } }");
        store.put("base", "Slow.strata", "class Slow { fn init() { self.ok = true } }");
        store.put("base", "Counter.strata", COUNTER);
        let busy = name("Busy");
        registry.instantiate(&busy, "Busy", &Kwargs::new()).unwrap();

        let running = {
            let registry = registry.clone();
            let busy = busy.clone();
            thread::spawn(move || registry.run_method(&busy, "Busy", "hold", &Kwargs::new()))
        };
        entered.recv_timeout(Duration::from_secs(5)).unwrap();
        let building = {
            let registry = registry.clone();
            thread::spawn(move || registry.instantiate(&name("Slow"), "Slow", &Kwargs::new()))
        };
        entered.recv_timeout(Duration::from_secs(5)).unwrap();

        // Both hosted calls are parked. Other names still make progress.
        let (done_tx, done) = unbounded();
        {
            let registry = registry.clone();
            thread::spawn(move || {
                let counter = name("Counter");
                let result = registry.add_module(&counter).and_then(|_| {
                    registry.instantiate(&counter, "Counter", &Kwargs::new())?;
                    registry.run_method(&counter, "Counter", "bump", &Kwargs::new())
                });
                let _ = done_tx.send((result, registry.scripts()));
            });
        }
        let (result, scripts) = done.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.unwrap(), json!(1.0));
        assert_eq!(scripts, vec![name("Counter")]);

        // The same name waits for the call in flight.
        let (removed_tx, removed) = unbounded();
        {
            let registry = registry.clone();
            let busy = busy.clone();
            thread::spawn(move || {
                registry.remove_module(&busy);
                let _ = removed_tx.send(());
            });
        }
        assert!(removed.recv_timeout(Duration::from_millis(200)).is_err());

        release.send(()).unwrap();
        release.send(()).unwrap();
        assert_eq!(running.join().unwrap().unwrap(), json!(1.0));
        building.join().unwrap().unwrap();
        removed.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(registry.is_instantiated(&name("Slow")));
        assert!(!registry.is_instantiated(&busy));
    }

    #[test]
    fn test_import_error_drain() {
        let (_, registry) = registry_with(RegistryOptions::default());
        registry.add_import_error(ImportErrorRecord::new("X", "X\nboom"));
        assert_eq!(registry.import_errors().len(), 1);
        assert!(registry.import_errors().is_empty());
    }
}
