use std::sync::Arc;

use strata_cache::{ModuleCache, ModuleKind, ResolvedModule};
use strata_core::{ModuleName, Result, SourceStore, SourceUnit, SourcesConfig, StrataError};
use strata_lang::{Namespace, Provenance, SourceExecutor};
use tracing::{debug, error, info};

/// How logical names map onto store paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLayout {
    pub extension: String,
    pub package_init: String,
}

impl Default for SourceLayout {
    fn default() -> Self {
        Self {
            extension: "strata".to_string(),
            package_init: "__init__".to_string(),
        }
    }
}

impl SourceLayout {
    pub fn from_config(config: &SourcesConfig) -> Self {
        Self {
            extension: config.extension.clone(),
            package_init: config.package_init.clone(),
        }
    }

    /// `A/B.strata`
    pub fn regular_path(&self, name: &ModuleName) -> String {
        format!("{}.{}", name.to_path(), self.extension)
    }

    /// `A/B/__init__.strata`
    pub fn package_path(&self, name: &ModuleName) -> String {
        format!("{}/{}.{}", name.to_path(), self.package_init, self.extension)
    }

    /// `A/B`
    pub fn directory_path(&self, name: &ModuleName) -> String {
        name.to_path()
    }
}

enum Located {
    Units(ModuleKind, Vec<SourceUnit>),
    Directories(Vec<Provenance>),
}

/// Merges every tier's source for a module into one namespace and caches the
/// result by logical name.
pub struct TieredModuleResolver {
    store: Arc<dyn SourceStore>,
    executor: Arc<dyn SourceExecutor>,
    cache: Arc<ModuleCache>,
    layout: SourceLayout,
}

impl TieredModuleResolver {
    pub fn new(
        store: Arc<dyn SourceStore>,
        executor: Arc<dyn SourceExecutor>,
        cache: Arc<ModuleCache>,
    ) -> Self {
        Self {
            store,
            executor,
            cache,
            layout: SourceLayout::default(),
        }
    }

    pub fn with_layout(mut self, layout: SourceLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn cache(&self) -> &Arc<ModuleCache> {
        &self.cache
    }

    pub fn executor(&self) -> &Arc<dyn SourceExecutor> {
        &self.executor
    }

    pub fn store(&self) -> &Arc<dyn SourceStore> {
        &self.store
    }

    pub fn layout(&self) -> &SourceLayout {
        &self.layout
    }

    /// Returns the cached module, loading and caching it on a miss.
    pub fn resolve(&self, name: &ModuleName) -> Result<Arc<ResolvedModule>> {
        if let Some(module) = self.cache.get(name) {
            return Ok(module);
        }
        let module = self.load(name)?;
        Ok(self.cache.insert(module))
    }

    /// Loads from the store regardless of the cache and replaces the entry.
    pub fn reload(&self, name: &ModuleName) -> Result<Arc<ResolvedModule>> {
        let module = self.load(name)?;
        Ok(self.cache.insert(module))
    }

    pub fn evict(&self, name: &ModuleName) -> bool {
        self.cache.evict(name).is_some()
    }

    /// Fetches and executes every tier into a fresh namespace without
    /// touching the cache.
    pub fn load(&self, name: &ModuleName) -> Result<ResolvedModule> {
        match self.locate(name)? {
            Located::Directories(sources) => {
                debug!(module = %name, tiers = sources.len(), "resolved virtual package");
                Ok(ResolvedModule::new(
                    name.clone(),
                    ModuleKind::VirtualPackage,
                    Namespace::new(),
                    sources,
                ))
            }
            Located::Units(kind, units) => {
                let mut namespace = Namespace::new();
                let mut sources = Vec::with_capacity(units.len());
                for unit in &units {
                    self.executor
                        .execute(unit, &mut namespace)
                        .map_err(|source| {
                            error!(
                                module = %name,
                                tier = %unit.tier,
                                origin = %unit.origin,
                                trace = %source.format_trace(),
                                "failed to execute module source"
                            );
                            StrataError::Execution {
                                module: name.clone(),
                                tier: unit.tier.clone(),
                                origin: unit.origin.to_string(),
                                source,
                            }
                        })?;
                    sources.push(Provenance::new(unit.tier.clone(), unit.origin.clone()));
                }
                info!(
                    module = %name,
                    tiers = sources.len(),
                    symbols = namespace.len(),
                    "resolved module"
                );
                Ok(ResolvedModule::new(name.clone(), kind, namespace, sources))
            }
        }
    }

    fn locate(&self, name: &ModuleName) -> Result<Located> {
        let regular = self.units(&self.layout.regular_path(name))?;
        if !regular.is_empty() {
            return Ok(Located::Units(ModuleKind::Regular, regular));
        }

        let package = self.units(&self.layout.package_path(name))?;
        if !package.is_empty() {
            return Ok(Located::Units(ModuleKind::Package, package));
        }

        let directories: Vec<Provenance> = self
            .store
            .fetch_tiers(&self.layout.directory_path(name))?
            .into_iter()
            .filter(|entry| entry.is_directory())
            .map(|entry| Provenance::new(entry.tier, entry.origin))
            .collect();
        if !directories.is_empty() {
            return Ok(Located::Directories(directories));
        }

        Err(StrataError::SourceNotFound(name.clone()))
    }

    fn units(&self, path: &str) -> Result<Vec<SourceUnit>> {
        let mut units: Vec<SourceUnit> = self
            .store
            .fetch_tiers(path)?
            .into_iter()
            .filter_map(|entry| entry.into_unit(path))
            .collect();
        units.sort_by(|a, b| a.tier.cmp(&b.tier));
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySourceStore;
    use strata_core::TierSet;
    use strata_lang::{ScriptEngine, Symbol, Value};

    fn setup() -> (Arc<MemorySourceStore>, TieredModuleResolver) {
        let store = Arc::new(MemorySourceStore::new(TierSet::default()));
        let resolver = TieredModuleResolver::new(
            store.clone(),
            Arc::new(ScriptEngine::new()),
            Arc::new(ModuleCache::new()),
        );
        (store, resolver)
    }

    fn name(s: &str) -> ModuleName {
        ModuleName::parse(s).unwrap()
    }

    #[test]
    fn test_regular_file_wins_over_package() {
        let (store, resolver) = setup();
        store.put("base", "Wind.strata", "let KIND = \"regular\"");
        store.put("base", "Wind/__init__.strata", "let KIND = \"package\"");
        let module = resolver.resolve(&name("Wind")).unwrap();
        assert_eq!(module.kind, ModuleKind::Regular);
        assert_eq!(module.namespace.value("KIND"), Some(Value::from("regular")));
    }

    #[test]
    fn test_package_init() {
        let (store, resolver) = setup();
        store.put("site", "Wind/__init__.strata", "let KIND = \"package\"");
        let module = resolver.resolve(&name("Wind")).unwrap();
        assert_eq!(module.kind, ModuleKind::Package);
    }

    #[test]
    fn test_missing_module() {
        let (_, resolver) = setup();
        let err = resolver.resolve(&name("Nope")).unwrap_err();
        assert!(matches!(err, StrataError::SourceNotFound(_)));
    }

    #[test]
    fn test_execution_failure_caches_nothing() {
        let (store, resolver) = setup();
        store.put("base", "Bad.strata", "let K = 1");
        store.put("site", "Bad.strata", "raise \"site misconfigured\"");
        let err = resolver.resolve(&name("Bad")).unwrap_err();
        match err {
            StrataError::Execution { tier, origin, .. } => {
                assert_eq!(tier.name, "site");
                assert_eq!(origin, "mem://site/Bad.strata");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!resolver.cache().contains(&name("Bad")));
    }

    #[test]
    fn test_resolve_is_a_cache_hit() {
        let (store, resolver) = setup();
        store.put("base", "A.strata", "fn f() { return 1 }");
        let first = resolver.resolve(&name("A")).unwrap();
        let second = resolver.resolve(&name("A")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolver.cache().stats().hits, 1);
    }

    #[test]
    fn test_load_bypasses_cache() {
        let (store, resolver) = setup();
        store.put("base", "A.strata", "let K = 1");
        resolver.resolve(&name("A")).unwrap();
        store.put("base", "A.strata", "let K = 2");
        let fresh = resolver.load(&name("A")).unwrap();
        assert_eq!(fresh.namespace.value("K"), Some(Value::Number(2.0)));
        let cached = resolver.resolve(&name("A")).unwrap();
        assert_eq!(cached.namespace.value("K"), Some(Value::Number(1.0)));
    }

    #[test]
    fn test_provenance_per_binding() {
        let (store, resolver) = setup();
        store.put("base", "A.strata", "fn f() { return 1 }\nlet K = 10");
        store.put("user", "A.strata", "let K = 30");
        let module = resolver.resolve(&name("A")).unwrap();
        assert_eq!(module.provenance("K").unwrap().tier.name, "user");
        assert_eq!(module.provenance("f").unwrap().tier.name, "base");
        assert!(matches!(module.symbol("f"), Some(Symbol::Function(_))));
        assert_eq!(module.origins(), vec!["mem://base/A.strata", "mem://user/A.strata"]);
    }
}
