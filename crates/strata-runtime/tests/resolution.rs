use std::sync::Arc;

use serde_json::json;
use strata_cache::{ModuleCache, ModuleKind};
use strata_core::{ModuleName, StrataError, TierSet};
use strata_lang::{Kwargs, ScriptEngine, Value};
use strata_runtime::{InstanceRegistry, MemorySourceStore, RegistryOptions, TieredModuleResolver};

fn name(s: &str) -> ModuleName {
    ModuleName::parse(s).unwrap()
}

fn setup(tiers: &[&str]) -> (Arc<MemorySourceStore>, InstanceRegistry) {
    let store = Arc::new(MemorySourceStore::new(TierSet::from_names(tiers).unwrap()));
    let resolver = Arc::new(TieredModuleResolver::new(
        store.clone(),
        Arc::new(ScriptEngine::new()),
        Arc::new(ModuleCache::new()),
    ));
    (store, InstanceRegistry::new(resolver, RegistryOptions::default()))
}

#[test]
fn test_highest_tier_wins_and_lower_symbols_survive() {
    let (store, registry) = setup(&["A", "B", "C"]);
    store.put("A", "N.strata", "let SHARED = \"a\"\nlet ONLY_A = 1");
    store.put("B", "N.strata", "let MIDDLE = true");
    store.put("C", "N.strata", "let SHARED = \"c\"");

    let module = registry.module(&name("N")).unwrap();
    assert_eq!(module.namespace.value("SHARED"), Some(Value::from("c")));
    assert_eq!(module.namespace.value("ONLY_A"), Some(Value::Number(1.0)));
    assert_eq!(module.namespace.value("MIDDLE"), Some(Value::Bool(true)));
    assert_eq!(module.provenance("SHARED").unwrap().tier.name, "C");
    assert_eq!(module.provenance("ONLY_A").unwrap().tier.name, "A");
    let tiers: Vec<_> = module.tiers().iter().map(|t| t.name.clone()).collect();
    assert_eq!(tiers, vec!["A", "B", "C"]);
}

#[test]
fn test_base_function_sees_site_constant() {
    let (store, registry) = setup(&["base", "site"]);
    store.put("base", "Cfg.strata", "fn f() { return 1 }\nfn k() { return K }\nlet K = 10");
    store.put("site", "Cfg.strata", "let K = 20");

    let module = registry.module(&name("Cfg")).unwrap();
    let engine = ScriptEngine::new();
    assert_eq!(
        engine.call_function(&module.namespace, "f", &Kwargs::new()).unwrap(),
        json!(1.0)
    );
    assert_eq!(module.namespace.value("K"), Some(Value::Number(20.0)));
    assert_eq!(
        engine.call_function(&module.namespace, "k", &Kwargs::new()).unwrap(),
        json!(20.0)
    );
}

#[test]
fn test_single_method_override() {
    let (store, registry) = setup(&["base", "user"]);
    store.put(
        "base",
        "Wind.strata",
        r#"
class Wind {
    fn speed() { return 5 }
    fn label() { return "wind" }
}
"#,
    );
    store.put(
        "user",
        "Wind.strata",
        r#"
class Wind : Wind {
    fn speed() { return 9 }
}
"#,
    );
    let wind = name("Wind");
    registry.instantiate(&wind, "Wind", &Kwargs::new()).unwrap();
    assert_eq!(
        registry.run_method(&wind, "Wind", "speed", &Kwargs::new()).unwrap(),
        json!(9.0)
    );
    assert_eq!(
        registry.run_method(&wind, "Wind", "label", &Kwargs::new()).unwrap(),
        json!("wind")
    );
}

#[test]
fn test_resolve_is_idempotent() {
    let (store, registry) = setup(&["base", "site"]);
    store.put("base", "A.strata", "fn f() { return 1 }\nlet K = 1");
    store.put("site", "A.strata", "let K = 2");

    let first = registry.module(&name("A")).unwrap();
    let second = registry.module(&name("A")).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    let names = |m: &strata_cache::ResolvedModule| {
        m.namespace
            .iter()
            .map(|(n, b)| (n.to_string(), b.provenance.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(names(&first), names(&second));
    assert_eq!(first.generation, second.generation);
}

#[test]
fn test_reload_observes_store_edits() {
    let (store, registry) = setup(&["base", "site"]);
    store.put("base", "A.strata", "let K = 1");
    let a = name("A");
    registry.add_module(&a).unwrap();

    store.put("site", "A.strata", "let K = 2");
    assert_eq!(
        registry.module(&a).unwrap().namespace.value("K"),
        Some(Value::Number(1.0))
    );
    registry.reload_module(&a).unwrap();
    let module = registry.module(&a).unwrap();
    assert_eq!(module.namespace.value("K"), Some(Value::Number(2.0)));
    assert_eq!(module.provenance("K").unwrap().tier.name, "site");
}

#[test]
fn test_remove_then_run_is_not_instantiated() {
    let (store, registry) = setup(&["base"]);
    store.put("base", "Echo.strata", "class Echo { fn ping() { return \"pong\" } }");
    let echo = name("Echo");
    registry.instantiate(&echo, "Echo", &Kwargs::new()).unwrap();
    registry.remove_module(&echo);
    let err = registry
        .run_method(&echo, "Echo", "ping", &Kwargs::new())
        .unwrap_err();
    assert!(matches!(err, StrataError::NotInstantiated(_)));
}

#[test]
fn test_rollback_evicts_only_new_modules() {
    let (store, registry) = setup(&["base"]);
    store.put("base", "X.strata", "let V = 1");
    store.put("base", "Y.strata", "let V = 1");
    let (x, y) = (name("X"), name("Y"));
    registry.module(&y).unwrap();

    let scope = registry.track_imports("mem://");
    registry.module(&x).unwrap();
    registry.resolver().reload(&y).unwrap();
    assert_eq!(
        scope.imported().into_iter().collect::<Vec<_>>(),
        vec![x.clone(), y.clone()]
    );

    let evicted = registry.rollback(&scope);
    assert_eq!(evicted, vec![x.clone()]);
    let cache = registry.resolver().cache();
    assert!(!cache.contains(&x));
    assert!(cache.contains(&y));

    store.put("base", "X.strata", "let V = 2");
    assert_eq!(
        registry.module(&x).unwrap().namespace.value("V"),
        Some(Value::Number(2.0))
    );
}

#[test]
fn test_rollback_ignores_unmanaged_origins() {
    let (store, registry) = setup(&["base"]);
    store.put("base", "X.strata", "let V = 1");
    let scope = registry.track_imports("/opt/managed");
    registry.module(&name("X")).unwrap();
    assert!(scope.imported().is_empty());
    assert!(registry.rollback(&scope).is_empty());
    assert!(registry.resolver().cache().contains(&name("X")));
}

#[test]
fn test_virtual_package_and_child() {
    let (store, registry) = setup(&["base", "site"]);
    store.put("site", "Wind/Speed.strata", "let S = 5");

    let wind = registry.module(&name("Wind")).unwrap();
    assert_eq!(wind.kind, ModuleKind::VirtualPackage);
    assert!(wind.namespace.is_empty());
    assert_eq!(wind.origins(), vec!["mem://site/Wind"]);

    let speed = registry.module(&name("Wind.Speed")).unwrap();
    assert_eq!(speed.kind, ModuleKind::Regular);
    assert_eq!(speed.namespace.value("S"), Some(Value::Number(5.0)));
}

#[test]
fn test_execution_error_names_tier_and_origin() {
    let (store, registry) = setup(&["base", "site"]);
    store.put("base", "Bad.strata", "let K = 1");
    store.put("site", "Bad.strata", "fn boom() { return 1 / 0 }\nlet X = boom()");
    let err = registry.add_module(&name("Bad")).unwrap_err();
    match &err {
        StrataError::Execution { tier, origin, .. } => {
            assert_eq!(tier.name, "site");
            assert_eq!(origin, "mem://site/Bad.strata");
        }
        other => panic!("unexpected error {other:?}"),
    }
    let trace = err.script_trace().unwrap();
    assert!(trace.contains("ZeroDivision"), "{trace}");
    assert!(!registry.resolver().cache().contains(&name("Bad")));
    assert!(registry.scripts().is_empty());
}

#[test]
fn test_reload_modules_removes_vanished() {
    let (store, registry) = setup(&["base"]);
    store.put("base", "Keep.strata", "let K = 1");
    store.put("base", "Gone.strata", "let K = 1");
    registry.add_module(&name("Keep")).unwrap();
    registry.add_module(&name("Gone")).unwrap();
    store.remove("base", "Gone.strata");

    let report = registry.reload_modules();
    assert_eq!(report.reloaded, vec![name("Keep")]);
    assert_eq!(report.removed, vec![name("Gone")]);
    assert!(report.failed.is_empty());
    assert_eq!(registry.scripts(), vec![name("Keep")]);
    assert!(registry.import_errors().is_empty());
}

#[test]
fn test_reload_modules_records_failures() {
    let (store, registry) = setup(&["base"]);
    store.put("base", "Flaky.strata", "let K = 1");
    registry.add_module(&name("Flaky")).unwrap();
    store.put("base", "Flaky.strata", "raise \"nope\"");

    let report = registry.reload_modules();
    assert_eq!(report.failed, vec![name("Flaky")]);
    let errors = registry.import_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].module, "Flaky");
    assert!(errors[0].trace.contains("nope"));
}
