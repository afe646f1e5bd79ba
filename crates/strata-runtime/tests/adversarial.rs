use std::{fs, sync::Arc};

use serde_json::json;
use strata_cache::ModuleCache;
use strata_core::{ModuleName, ScriptErrorKind, StrataError, TierSet};
use strata_lang::{Kwargs, ScriptEngine};
use strata_runtime::{FsSourceStore, InstanceRegistry, RegistryOptions, TieredModuleResolver};
use tempfile::TempDir;

fn name(s: &str) -> ModuleName {
    ModuleName::parse(s).unwrap()
}

fn registry_in(dir: &TempDir) -> InstanceRegistry {
    fs::create_dir_all(dir.path().join("base")).unwrap();
    let store = Arc::new(FsSourceStore::new(
        dir.path(),
        TierSet::from_names(["base"]).unwrap(),
    ));
    let resolver = Arc::new(TieredModuleResolver::new(
        store,
        Arc::new(ScriptEngine::new().with_max_call_depth(16)),
        Arc::new(ModuleCache::new()),
    ));
    InstanceRegistry::new(resolver, RegistryOptions::default())
}

const LOOP: &str = r#"
class Loop {
    fn init() { self.me = self }
    fn get() { return self }
    fn spin(n = 0) { return self.spin(n + 1) }
}
"#;

#[test]
fn test_batch_survives_pathological_scripts() {
    let dir = TempDir::new().unwrap();
    let registry = registry_in(&dir);
    let base = dir.path().join("base");
    fs::write(base.join("Good.strata"), "let K = 1").unwrap();
    fs::write(
        base.join("Deep.strata"),
        format!("let K = {}1{}", "(".repeat(5_000), ")".repeat(5_000)),
    )
    .unwrap();
    fs::write(base.join("Loop.strata"), LOOP).unwrap();
    let wide: String = (0..20_000).map(|i| format!("let V{i} = {i}\n")).collect();
    fs::write(base.join("Wide.strata"), wide).unwrap();

    let added = registry.import_modules(&[base]);
    assert_eq!(added, vec![name("Good"), name("Loop"), name("Wide")]);

    let errors = registry.import_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].module, "Deep");
    assert!(errors[0].trace.contains("nested too deeply"), "{}", errors[0].trace);
    assert!(!registry.resolver().cache().contains(&name("Deep")));
}

#[test]
fn test_self_reference_and_runaway_recursion_are_errors() {
    let dir = TempDir::new().unwrap();
    let registry = registry_in(&dir);
    fs::write(dir.path().join("base/Loop.strata"), LOOP).unwrap();
    let looped = name("Loop");
    registry.add_module(&looped).unwrap();
    registry.instantiate(&looped, "Loop", &Kwargs::new()).unwrap();

    let value = registry
        .run_method(&looped, "Loop", "get", &Kwargs::new())
        .unwrap();
    assert_eq!(value, json!({"me": "<Loop instance>"}));

    let err = registry
        .run_method(&looped, "Loop", "spin", &Kwargs::new())
        .unwrap_err();
    match err {
        StrataError::Script(e) => assert_eq!(e.kind, ScriptErrorKind::Recursion),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(registry.is_instantiated(&looped));
}

#[test]
fn test_watcher_edit_to_deep_script_keeps_host_alive() {
    let dir = TempDir::new().unwrap();
    let registry = registry_in(&dir);
    let path = dir.path().join("base/Edit.strata");
    fs::write(&path, "let K = 1").unwrap();
    registry.add_module(&name("Edit")).unwrap();

    fs::write(&path, format!("let K = {}1", "-".repeat(50_000))).unwrap();
    let report = registry.reload_modules();
    assert_eq!(report.failed, vec![name("Edit")]);
    assert_eq!(registry.import_errors().len(), 1);

    fs::write(&path, "let K = 2").unwrap();
    registry.add_module(&name("Edit")).unwrap();
    let module = registry.module(&name("Edit")).unwrap();
    assert_eq!(module.namespace.value("K"), Some(strata_lang::Value::Number(2.0)));
}
