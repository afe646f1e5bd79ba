use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use strata_cache::{ModuleCache, RollbackScope};
use strata_core::Settings;
use strata_lang::ScriptEngine;
use tracing::info;

use crate::registry::{InstanceRegistry, RegistryOptions};
use crate::resolver::{SourceLayout, TieredModuleResolver};
use crate::store::FsSourceStore;
use crate::watcher::ScriptWatcher;

/// Everything a process needs to host scripts from a filesystem tree,
/// wired from one `Settings`.
pub struct ScriptHost {
    settings: Settings,
    store: Arc<FsSourceStore>,
    registry: Arc<InstanceRegistry>,
    watcher: Arc<ScriptWatcher>,
}

impl ScriptHost {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings.validate()?;
        let tiers = settings.sources.tier_set()?;
        let layout = SourceLayout::from_config(&settings.sources);

        let store = Arc::new(
            FsSourceStore::new(&settings.sources.root, tiers)
                .with_layout(&layout.extension, &layout.package_init),
        );
        let resolver = Arc::new(
            TieredModuleResolver::new(
                store.clone(),
                Arc::new(ScriptEngine::new()),
                Arc::new(ModuleCache::new()),
            )
            .with_layout(layout),
        );
        let registry = Arc::new(InstanceRegistry::new(
            resolver,
            RegistryOptions::from(&settings.registry),
        ));
        let watcher = Arc::new(
            ScriptWatcher::new(store.clone())
                .with_debounce(Duration::from_millis(settings.watch.debounce_ms)),
        );

        info!(
            root = %settings.sources.root.display(),
            tiers = settings.sources.tiers.len(),
            "script host ready"
        );
        Ok(Self {
            settings: settings.clone(),
            store,
            registry,
            watcher,
        })
    }

    /// Imports every configured script directory. Falls back to the lowest
    /// tier's directory when none are configured.
    pub fn import_configured(&self) -> Result<Vec<strata_core::ModuleName>> {
        let mut paths = self.settings.script_paths();
        if paths.is_empty() {
            let (_, dir) = self
                .store
                .tier_dirs()
                .into_iter()
                .next()
                .context("no tiers configured")?;
            paths.push(dir);
        }
        Ok(self.registry.import_modules(&paths))
    }

    /// Starts a rollback scope over modules loaded from the configured
    /// managed root.
    pub fn track_imports(&self) -> RollbackScope {
        self.registry.track_imports(self.settings.managed_root())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<FsSourceStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn watcher(&self) -> &Arc<ScriptWatcher> {
        &self.watcher
    }
}
