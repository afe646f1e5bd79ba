use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use config as cfg;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{TierSet, DEFAULT_TIERS};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SourcesConfig {
    /// Directory holding one sub-directory per tier
    #[serde(default = "SourcesConfig::default_root")]
    pub root: PathBuf,
    /// Tier names, lowest priority first
    #[serde(default = "SourcesConfig::default_tiers")]
    pub tiers: Vec<String>,
    /// Script file extension, without the leading dot
    #[serde(default = "SourcesConfig::default_extension")]
    pub extension: String,
    /// File stem that marks a package directory
    #[serde(default = "SourcesConfig::default_package_init")]
    pub package_init: String,
}

impl SourcesConfig {
    fn default_root() -> PathBuf {
        PathBuf::from("scripts")
    }

    fn default_tiers() -> Vec<String> {
        DEFAULT_TIERS.iter().map(|t| t.to_string()).collect()
    }

    fn default_extension() -> String {
        "strata".to_string()
    }

    fn default_package_init() -> String {
        "__init__".to_string()
    }

    pub fn tier_set(&self) -> Result<TierSet> {
        TierSet::from_names(&self.tiers).context("invalid sources.tiers")
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
            tiers: Self::default_tiers(),
            extension: Self::default_extension(),
            package_init: Self::default_package_init(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RegistryConfig {
    /// Directories scanned by `import_modules`; relative paths are resolved
    /// against `sources.root`
    #[serde(default)]
    pub script_paths: Vec<PathBuf>,
    /// File stems ending with one of these are management files, never imported
    #[serde(default = "RegistryConfig::default_exclude_suffixes")]
    pub exclude_suffixes: Vec<String>,
    /// Drop live instances when their module is reloaded or re-added
    #[serde(default = "RegistryConfig::default_invalidate_on_reload")]
    pub invalidate_on_reload: bool,
    /// Origin prefix recorded by rollback scopes; defaults to `sources.root`
    #[serde(default)]
    pub managed_root: Option<String>,
}

impl RegistryConfig {
    fn default_exclude_suffixes() -> Vec<String> {
        vec!["Interface".to_string()]
    }

    fn default_invalidate_on_reload() -> bool {
        true
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            script_paths: Vec::new(),
            exclude_suffixes: Self::default_exclude_suffixes(),
            invalidate_on_reload: Self::default_invalidate_on_reload(),
            managed_root: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WatchConfig {
    /// Quiet period before queued file events are applied
    #[serde(default = "WatchConfig::default_debounce_ms")]
    pub debounce_ms: u64,
}

impl WatchConfig {
    fn default_debounce_ms() -> u64 {
        250
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: Self::default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Settings {
    #[serde(default = "Settings::default_env")]
    pub env: String,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: Self::default_env(),
            sources: SourcesConfig::default(),
            registry: RegistryConfig::default(),
            watch: WatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Settings {
    fn default_env() -> String {
        env::var("STRATA_ENV")
            .ok()
            .or_else(|| env::var("APP_ENV").ok())
            .unwrap_or_else(|| "development".to_string())
    }

    pub fn validate(&self) -> Result<()> {
        self.sources.tier_set()?;
        anyhow::ensure!(
            !self.sources.extension.trim().is_empty() && !self.sources.extension.contains('.'),
            "sources.extension must be a bare extension such as \"strata\""
        );
        anyhow::ensure!(
            !self.sources.package_init.trim().is_empty(),
            "sources.package_init cannot be empty"
        );
        anyhow::ensure!(
            self.registry.exclude_suffixes.iter().all(|s| !s.is_empty()),
            "registry.exclude_suffixes cannot contain empty entries"
        );
        anyhow::ensure!(
            self.watch.debounce_ms <= 60_000,
            "watch.debounce_ms must be at most 60000"
        );
        Ok(())
    }

    /// Script directories with relative entries anchored at `sources.root`.
    pub fn script_paths(&self) -> Vec<PathBuf> {
        self.registry
            .script_paths
            .iter()
            .map(|p| {
                if p.is_absolute() {
                    p.clone()
                } else {
                    self.sources.root.join(p)
                }
            })
            .collect()
    }

    pub fn managed_root(&self) -> String {
        self.registry
            .managed_root
            .clone()
            .unwrap_or_else(|| self.sources.root.display().to_string())
    }

    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(Settings);
        serde_json::to_string_pretty(&schema).context("serializing settings schema")
    }
}

#[derive(Debug, Clone)]
pub struct ConfigManager {
    settings: Settings,
    config_dir: PathBuf,
    env: String,
}

impl ConfigManager {
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn env(&self) -> &str {
        &self.env
    }

    pub fn load(config_dir: Option<PathBuf>, env_override: Option<String>) -> Result<Self> {
        let env_name = env_override.unwrap_or_else(Settings::default_env);
        let config_dir = config_dir.unwrap_or_else(Self::default_config_dir);
        let mut settings = Self::load_from_sources(&config_dir, &env_name)?;
        settings.env = env_name.clone();
        if settings.sources.root.is_relative() && config_dir.join(&settings.sources.root).exists()
        {
            settings.sources.root = config_dir.join(&settings.sources.root);
        }
        settings.validate()?;
        Ok(Self {
            settings,
            config_dir,
            env: env_name,
        })
    }

    /// Get the default configuration directory.
    ///
    /// Priority order:
    /// 1. ~/.strata/
    /// 2. ./config/
    /// 3. Current directory
    pub fn default_config_dir() -> PathBuf {
        if let Some(home_dir) = dirs::home_dir() {
            let strata_dir = home_dir.join(".strata");
            if strata_dir.exists() {
                info!("Using config directory: {:?}", strata_dir);
                return strata_dir;
            }
        }

        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let project_config = cwd.join("config");
        if project_config.exists() {
            info!("Using config directory: {:?}", project_config);
            return project_config;
        }

        info!("Using config directory: {:?}", cwd);
        cwd
    }

    pub fn load_from_sources(config_dir: &Path, env_name: &str) -> Result<Settings> {
        let builder = cfg::Config::builder()
            .add_source(cfg::File::from(config_dir.join("default.toml")).required(false))
            .add_source(cfg::File::from(config_dir.join("default.yaml")).required(false))
            .add_source(cfg::File::from(config_dir.join("default.json")).required(false))
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.toml", env_name))).required(false),
            )
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.yaml", env_name))).required(false),
            )
            .add_source(cfg::File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                cfg::Environment::with_prefix("STRATA")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("sources.tiers")
                    .with_list_parse_key("registry.script_paths")
                    .with_list_parse_key("registry.exclude_suffixes")
                    .try_parsing(true),
            );

        let settings: Settings = builder
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings_validate() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.sources.tiers, DEFAULT_TIERS);
        assert!(settings.registry.invalidate_on_reload);
        assert_eq!(settings.registry.exclude_suffixes, vec!["Interface"]);
    }

    #[test]
    fn test_duplicate_tiers_fail_validation() {
        let mut settings = Settings::default();
        settings.sources.tiers = vec!["base".into(), "base".into()];
        assert!(settings.validate().is_err());

        settings.sources.tiers.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_dotted_extension_fails_validation() {
        let mut settings = Settings::default();
        settings.sources.extension = ".strata".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_layered_files() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            r#"
[sources]
root = "/srv/scripts"
tiers = ["base", "site"]

[watch]
debounce_ms = 100
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("staging.toml"),
            r#"
[watch]
debounce_ms = 500
"#,
        )
        .unwrap();

        let settings = ConfigManager::load_from_sources(dir.path(), "staging").unwrap();
        assert_eq!(settings.sources.root, PathBuf::from("/srv/scripts"));
        assert_eq!(settings.sources.tiers, vec!["base", "site"]);
        assert_eq!(settings.watch.debounce_ms, 500);
        assert_eq!(settings.sources.extension, "strata");
    }

    #[test]
    fn test_relative_script_paths_anchor_at_root() {
        let mut settings = Settings::default();
        settings.sources.root = PathBuf::from("/srv/scripts");
        settings.registry.script_paths =
            vec![PathBuf::from("base/derived"), PathBuf::from("/opt/extra")];
        assert_eq!(
            settings.script_paths(),
            vec![
                PathBuf::from("/srv/scripts/base/derived"),
                PathBuf::from("/opt/extra")
            ]
        );
        assert_eq!(settings.managed_root(), "/srv/scripts");
    }

    #[test]
    fn test_schema_mentions_sections() {
        let schema = Settings::json_schema().unwrap();
        assert!(schema.contains("sources"));
        assert!(schema.contains("invalidate_on_reload"));
    }
}
