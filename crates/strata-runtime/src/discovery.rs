use std::path::{Path, PathBuf};

use ignore::{overrides::OverrideBuilder, WalkBuilder};
use strata_core::{Result, StrataError};
use tracing::{debug, info, warn};

/// Rules for which files in a script directory are importable modules.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub extension: String,
    pub exclude_suffixes: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            extension: "strata".to_string(),
            exclude_suffixes: vec!["Interface".to_string()],
            exclude_patterns: vec![],
        }
    }
}

impl DiscoveryConfig {
    /// Module name for `path`, or `None` when the file is not an importable
    /// script: wrong extension, a stem with further dots, a leading
    /// underscore, or a management suffix.
    pub fn module_stem(&self, path: &Path) -> Option<String> {
        let file_name = path.file_name()?.to_str()?;
        let stem = file_name.strip_suffix(&format!(".{}", self.extension))?;
        if stem.is_empty() || stem.contains('.') || stem.starts_with('_') {
            return None;
        }
        if self
            .exclude_suffixes
            .iter()
            .any(|suffix| stem.ends_with(suffix.as_str()))
        {
            return None;
        }
        Some(stem.to_string())
    }
}

/// Lists importable scripts directly inside `dir` (no recursion), sorted by
/// file name.
pub fn collect_script_files(dir: &Path, config: &DiscoveryConfig) -> Result<Vec<(PathBuf, String)>> {
    debug!("Collecting scripts from: {:?}", dir);

    let mut ovr = OverrideBuilder::new(dir);
    for exclude in &config.exclude_patterns {
        let pattern = if exclude.starts_with('!') {
            exclude.clone()
        } else {
            format!("!{}", exclude)
        };
        if let Err(e) = ovr.add(&pattern) {
            warn!("Skipping invalid exclude pattern {}: {}", exclude, e);
            continue;
        }
        debug!("Added exclude pattern: {}", pattern);
    }
    let overrides = ovr
        .build()
        .map_err(|e| StrataError::Io(std::io::Error::other(e)))?;

    let mut walker_builder = WalkBuilder::new(dir);
    walker_builder
        .hidden(true)
        .git_ignore(false)
        .git_exclude(false)
        .ignore(true)
        .overrides(overrides)
        .max_depth(Some(1));

    let mut scripts = Vec::new();
    let mut total_files = 0;
    for dent in walker_builder.build() {
        let dent = match dent {
            Ok(d) => d,
            Err(e) => {
                warn!("Walker error: {}", e);
                continue;
            }
        };
        let path = dent.path();
        if !path.is_file() {
            continue;
        }
        total_files += 1;
        if let Some(stem) = config.module_stem(path) {
            scripts.push((path.to_path_buf(), stem));
        }
    }
    scripts.sort_by(|a, b| a.1.cmp(&b.1));

    info!(
        "Script discovery complete: {} files found, {} importable",
        total_files,
        scripts.len()
    );
    Ok(scripts)
}
