use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use strata_cache::ResolvedModule;
use strata_core::{ConfigManager, ModuleName, Settings};
use strata_lang::Kwargs;
use strata_runtime::{ReloadReport, ScriptHost};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Strata - tiered script host", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory holding default.toml, {env}.toml and local.toml
    #[arg(long, global = true, env = "STRATA_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Configuration environment (development, production, ...)
    #[arg(long, global = true, env = "STRATA_ENV")]
    env: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print machine-readable JSON instead of colored text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import every configured script and report failures
    Check,

    /// List imported scripts with their tiers and classes
    List,

    /// Show the merged symbol table of one module
    Resolve {
        /// Dotted module name, e.g. Wind.Speed
        module: String,
    },

    /// Instantiate a class and call one of its methods
    Run {
        module: String,
        class: String,
        method: String,

        /// Constructor keyword argument (repeatable)
        #[arg(long = "init", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        init: Vec<(String, serde_json::Value)>,

        /// Method keyword argument (repeatable)
        #[arg(long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        args: Vec<(String, serde_json::Value)>,
    },

    /// Watch tier directories and reload scripts as they change
    Watch,

    /// Print the JSON schema of the configuration
    Schema,
}

#[derive(Serialize)]
struct CheckResult {
    imported: Vec<String>,
    errors: Vec<ErrorResult>,
}

#[derive(Serialize)]
struct ErrorResult {
    module: String,
    trace: String,
    recorded_at: String,
}

#[derive(Serialize)]
struct ScriptResult {
    name: String,
    kind: String,
    generation: u64,
    tiers: Vec<String>,
    classes: Vec<String>,
}

#[derive(Serialize)]
struct SymbolResult {
    name: String,
    kind: String,
    tier: String,
    origin: String,
}

#[derive(Serialize)]
struct ModuleResult {
    name: String,
    kind: String,
    generation: u64,
    loaded_at: String,
    sources: Vec<String>,
    symbols: Vec<SymbolResult>,
}

#[derive(Serialize)]
struct RunResult {
    module: String,
    class: String,
    method: String,
    result: serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigManager::load(cli.config_dir.clone(), cli.env.clone())
        .context("Failed to load configuration")?;
    init_tracing(config.settings(), cli.verbose);

    match execute_command(&cli, config.settings()).await {
        Ok(output) => {
            print_output(cli.json, &output)?;
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(settings: &Settings, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        settings.logging.level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if settings.logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn execute_command(cli: &Cli, settings: &Settings) -> Result<serde_json::Value> {
    match &cli.command {
        Commands::Check => execute_check(&*start_host(settings)?),
        Commands::List => execute_list(&*start_host(settings)?),
        Commands::Resolve { module } => execute_resolve(&*start_host(settings)?, module),
        Commands::Run {
            module,
            class,
            method,
            init,
            args,
        } => execute_run(&*start_host(settings)?, module, class, method, init, args),
        Commands::Watch => execute_watch(start_host(settings)?, cli.json).await,
        Commands::Schema => {
            let schema = Settings::json_schema()?;
            Ok(serde_json::from_str(&schema)?)
        }
    }
}

fn start_host(settings: &Settings) -> Result<Arc<ScriptHost>> {
    let host = ScriptHost::from_settings(settings).context("Failed to start script host")?;
    Ok(Arc::new(host))
}

fn execute_check(host: &ScriptHost) -> Result<serde_json::Value> {
    let imported = host.import_configured()?;
    let errors: Vec<ErrorResult> = host
        .registry()
        .import_errors()
        .into_iter()
        .map(|record| ErrorResult {
            module: record.module,
            trace: record.trace,
            recorded_at: record.recorded_at.to_rfc3339(),
        })
        .collect();
    let failed = errors.len();
    let result = CheckResult {
        imported: imported.iter().map(ToString::to_string).collect(),
        errors,
    };
    let value = serde_json::to_value(result)?;
    anyhow::ensure!(failed == 0, "{} script(s) failed to import\n{}", failed, render_errors(&value));
    Ok(value)
}

fn render_errors(value: &serde_json::Value) -> String {
    value["errors"]
        .as_array()
        .map(|errors| {
            errors
                .iter()
                .filter_map(|e| e["trace"].as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        })
        .unwrap_or_default()
}

fn execute_list(host: &ScriptHost) -> Result<serde_json::Value> {
    host.import_configured()?;
    for record in host.registry().import_errors() {
        warn!(module = %record.module, "skipped script that failed to import");
    }
    let mut scripts = Vec::new();
    for name in host.registry().scripts() {
        let module = host.registry().module(&name)?;
        scripts.push(ScriptResult {
            name: name.to_string(),
            kind: kind_label(&module),
            generation: module.generation,
            tiers: module.tiers().iter().map(|t| t.name.clone()).collect(),
            classes: module.class_names().iter().map(|c| c.to_string()).collect(),
        });
    }
    Ok(serde_json::to_value(scripts)?)
}

fn execute_resolve(host: &ScriptHost, module: &str) -> Result<serde_json::Value> {
    let name = ModuleName::parse(module)?;
    let module = host
        .registry()
        .module(&name)
        .with_context(|| format!("Failed to resolve {}", name))?;
    let symbols = module
        .namespace
        .iter()
        .map(|(symbol, binding)| SymbolResult {
            name: symbol.to_string(),
            kind: binding.symbol.kind().to_string(),
            tier: binding.provenance.tier.name.clone(),
            origin: binding.provenance.origin.to_string(),
        })
        .collect();
    let result = ModuleResult {
        name: module.name.to_string(),
        kind: kind_label(&module),
        generation: module.generation,
        loaded_at: chrono::DateTime::<chrono::Utc>::from(module.loaded_at).to_rfc3339(),
        sources: module.origins().iter().map(|o| o.to_string()).collect(),
        symbols,
    };
    Ok(serde_json::to_value(result)?)
}

fn execute_run(
    host: &ScriptHost,
    module: &str,
    class: &str,
    method: &str,
    init: &[(String, serde_json::Value)],
    args: &[(String, serde_json::Value)],
) -> Result<serde_json::Value> {
    let name = ModuleName::parse(module)?;
    let registry = host.registry();
    registry
        .add_module(&name)
        .with_context(|| format!("Failed to load {}", name))?;
    registry
        .instantiate(&name, class, &to_kwargs(init))
        .with_context(|| format!("Failed to instantiate {}.{}", name, class))?;
    let result = registry
        .run_method(&name, class, method, &to_kwargs(args))
        .map_err(|e| match e.script_trace() {
            Some(trace) => anyhow::anyhow!("{}\n{}", e, trace),
            None => anyhow::Error::new(e),
        })?;
    Ok(serde_json::to_value(RunResult {
        module: name.to_string(),
        class: class.to_string(),
        method: method.to_string(),
        result,
    })?)
}

async fn execute_watch(host: Arc<ScriptHost>, json: bool) -> Result<serde_json::Value> {
    let imported = host.import_configured()?;
    for record in host.registry().import_errors() {
        warn!(module = %record.module, "script failed to import:\n{}", record.trace);
    }
    info!("Imported {} script(s), watching for changes", imported.len());

    let shutdown = Arc::new(AtomicBool::new(false));
    let reports = host.watcher().subscribe();

    let watch_host = host.clone();
    let watch_shutdown = shutdown.clone();
    let watch_task = tokio::task::spawn_blocking(move || {
        watch_host
            .watcher()
            .watch(watch_host.registry(), &watch_shutdown)
    });

    let print_shutdown = shutdown.clone();
    let print_task = tokio::task::spawn_blocking(move || {
        while !print_shutdown.load(Ordering::Relaxed) {
            match reports.recv_timeout(Duration::from_millis(200)) {
                Ok(report) => print_report(&report, json),
                Err(e) if e.is_timeout() => {}
                Err(_) => break,
            }
        }
    });

    let watched = wait_for_watcher(watch_task, &shutdown, tokio::signal::ctrl_c()).await;
    print_task.await.context("Report task panicked")?;
    watched?;

    Ok(serde_json::json!({
        "status": "stopped",
        "scripts": host.registry().scripts().len(),
    }))
}

/// Waits for `stop` or for the watcher to end on its own, whichever comes
/// first. Sets `shutdown` either way.
async fn wait_for_watcher(
    mut watch_task: JoinHandle<strata_core::Result<()>>,
    shutdown: &AtomicBool,
    stop: impl Future<Output = std::io::Result<()>>,
) -> Result<()> {
    let finished = tokio::select! {
        finished = &mut watch_task => {
            warn!("Watcher stopped before shutdown was requested");
            shutdown.store(true, Ordering::Relaxed);
            finished
        }
        signal = stop => {
            shutdown.store(true, Ordering::Relaxed);
            signal.context("Failed to listen for ctrl-c")?;
            info!("Shutting down watcher");
            watch_task.await
        }
    };
    finished.context("Watcher task panicked")??;
    Ok(())
}

fn print_report(report: &ReloadReport, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(report) {
            println!("{}", line);
        }
        return;
    }
    for name in &report.reloaded {
        println!("{} {}", "reloaded".green(), name);
    }
    for name in &report.removed {
        println!("{} {}", "removed".yellow(), name);
    }
    for name in &report.failed {
        println!("{} {}", "failed".red().bold(), name);
    }
}

fn kind_label(module: &ResolvedModule) -> String {
    serde_json::to_value(module.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn to_kwargs(pairs: &[(String, serde_json::Value)]) -> Kwargs {
    pairs.iter().cloned().collect()
}

/// `key=value`, where the value is parsed as JSON and falls back to a string.
fn parse_key_value(raw: &str) -> std::result::Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{}'", raw));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn print_output(json: bool, value: &serde_json::Value) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print_pretty(value, 0);
    }
    Ok(())
}

fn print_pretty(value: &serde_json::Value, indent: usize) {
    let pad = "  ".repeat(indent);
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                let key_colored = key.cyan().bold();
                match val {
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        println!("{}{}:", pad, key_colored);
                        print_pretty(val, indent + 1);
                    }
                    _ => println!("{}{}: {}", pad, key_colored, scalar(val)),
                }
            }
        }
        serde_json::Value::Array(items) => {
            if items.is_empty() {
                println!("{}{}", pad, "(none)".dimmed());
            }
            for item in items {
                match item {
                    serde_json::Value::Object(_) => {
                        println!("{}{}", pad, "-".dimmed());
                        print_pretty(item, indent + 1);
                    }
                    _ => println!("{}- {}", pad, scalar(item)),
                }
            }
        }
        other => println!("{}{}", pad, scalar(other)),
    }
}

fn scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.green().to_string(),
        serde_json::Value::Number(n) => n.to_string().yellow().to_string(),
        serde_json::Value::Bool(true) => "true".green().to_string(),
        serde_json::Value::Bool(false) => "false".red().to_string(),
        serde_json::Value::Null => "null".dimmed().to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("speed=12").unwrap(),
            ("speed".to_string(), serde_json::json!(12))
        );
        assert_eq!(
            parse_key_value("label=north wind").unwrap(),
            ("label".to_string(), serde_json::json!("north wind"))
        );
        assert_eq!(
            parse_key_value("flags=[1, 2]").unwrap().1,
            serde_json::json!([1, 2])
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=3").is_err());
    }

    #[tokio::test]
    async fn test_dead_watcher_ends_wait() {
        let shutdown = AtomicBool::new(false);
        let task = tokio::task::spawn_blocking(|| {
            Err(strata_core::StrataError::Watch("root vanished".into()))
        });
        let err = wait_for_watcher(task, &shutdown, std::future::pending())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("root vanished"), "{err}");
        assert!(shutdown.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_stop_signal_shuts_watcher_down() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let task = tokio::task::spawn_blocking(move || {
            while !flag.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(())
        });
        wait_for_watcher(task, &shutdown, async { Ok(()) })
            .await
            .unwrap();
        assert!(shutdown.load(Ordering::Relaxed));
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "strata", "run", "Wind", "Wind", "speed", "--init", "base=3", "--arg", "factor=2",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { init, args, .. } => {
                assert_eq!(init.len(), 1);
                assert_eq!(args[0].0, "factor");
            }
            _ => panic!("expected run"),
        }
    }
}
