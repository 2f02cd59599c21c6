use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use appliance_sync::cache::ImageCache;
use appliance_sync::catalog::glance::{GlanceCatalog, StaticTokens};
use appliance_sync::config::Config;
use appliance_sync::convert::QemuImg;
use appliance_sync::dispatch::{Dispatcher, DispatcherSettings};
use appliance_sync::preflight::check_host_tools;
use appliance_sync::runner::Runner;
use appliance_sync::source::{Source, SourceAdapter};

const DEFAULT_CONFIG: &str = "/etc/appliance-sync/appliance-sync.toml";

#[derive(Debug, Parser)]
#[command(name = "appliance-sync", version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Log at debug level (RUST_LOG overrides).
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sync every enabled source into the catalog.
    Run,
    /// Print sources and the images they publish as JSON.
    List,
    /// Validate the configuration and host tools.
    Check,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = Config::load(&cli.config).and_then(|config| match cli.command {
        Command::Run => run(&config),
        Command::List => list(&config),
        Command::Check => check(&config),
    });
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn timeout(config: &Config) -> Option<Duration> {
    config.catalog.timeout.map(Duration::from_secs)
}

/// Build every configured source; construction errors are returned per name.
fn build_sources(config: &Config, enabled_only: bool) -> Vec<(String, Result<Source>)> {
    config
        .sources
        .iter()
        .filter(|s| !enabled_only || s.common.enabled)
        .map(|s| {
            let name = s.common.name.clone();
            let source = Source::from_config(s, timeout(config))
                .with_context(|| format!("configuring source '{name}'"));
            (name, source)
        })
        .collect()
}

fn preflight(config: &Config) -> Result<()> {
    let needs_oras = config.enabled_sources().any(|s| s.is_registry());
    check_host_tools(!config.catalog.formats.is_empty(), needs_oras)
}

fn run(config: &Config) -> Result<bool> {
    preflight(config)?;
    let cache = ImageCache::open(config.cache.directory())?;
    let tokens = StaticTokens {
        token: config.catalog.token.clone(),
        project_tokens: config.catalog.project_tokens.clone(),
    };
    let catalog = GlanceCatalog::new(&config.catalog.endpoint, Box::new(tokens), timeout(config))
        .context("configuring catalog client")?;
    let tool = QemuImg::default();
    let dispatcher = Dispatcher::new(
        &catalog,
        &tool,
        DispatcherSettings {
            tag: config.catalog.tag.clone(),
            formats: config.catalog.formats.clone(),
            consumers: config.consumer_map()?,
        },
    );
    let runner = Runner::new(cache, dispatcher, config.catalog.prefix.clone());

    let mut ok = true;
    let mut sources = Vec::new();
    for (name, source) in build_sources(config, true) {
        match source {
            Ok(source) => sources.push(source),
            Err(e) => {
                error!(source = %name, "{e:#}");
                ok = false;
            }
        }
    }
    let adapters: Vec<&dyn SourceAdapter> = sources.iter().map(Source::adapter).collect();
    let report = runner.run(&adapters);
    for source in &report.sources {
        info!(
            source = %source.name,
            images = source.images.len(),
            failed = source.has_failures(),
            "source summary"
        );
    }
    Ok(ok && !report.has_failures())
}

fn list(config: &Config) -> Result<bool> {
    let mut ok = true;
    let mut out = Vec::new();
    for (name, source) in build_sources(config, false) {
        let entry = match source {
            Ok(source) => {
                let adapter = source.adapter();
                let mut map = adapter.describe();
                match adapter.discover() {
                    Ok(images) => {
                        let ids: Vec<Value> = adapter
                            .subscribed(&images)
                            .into_iter()
                            .map(|d| json!({"identifier": d.identifier, "title": d.title, "expired": d.is_expired()}))
                            .collect();
                        map.insert("images".into(), ids.into());
                        map.insert("error".into(), Value::Null);
                    }
                    Err(e) => {
                        ok = false;
                        map.insert("images".into(), json!([]));
                        map.insert("error".into(), e.to_string().into());
                    }
                }
                Value::Object(map)
            }
            Err(e) => {
                ok = false;
                json!({"name": name, "error": format!("{e:#}")})
            }
        };
        out.push(entry);
    }
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(ok)
}

fn check(config: &Config) -> Result<bool> {
    config.consumer_map()?;
    for (_, source) in build_sources(config, false) {
        source?;
    }
    preflight(config)?;
    println!("configuration ok: {} source(s)", config.sources.len());
    Ok(true)
}
