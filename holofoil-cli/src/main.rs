//! Holofoil plugin operator tool.
//!
//! Usage:
//!   holofoil-plugins validate ./my-theme/plugin.json
//!   holofoil-plugins capabilities --tier community
//!   holofoil-plugins cache stats

use anyhow::{Context, Result};
use clap::Parser;
use holofoil_cli::{CacheAction, Cli, Command};
use holofoil_plugin_host::{InstallRegistry, validator};
use holofoil_types::PluginId;
use std::process::ExitCode;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = cli.host_config();
    match &cli.command {
        Command::Validate { manifest, code } => {
            let outcome = holofoil_cli::validate_files(manifest, code.as_deref())?;
            if let Some(path) = &outcome.code_path {
                info!(code = %path.display(), "scanned plugin code");
            }
            println!("{}", validator::format_validation_result(&outcome.result));
            if !outcome.result.is_valid() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Capabilities { tier } => print!("{}", holofoil_cli::render_capabilities(*tier)),
        Command::Builtins => print!("{}", holofoil_cli::render_builtins()?),
        Command::Config => print!("{}", holofoil_cli::render_config(&config)?),
        Command::Cache { action } => {
            let cache = holofoil_cli::open_cache(&config)?;
            match action {
                CacheAction::Stats => {
                    let stats = cache.get_cache_stats().await?;
                    print!("{}", holofoil_cli::render_cache_stats(&stats));
                }
                CacheAction::Maintain => {
                    let registry = InstallRegistry::open(config.install.registry_path()).await?;
                    let quota = holofoil_cli::maintenance_quota(&config, &registry.list().await);
                    let report = cache.perform_cache_maintenance(&quota).await?;
                    println!("{}", holofoil_cli::render_maintenance(&report));
                }
                CacheAction::Clear { plugin: Some(id) } => {
                    let plugin_id = PluginId::parse(id).with_context(|| format!("invalid plugin id '{id}'"))?;
                    let removed = cache.clear_plugin_cache(&plugin_id).await?;
                    println!("removed {removed} record(s) for {plugin_id}");
                }
                CacheAction::Clear { plugin: None } => {
                    let removed = cache.clear_all_plugin_cache().await?;
                    println!("removed {removed} record(s)");
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
