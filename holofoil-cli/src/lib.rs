//! Operator commands for the Holofoil plugin host.
//!
//! The binary only parses arguments and installs logging; everything it
//! prints is rendered here so it can be tested without a terminal.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use holofoil_plugin_host::capabilities::{self, CapabilityInfo};
use holofoil_plugin_host::validator::{self, ValidationResult};
use holofoil_plugin_host::{BUILTIN_PLUGIN_IDS, Capability, HostConfig, InstalledPluginInfo, builtin_plugins};
use holofoil_storage::{CacheQuota, CacheStats, MaintenanceReport, PluginCache, SqliteKvStore};
use holofoil_types::TrustTier;
use serde_json::Value;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "holofoil-plugins")]
#[command(about = "Inspect plugins and maintain the Holofoil plugin cache")]
pub struct Cli {
    /// Host configuration file. Defaults to ~/.holofoil/plugins.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate a plugin manifest and, optionally, its code
    Validate {
        manifest: PathBuf,
        /// Plugin code to scan. Defaults to the manifest's `main`, next to the manifest
        #[arg(long)]
        code: Option<PathBuf>,
    },
    /// List capabilities and what each trust tier allows
    Capabilities {
        #[arg(long)]
        tier: Option<TrustTier>,
    },
    /// List the plugins compiled into the host
    Builtins,
    /// Print the effective host configuration
    Config,
    /// Inspect or maintain the plugin cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    Stats,
    /// Sweep expired records and evict down to the tier budgets
    Maintain,
    /// Delete cached records for one plugin, or for all of them
    Clear { plugin: Option<String> },
}

impl Cli {
    pub fn host_config(&self) -> HostConfig {
        match &self.config {
            Some(path) => HostConfig::load_from(path),
            None => HostConfig::load(),
        }
    }
}

/// Validation outcome of a manifest plus the code it names.
#[derive(Debug)]
pub struct ValidateOutcome {
    pub result: ValidationResult,
    pub code_path: Option<PathBuf>,
}

pub fn validate_files(manifest_path: &Path, code_path: Option<&Path>) -> Result<ValidateOutcome> {
    let text = std::fs::read_to_string(manifest_path)
        .with_context(|| format!("reading {}", manifest_path.display()))?;
    let raw: Value = serde_json::from_str(&text).with_context(|| format!("parsing {}", manifest_path.display()))?;
    let mut result = validator::validate_manifest(&raw);

    let code_path = code_path.map(Path::to_path_buf).or_else(|| {
        let main = raw.get("main")?.as_str()?;
        Some(manifest_path.parent().unwrap_or(Path::new(".")).join(main))
    });
    if let Some(path) = &code_path {
        let code = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        result.merge(validate_code(&raw, &code));
    }
    Ok(ValidateOutcome { result, code_path })
}

/// Scans `code` against the capabilities `manifest` requests.
pub fn validate_code(manifest: &Value, code: &str) -> ValidationResult {
    let ids = manifest
        .get("capabilities")
        .and_then(Value::as_array)
        .map(|caps| caps.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();
    let (requested, _) = capabilities::parse_capabilities(ids);
    validator::validate_plugin_code(code, &requested)
}

pub fn render_capabilities(tier: Option<TrustTier>) -> String {
    let tiers: Vec<TrustTier> = match tier {
        Some(tier) => vec![tier],
        None => TrustTier::ALL.to_vec(),
    };
    let mut out = String::new();
    let _ = writeln!(out, "{:<16} {:<8} {:<8} {}", "CAPABILITY", "RISK", "CONSENT", "TIERS");
    for capability in Capability::ALL {
        let info: &CapabilityInfo = capability.info();
        let allowed: Vec<&str> = tiers
            .iter()
            .filter(|t| capabilities::get_tier_limits(**t).allows(capability))
            .map(|t| t.as_str())
            .collect();
        if allowed.is_empty() && tier.is_some() {
            continue;
        }
        let _ = writeln!(
            out,
            "{:<16} {:<8} {:<8} {}",
            capability.id(),
            format!("{:?}", info.risk).to_lowercase(),
            if info.requires_consent { "yes" } else { "no" },
            if allowed.is_empty() { "-".to_string() } else { allowed.join(",") },
        );
    }
    for t in tiers {
        let limits = capabilities::get_tier_limits(t);
        let _ = writeln!(
            out,
            "\n[{t}] sandboxes={} cache={} ttl={}s",
            limits.max_concurrent_sandboxes,
            format_bytes(limits.max_cache_bytes),
            limits.cache_ttl.as_secs(),
        );
    }
    out
}

pub fn render_builtins() -> Result<String> {
    let mut out = String::new();
    for plugin in builtin_plugins()? {
        let kinds: Vec<String> = plugin
            .manifest
            .entry_point_kinds()
            .iter()
            .map(|k| format!("{k:?}").to_lowercase())
            .collect();
        let _ = writeln!(
            out,
            "{:<24} {:<8} {}",
            plugin.manifest.id,
            plugin.manifest.version,
            kinds.join(",")
        );
    }
    Ok(out)
}

pub fn render_config(config: &HostConfig) -> Result<String> {
    toml::to_string_pretty(config).context("serializing host configuration")
}

pub fn open_cache(config: &HostConfig) -> Result<PluginCache> {
    let path = config.cache.database_path();
    let store = SqliteKvStore::open(&path).with_context(|| format!("opening cache at {}", path.display()))?;
    Ok(PluginCache::new(Arc::new(store)))
}

pub fn render_cache_stats(stats: &CacheStats) -> String {
    let mut out = format!(
        "{} record(s), {} expired, {} total\n",
        stats.total_records,
        stats.expired_records,
        format_bytes(stats.total_bytes)
    );
    for (plugin, s) in &stats.plugins {
        let _ = writeln!(
            out,
            "  {plugin:<32} {:>10}  manifests={} assets={} configs={} expired={}",
            format_bytes(s.bytes),
            s.manifests,
            s.assets,
            s.configs,
            s.expired
        );
    }
    out
}

/// Quota applied by `cache maintain`. Installed plugins get their tier's
/// budget; anything unknown gets the community budget.
pub fn maintenance_quota(config: &HostConfig, installed: &[InstalledPluginInfo]) -> CacheQuota {
    let builtin = capabilities::get_tier_limits(TrustTier::Builtin).max_cache_bytes;
    let per_plugin = installed
        .iter()
        .map(|i| (i.plugin_id.to_string(), capabilities::get_tier_limits(i.tier).max_cache_bytes))
        .chain(BUILTIN_PLUGIN_IDS.iter().map(|id| (id.to_string(), builtin)))
        .collect();
    CacheQuota {
        per_plugin,
        default_per_plugin: Some(capabilities::get_tier_limits(TrustTier::Community).max_cache_bytes),
        global: config.cache.global_quota_bytes,
    }
}

pub fn render_maintenance(report: &MaintenanceReport) -> String {
    format!(
        "removed {} expired, evicted {}, freed {}",
        report.expired_removed,
        report.evicted,
        format_bytes(report.bytes_freed)
    )
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
