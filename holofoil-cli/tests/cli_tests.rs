use clap::Parser;
use holofoil_cli::{CacheAction, Cli, Command};
use holofoil_plugin_host::HostConfig;
use holofoil_storage::{CacheStats, MaintenanceReport, PluginCacheStats};
use holofoil_types::TrustTier;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;

#[test]
fn parses_nested_cache_commands() {
    let cli = Cli::try_parse_from(["holofoil-plugins", "-v", "cache", "clear", "community.grid"]).unwrap();
    assert!(cli.verbose);
    assert!(matches!(
        cli.command,
        Command::Cache {
            action: CacheAction::Clear { plugin: Some(ref id) }
        } if id == "community.grid"
    ));
}

#[test]
fn tier_argument_is_parsed() {
    let cli = Cli::try_parse_from(["holofoil-plugins", "capabilities", "--tier", "curated"]).unwrap();
    assert!(matches!(cli.command, Command::Capabilities { tier: Some(TrustTier::Curated) }));
    assert!(Cli::try_parse_from(["holofoil-plugins", "capabilities", "--tier", "root"]).is_err());
}

#[test]
fn validate_picks_up_code_named_by_main() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("plugin.json");
    fs::write(
        &manifest,
        json!({
            "id": "community.peek",
            "name": "Peek",
            "version": "1.0.0",
            "main": "index.js",
            "entry_points": { "mechanic": { "id": "peek", "name": "Peek" } }
        })
        .to_string(),
    )
    .unwrap();
    fs::write(dir.path().join("index.js"), "fetch('https://example.test');\n").unwrap();

    let outcome = holofoil_cli::validate_files(&manifest, None).unwrap();
    assert_eq!(outcome.code_path, Some(dir.path().join("index.js")));
    assert!(outcome.result.has_code("network-access"));
    assert!(!outcome.result.is_valid());
}

#[test]
fn validate_reports_missing_files() {
    let dir = tempfile::tempdir().unwrap();
    let err = holofoil_cli::validate_files(&dir.path().join("nope.json"), None).unwrap_err();
    assert!(err.to_string().contains("nope.json"));
}

#[test]
fn declared_network_is_not_an_error() {
    let manifest = json!({ "capabilities": ["network"] });
    let result = holofoil_cli::validate_code(&manifest, "fetch('https://example.test');");
    assert!(result.is_valid());
}

#[test]
fn community_listing_hides_blocked_capabilities() {
    let out = holofoil_cli::render_capabilities(Some(TrustTier::Community));
    assert!(out.contains("storage"));
    assert!(!out.contains("network"));
    assert!(out.contains("[community] sandboxes=4"));

    let all = holofoil_cli::render_capabilities(None);
    assert!(all.contains("network"));
    assert!(all.contains("[builtin]"));
}

#[test]
fn builtins_are_listed_with_entry_points() {
    let out = holofoil_cli::render_builtins().unwrap();
    let first: Vec<&str> = out.lines().map(|l| l.split_whitespace().next().unwrap()).collect();
    assert_eq!(
        first,
        vec![
            "builtin.holo-dark",
            "builtin.classic-light",
            "builtin.memory-match",
            "builtin.sample-binder"
        ]
    );
    assert!(out.lines().nth(2).unwrap().ends_with("mechanic"));
}

#[test]
fn config_renders_as_toml() {
    let rendered = holofoil_cli::render_config(&HostConfig::default()).unwrap();
    assert!(rendered.contains("[sandbox]"));
    assert_eq!(HostConfig::parse(&rendered).unwrap(), HostConfig::default());
}

#[test]
fn cache_stats_table() {
    let stats = CacheStats {
        total_bytes: 3 * 1024,
        total_records: 2,
        expired_records: 1,
        plugins: BTreeMap::from([(
            "community.grid".to_string(),
            PluginCacheStats {
                bytes: 3 * 1024,
                manifests: 1,
                assets: 1,
                expired: 1,
                ..Default::default()
            },
        )]),
    };
    let out = holofoil_cli::render_cache_stats(&stats);
    assert!(out.starts_with("2 record(s), 1 expired, 3.0 KiB total"));
    assert!(out.contains("community.grid"));
    assert!(out.contains("manifests=1 assets=1 configs=0 expired=1"));
}

#[test]
fn maintenance_summary() {
    let report = MaintenanceReport {
        expired_removed: 2,
        evicted: 1,
        bytes_freed: 512,
    };
    assert_eq!(
        holofoil_cli::render_maintenance(&report),
        "removed 2 expired, evicted 1, freed 512 B"
    );
}

#[test]
fn builtins_get_their_own_budget() {
    let quota = holofoil_cli::maintenance_quota(&HostConfig::default(), &[]);
    assert!(quota.for_plugin("builtin.memory-match") > quota.for_plugin("community.unknown"));
}

#[test]
fn byte_formatting() {
    assert_eq!(holofoil_cli::format_bytes(0), "0 B");
    assert_eq!(holofoil_cli::format_bytes(1536), "1.5 KiB");
    assert_eq!(holofoil_cli::format_bytes(5 * 1024 * 1024), "5.0 MiB");
}
