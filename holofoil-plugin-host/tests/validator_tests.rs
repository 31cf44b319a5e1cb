//! Manifest and code validation as seen by callers of the host crate.

use holofoil_plugin_host::Capability;
use holofoil_plugin_host::validator::{
    IssueLocation, Severity, format_validation_result, parse_manifest, validate_manifest, validate_plugin_code,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

fn theme_manifest() -> Value {
    json!({
        "id": "community.foil-theme",
        "name": "Foil Theme",
        "version": "1.2.0",
        "author": "someone",
        "main": "index.js",
        "capabilities": ["storage", "settings-read"],
        "assets": [
            { "path": "foil.css", "size": 120 }
        ],
        "entry_points": {
            "theme": { "name": "Foil", "stylesheet": "foil.css", "variables": { "accent": "#ff00aa" } }
        }
    })
}

#[test]
fn well_formed_manifest_parses() {
    let validated = parse_manifest(&theme_manifest()).unwrap();
    assert_eq!(validated.manifest.id.as_str(), "community.foil-theme");
    assert_eq!(validated.manifest.assets[0].size, 120);
    assert!(validated.report.issues.is_empty());
}

#[test]
fn warnings_survive_parsing() {
    let mut m = theme_manifest();
    m["capabilities"] = json!(["storage", "storage"]);
    m["entry_points"]["theme"]["stylesheet"] = json!("missing.css");
    let validated = parse_manifest(&m).unwrap();
    assert_eq!(validated.report.warning_count(), 2);
    assert!(validated.report.has_code("duplicate-capability"));
    assert!(validated.report.has_code("undeclared-stylesheet"));
}

#[test]
fn every_problem_is_reported_at_once() {
    let m = json!({
        "id": "Bad Id",
        "version": "one",
        "main": "../escape.js",
        "capabilities": ["teleport"],
        "assets": [{ "path": "/etc/passwd", "size": -1 }],
        "entry_points": { "theme": 5 }
    });
    let result = validate_manifest(&m);
    assert!(!result.is_valid());
    for code in [
        "invalid-id",
        "missing-field",
        "invalid-version",
        "invalid-main",
        "unknown-capability",
        "invalid-asset-path",
        "invalid-asset-size",
        "invalid-entry-point",
    ] {
        assert!(result.has_code(code), "expected {code}:\n{}", format_validation_result(&result));
    }
    assert!(parse_manifest(&m).is_err());
}

#[test]
fn remote_assets_need_network() {
    let mut m = theme_manifest();
    m["assets"] = json!([{ "path": "https://cdn.test/foil.css", "size": 10 }]);
    assert!(validate_manifest(&m).has_code("remote-asset"));

    m["tier"] = json!("curated");
    m["capabilities"] = json!(["network"]);
    assert!(!validate_manifest(&m).has_code("remote-asset"));
}

#[test]
fn code_scan_flags_lines() {
    let source = "\
// eval(\"ignored in a comment\")
const x = 1;
eval(payload);
fetch('https://evil.test');
while (true) { tick(); }
";
    let result = validate_plugin_code(source, &[]);
    let found: Vec<(Severity, &str, IssueLocation)> = result
        .issues
        .iter()
        .map(|i| (i.severity, i.code, i.location.clone()))
        .collect();
    assert_eq!(
        found,
        vec![
            (Severity::Error, "dynamic-eval", IssueLocation::Line(3)),
            (Severity::Error, "network-access", IssueLocation::Line(4)),
            (Severity::Warning, "unbounded-loop", IssueLocation::Line(5)),
        ]
    );
}

#[test]
fn network_code_is_informational_with_the_capability() {
    let result = validate_plugin_code("const r = fetch(url);", &[Capability::Network]);
    assert!(result.is_valid());
    assert_eq!(result.issues[0].severity, Severity::Info);
    assert_eq!(result.issues[0].code, "network-use");
}

#[test]
fn formatted_summary_is_stable() {
    let result = validate_plugin_code("setInterval(poll, 10);\nwindow.location = x;", &[]);
    assert_eq!(
        format_validation_result(&result),
        "validation failed: 1 error(s), 1 warning(s)\n  \
         [error] line 2 host-global: access to host globals\n  \
         [warning] line 1 interval-timer: repeating timer"
    );
    assert_eq!(format_validation_result(&Default::default()), "validation passed");
}
