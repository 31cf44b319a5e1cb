use holofoil_types::{PluginId, TrustTier, MAX_PLUGIN_ID_LEN};
use proptest::prelude::*;
use std::collections::HashSet;
use std::str::FromStr;

// ── PluginId ──────────────────────────────────────────────────────

#[test]
fn plugin_id_display_and_parse() {
    let id = PluginId::parse("curated.binder-view").unwrap();
    assert_eq!(id.to_string(), "curated.binder-view");
    assert_eq!(PluginId::from_str("curated.binder-view").unwrap(), id);
}

#[test]
fn plugin_id_error_names_reason() {
    let err = PluginId::parse("plugin:evil").unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("plugin:evil"));
    assert!(msg.contains("may only contain"));
}

#[test]
fn plugin_id_hash_and_eq() {
    let mut set = HashSet::new();
    set.insert(PluginId::parse("a.b").unwrap());
    set.insert(PluginId::parse("a.b").unwrap());
    assert_eq!(set.len(), 1);
}

#[test]
fn plugin_id_serde_transparent() {
    let id = PluginId::parse("holofoil.theme.classic").unwrap();
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"holofoil.theme.classic\"");
}

#[test]
fn tier_serde_lowercase() {
    let json = serde_json::to_string(&TrustTier::Curated).unwrap();
    assert_eq!(json, "\"curated\"");
    let tier: TrustTier = serde_json::from_str("\"builtin\"").unwrap();
    assert_eq!(tier, TrustTier::Builtin);
}

proptest! {
    #[test]
    fn valid_ids_never_contain_key_separators(s in "[a-z0-9][a-z0-9._-]{0,63}") {
        if let Ok(id) = PluginId::parse(&s) {
            prop_assert!(!id.as_str().contains(':'));
            prop_assert!(!id.as_str().contains('/'));
            prop_assert!(!id.as_str().contains(".."));
            prop_assert!(id.as_str().len() <= MAX_PLUGIN_ID_LEN);
        } else {
            prop_assert!(s.contains(".."));
        }
    }

    #[test]
    fn arbitrary_strings_with_separators_rejected(prefix in "[a-z]{1,8}", sep in "[:/\\\\ ]", suffix in "[a-z]{1,8}") {
        let candidate = format!("{prefix}{sep}{suffix}");
        prop_assert!(PluginId::parse(&candidate).is_err());
    }
}
