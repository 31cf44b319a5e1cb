//! Property tests over the tier tables.

use holofoil_plugin_host::Capability;
use holofoil_plugin_host::capabilities::{get_tier_limits, parse_capabilities, validate_capabilities};
use holofoil_types::TrustTier;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn capability_set() -> impl Strategy<Value = Vec<Capability>> {
    proptest::sample::subsequence(Capability::ALL.to_vec(), 0..=Capability::ALL.len())
}

fn usable(tier: TrustTier, requested: &[Capability]) -> BTreeSet<Capability> {
    let v = validate_capabilities(tier, requested);
    v.allowed.union(&v.needs_consent).copied().collect()
}

proptest! {
    #[test]
    fn more_trusted_tiers_never_lose_capabilities(requested in capability_set()) {
        let community = usable(TrustTier::Community, &requested);
        let curated = usable(TrustTier::Curated, &requested);
        let builtin = usable(TrustTier::Builtin, &requested);
        prop_assert!(community.is_subset(&curated));
        prop_assert!(curated.is_subset(&builtin));
    }

    #[test]
    fn every_request_lands_in_exactly_one_bucket(requested in capability_set()) {
        for tier in TrustTier::ALL {
            let v = validate_capabilities(tier, &requested);
            for cap in &requested {
                let hits = [v.allowed.contains(cap), v.blocked.contains(cap), v.needs_consent.contains(cap)]
                    .iter()
                    .filter(|hit| **hit)
                    .count();
                prop_assert_eq!(hits, 1, "{:?} at {}", cap, tier);
            }
        }
    }

    #[test]
    fn builtins_are_never_prompted(requested in capability_set()) {
        let v = validate_capabilities(TrustTier::Builtin, &requested);
        prop_assert!(v.needs_consent.is_empty());
        prop_assert!(v.blocked.is_empty());
    }

    #[test]
    fn unknown_ids_are_split_out(noise in "[a-z]{3,8}-x") {
        let (known, unknown) = parse_capabilities(["storage", noise.as_str(), "storage"]);
        prop_assert_eq!(known, vec![Capability::Storage]);
        prop_assert_eq!(unknown, vec![noise]);
    }
}

#[test]
fn resource_ceilings_grow_with_trust() {
    let tiers = TrustTier::ALL.map(get_tier_limits);
    for pair in tiers.windows(2) {
        assert!(pair[0].max_cache_bytes < pair[1].max_cache_bytes);
        assert!(pair[0].max_concurrent_sandboxes < pair[1].max_concurrent_sandboxes);
        assert!(pair[0].cache_ttl < pair[1].cache_ttl);
    }
}
