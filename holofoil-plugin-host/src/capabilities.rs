//! Capability registry.
//!
//! The catalogue and per-tier limits are static data compiled into the
//! binary. [`validate_capabilities`] is the single place where a requested
//! set is reconciled against a trust tier.

use holofoil_plugin_sdk::ApiRequest;
use holofoil_types::TrustTier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A named permission unit gating one class of sensitive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Storage,
    Notification,
    SettingsRead,
    SettingsWrite,
    UiModal,
    CollectionRead,
    Network,
    CollectionWrite,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Storage,
        Capability::Notification,
        Capability::SettingsRead,
        Capability::SettingsWrite,
        Capability::UiModal,
        Capability::CollectionRead,
        Capability::Network,
        Capability::CollectionWrite,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Notification => "notification",
            Self::SettingsRead => "settings-read",
            Self::SettingsWrite => "settings-write",
            Self::UiModal => "ui-modal",
            Self::CollectionRead => "collection-read",
            Self::Network => "network",
            Self::CollectionWrite => "collection-write",
        }
    }

    /// The capability a host API call is gated on.
    pub fn for_api(request: &ApiRequest) -> Capability {
        match request {
            ApiRequest::StorageGet { .. }
            | ApiRequest::StorageSet { .. }
            | ApiRequest::StorageRemove { .. } => Self::Storage,
            ApiRequest::Notify { .. } => Self::Notification,
            ApiRequest::SettingsGet { .. } => Self::SettingsRead,
            ApiRequest::SettingsSet { .. } => Self::SettingsWrite,
            ApiRequest::Modal { .. } => Self::UiModal,
            ApiRequest::CollectionList { .. } | ApiRequest::CollectionGet { .. } => {
                Self::CollectionRead
            }
            ApiRequest::CollectionTag { .. } => Self::CollectionWrite,
            ApiRequest::HttpGet { .. } => Self::Network,
        }
    }

    pub fn info(&self) -> &'static CapabilityInfo {
        // CAPABILITY_INFO is declared in the same order as the enum.
        &CAPABILITY_INFO[*self as usize]
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCapability(pub String);

impl fmt::Display for UnknownCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown capability '{}'", self.0)
    }
}

impl std::error::Error for UnknownCapability {}

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.id() == s)
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityCategory {
    Storage,
    Network,
    Notification,
    Collection,
    Settings,
    Ui,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapabilityInfo {
    pub capability: Capability,
    pub category: CapabilityCategory,
    pub risk: RiskLevel,
    pub requires_consent: bool,
    pub description: &'static str,
}

pub static CAPABILITY_INFO: [CapabilityInfo; 8] = [
    CapabilityInfo {
        capability: Capability::Storage,
        category: CapabilityCategory::Storage,
        risk: RiskLevel::Low,
        requires_consent: false,
        description: "Store data private to the plugin",
    },
    CapabilityInfo {
        capability: Capability::Notification,
        category: CapabilityCategory::Notification,
        risk: RiskLevel::Low,
        requires_consent: false,
        description: "Show notifications",
    },
    CapabilityInfo {
        capability: Capability::SettingsRead,
        category: CapabilityCategory::Settings,
        risk: RiskLevel::Low,
        requires_consent: false,
        description: "Read its own settings",
    },
    CapabilityInfo {
        capability: Capability::SettingsWrite,
        category: CapabilityCategory::Settings,
        risk: RiskLevel::Medium,
        requires_consent: false,
        description: "Change its own settings",
    },
    CapabilityInfo {
        capability: Capability::UiModal,
        category: CapabilityCategory::Ui,
        risk: RiskLevel::Medium,
        requires_consent: false,
        description: "Open dialogs",
    },
    CapabilityInfo {
        capability: Capability::CollectionRead,
        category: CapabilityCategory::Collection,
        risk: RiskLevel::Medium,
        requires_consent: true,
        description: "Read your card collection",
    },
    CapabilityInfo {
        capability: Capability::Network,
        category: CapabilityCategory::Network,
        risk: RiskLevel::High,
        requires_consent: true,
        description: "Make network requests",
    },
    CapabilityInfo {
        capability: Capability::CollectionWrite,
        category: CapabilityCategory::Collection,
        risk: RiskLevel::High,
        requires_consent: true,
        description: "Modify your card collection",
    },
];

/// Resource ceilings and capability set of a trust tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub tier: TrustTier,
    pub allowed: &'static [Capability],
    pub max_cache_bytes: u64,
    pub max_concurrent_sandboxes: usize,
    pub cache_ttl: Duration,
}

impl TierLimits {
    pub fn allows(&self, capability: Capability) -> bool {
        self.allowed.contains(&capability)
    }
}

const MIB: u64 = 1024 * 1024;
const DAY: u64 = 24 * 60 * 60;

const COMMUNITY_CAPS: &[Capability] = &[
    Capability::Storage,
    Capability::Notification,
    Capability::SettingsRead,
    Capability::SettingsWrite,
    Capability::UiModal,
];

const CURATED_CAPS: &[Capability] = &[
    Capability::Storage,
    Capability::Notification,
    Capability::SettingsRead,
    Capability::SettingsWrite,
    Capability::UiModal,
    Capability::CollectionRead,
    Capability::Network,
];

pub static TIER_LIMITS: [TierLimits; 3] = [
    TierLimits {
        tier: TrustTier::Community,
        allowed: COMMUNITY_CAPS,
        max_cache_bytes: 16 * MIB,
        max_concurrent_sandboxes: 4,
        cache_ttl: Duration::from_secs(DAY),
    },
    TierLimits {
        tier: TrustTier::Curated,
        allowed: CURATED_CAPS,
        max_cache_bytes: 64 * MIB,
        max_concurrent_sandboxes: 8,
        cache_ttl: Duration::from_secs(7 * DAY),
    },
    TierLimits {
        tier: TrustTier::Builtin,
        allowed: &Capability::ALL,
        max_cache_bytes: 256 * MIB,
        max_concurrent_sandboxes: 16,
        cache_ttl: Duration::from_secs(30 * DAY),
    },
];

/// Outcome of reconciling a requested capability set against a tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapabilityValidation {
    /// Inside the tier and granted without asking.
    pub allowed: BTreeSet<Capability>,
    /// Outside the tier. Never granted, never asked.
    pub blocked: BTreeSet<Capability>,
    /// Inside the tier but only with user consent.
    pub needs_consent: BTreeSet<Capability>,
}

pub fn get_capability_info(id: &str) -> Option<&'static CapabilityInfo> {
    id.parse::<Capability>().ok().map(|c| c.info())
}

pub fn get_capabilities_by_category(category: CapabilityCategory) -> Vec<&'static CapabilityInfo> {
    CAPABILITY_INFO
        .iter()
        .filter(|info| info.category == category)
        .collect()
}

pub fn get_tier_limits(tier: TrustTier) -> &'static TierLimits {
    match tier {
        TrustTier::Community => &TIER_LIMITS[0],
        TrustTier::Curated => &TIER_LIMITS[1],
        TrustTier::Builtin => &TIER_LIMITS[2],
    }
}

pub fn get_allowed_capabilities(tier: TrustTier) -> &'static [Capability] {
    get_tier_limits(tier).allowed
}

pub fn get_blocked_capabilities(tier: TrustTier, requested: &[Capability]) -> BTreeSet<Capability> {
    let limits = get_tier_limits(tier);
    requested
        .iter()
        .copied()
        .filter(|c| !limits.allows(*c))
        .collect()
}

pub fn get_consent_capabilities(requested: &[Capability]) -> BTreeSet<Capability> {
    requested
        .iter()
        .copied()
        .filter(|c| c.info().requires_consent)
        .collect()
}

pub fn validate_capabilities(tier: TrustTier, requested: &[Capability]) -> CapabilityValidation {
    let limits = get_tier_limits(tier);
    let mut out = CapabilityValidation::default();
    for &cap in requested {
        if !limits.allows(cap) {
            out.blocked.insert(cap);
        } else if cap.info().requires_consent && tier != TrustTier::Builtin {
            out.needs_consent.insert(cap);
        } else {
            out.allowed.insert(cap);
        }
    }
    out
}

/// Parses capability ids, returning the unknown ones separately.
pub fn parse_capabilities<'a>(
    ids: impl IntoIterator<Item = &'a str>,
) -> (Vec<Capability>, Vec<String>) {
    let mut known = Vec::new();
    let mut unknown = Vec::new();
    for id in ids {
        match id.parse::<Capability>() {
            Ok(c) if !known.contains(&c) => known.push(c),
            Ok(_) => {}
            Err(e) => unknown.push(e.0),
        }
    }
    (known, unknown)
}
