//! Trust tiers.

use crate::TypesError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Provenance classification of a plugin.
///
/// Ordered from least to most trusted, so `Community < Curated < Builtin`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    /// User-supplied plugin from an arbitrary URL.
    #[default]
    Community,
    /// Reviewed plugin from the curated registry.
    Curated,
    /// Compiled into the application.
    Builtin,
}

impl TrustTier {
    pub const ALL: [TrustTier; 3] = [TrustTier::Community, TrustTier::Curated, TrustTier::Builtin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Community => "community",
            Self::Curated => "curated",
            Self::Builtin => "builtin",
        }
    }

    /// Returns `true` when this tier is at least as trusted as `other`.
    pub fn includes(&self, other: TrustTier) -> bool {
        *self >= other
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustTier {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "community" => Ok(Self::Community),
            "curated" => Ok(Self::Curated),
            "builtin" => Ok(Self::Builtin),
            other => Err(TypesError::UnknownTier(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_trust() {
        assert!(TrustTier::Community < TrustTier::Curated);
        assert!(TrustTier::Curated < TrustTier::Builtin);
        assert!(TrustTier::Builtin.includes(TrustTier::Community));
        assert!(!TrustTier::Community.includes(TrustTier::Curated));
    }

    #[test]
    fn parse_roundtrip() {
        for tier in TrustTier::ALL {
            assert_eq!(tier.as_str().parse::<TrustTier>().unwrap(), tier);
        }
        assert!("root".parse::<TrustTier>().is_err());
    }
}
