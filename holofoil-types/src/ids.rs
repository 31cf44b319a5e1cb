//! Plugin identifiers.
//!
//! A `PluginId` is embedded verbatim in cache keys (`plugin:{id}:...`) and
//! storage namespaces, so the charset is deliberately narrow: lowercase
//! ASCII letters, digits, `.`, `_` and `-`, starting with a letter or digit.

use crate::TypesError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Longest accepted plugin id.
pub const MAX_PLUGIN_ID_LEN: usize = 64;

/// Validated plugin identifier (e.g. `community.foil-shimmer`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PluginId(String);

impl PluginId {
    /// Parses and validates a plugin id.
    pub fn parse(s: &str) -> Result<Self, TypesError> {
        Self::check(s).map_err(|reason| TypesError::InvalidPluginId {
            id: s.to_string(),
            reason,
        })?;
        Ok(Self(s.to_string()))
    }

    /// Returns the reason `s` is not a valid id, if any.
    pub fn check(s: &str) -> Result<(), &'static str> {
        if s.is_empty() {
            return Err("id is empty");
        }
        if s.len() > MAX_PLUGIN_ID_LEN {
            return Err("id is longer than 64 characters");
        }
        let first = s.as_bytes()[0];
        if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
            return Err("id must start with a lowercase letter or digit");
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-'))
        {
            return Err("id may only contain a-z, 0-9, '.', '_' and '-'");
        }
        if s.contains("..") {
            return Err("id must not contain '..'");
        }
        Ok(())
    }

    /// Returns `true` if `s` would parse.
    pub fn is_valid(s: &str) -> bool {
        Self::check(s).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PluginId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PluginId {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::check(&value).map_err(|reason| TypesError::InvalidPluginId {
            id: value.clone(),
            reason,
        })?;
        Ok(Self(value))
    }
}

impl From<PluginId> for String {
    fn from(id: PluginId) -> Self {
        id.0
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
