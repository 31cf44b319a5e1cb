//! Host configuration, read from `~/.holofoil/plugins.toml`.
//!
//! A missing file runs with defaults. A file that cannot be read or parsed
//! also runs with defaults, but logs a warning.

use crate::policy::PolicyConfig;
use crate::preload::PreloadStrategy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub sandbox: SandboxConfig,
    pub cache: CacheConfig,
    pub preload: PreloadConfig,
    pub policy: PolicyConfig,
    pub install: InstallConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Deadline for a single host→worker request.
    pub rpc_timeout_ms: u64,
    /// Deadline for the worker to report `ready`.
    pub init_timeout_ms: u64,
    /// Delay before the single sandbox start retry.
    pub init_retry_backoff_ms: u64,
    /// Deadline for host API handlers called by a worker.
    pub api_timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 5_000,
            init_timeout_ms: 3_000,
            init_retry_backoff_ms: 250,
            api_timeout_ms: 30_000,
        }
    }
}

impl SandboxConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn init_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.init_retry_backoff_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// SQLite database file. Defaults to `~/.holofoil/plugins.db`.
    pub database_path: Option<PathBuf>,
    /// Byte budget across all plugins, on top of the per-tier budgets.
    pub global_quota_bytes: Option<u64>,
}

impl CacheConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| holofoil_dir().join("plugins.db"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
    pub strategy: PreloadStrategy,
    pub max_concurrent: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            strategy: PreloadStrategy::LastActive,
            max_concurrent: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Install registry JSON. Defaults to `~/.holofoil/installed.json`.
    pub registry_path: Option<PathBuf>,
}

impl InstallConfig {
    pub fn registry_path(&self) -> PathBuf {
        self.registry_path
            .clone()
            .unwrap_or_else(|| holofoil_dir().join("installed.json"))
    }
}

impl HostConfig {
    /// Loads `~/.holofoil/plugins.toml`.
    pub fn load() -> Self {
        Self::load_from(holofoil_dir().join("plugins.toml"))
    }

    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "no plugin host config, using defaults");
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded plugin host config");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid plugin host config, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable plugin host config, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

/// `~/.holofoil`, falling back to a relative directory without a home.
pub fn holofoil_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        Path::new(&home).join(".holofoil")
    } else if let Ok(home) = std::env::var("USERPROFILE") {
        Path::new(&home).join(".holofoil")
    } else {
        PathBuf::from(".holofoil")
    }
}
