//! Sandboxed plugin host for Holofoil.
//!
//! Validates untrusted plugin manifests and code, resolves capability
//! grants by trust tier and user consent, runs each plugin in an isolated
//! worker thread behind a JSON message bridge, and wires plugin entry points
//! into the theme, mechanic, settings and collection-source adapters.
//!
//! A [`PluginLoader`] built from [`HostServices`] is the entry point:
//!
//! ```no_run
//! use holofoil_plugin_host::{AutoDeny, HostConfig, HostServices, PluginLoader};
//! use std::sync::Arc;
//!
//! # async fn run() -> holofoil_plugin_host::Result<()> {
//! let config = HostConfig::load();
//! let services = HostServices::open(config, Arc::new(AutoDeny)).await?;
//! let loader = PluginLoader::new(services);
//! holofoil_plugin_host::register_all_builtin_plugins(&loader).await?;
//! loader.init().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
mod builtin;
pub mod capabilities;
mod config;
mod error;
mod fetch;
mod install;
pub mod lifecycle;
mod loader;
mod permissions;
mod policy;
pub mod preload;
pub mod sandbox;
pub mod validator;

pub use builtin::{
    BUILTIN_MECHANIC_IDS, BUILTIN_PLUGIN_IDS, BUILTIN_SOURCE_IDS, BUILTIN_THEME_IDS, BuiltinPlugin,
    builtin_plugins, register_all_builtin_plugins,
};
pub use capabilities::{Capability, CapabilityCategory, RiskLevel, TierLimits};
pub use config::{CacheConfig, HostConfig, InstallConfig, PreloadConfig, SandboxConfig, holofoil_dir};
pub use error::{PluginHostError, Result};
pub use fetch::{FetchedResource, HttpFetcher, MemoryFetcher, PluginFetcher};
pub use install::{InstallRegistry, InstalledPluginInfo, PluginOrigin, PluginPreferences};
pub use lifecycle::PluginState;
pub use loader::{HostServices, LoadedPlugin, LoaderEvent, PluginLoader, PluginPackage};
pub use permissions::{
    AutoApprove, AutoDeny, ConsentDecision, ConsentPrompt, ConsentRequest, GrantState, PermissionCheckResult,
    PermissionGrant, PermissionManager, PermissionRequestResult, PermissionSnapshot, PluginGrantSnapshot,
};
pub use policy::{PolicyConfig, PolicyEngine, PolicyMode};
pub use preload::{PreloadOptions, PreloadStrategy};
pub use sandbox::{SandboxEvent, SandboxOptions, WorkerSandbox, create_worker_sandbox};
pub use validator::{ValidationIssue, ValidationResult, format_validation_result, parse_manifest};
