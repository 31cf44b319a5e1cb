//! Sandbox execution bridge.
//!
//! Each plugin runs in its own OS thread behind a pair of channels carrying
//! JSON strings. The host side ([`WorkerSandbox`]) correlates requests with
//! replies, enforces deadlines, and answers the worker's host API calls
//! after checking capabilities.

mod bridge;
mod factory;
mod handlers;

pub use bridge::{WorkerSandbox, create_worker_sandbox};
pub use factory::{DeclarativeWorker, NativeWorkerCtor, WorkerFactory, WorkerRegistry};
pub use handlers::{
    ApiCaller, CollectionProvider, HandlerServices, MAX_LIST_PAGE, ModalHandler, NotificationHandler,
    PluginApiHandlers, create_plugin_api_handlers, register_sandbox_api_handlers,
};

use crate::capabilities::Capability;
use crate::config::SandboxConfig;
use holofoil_types::{PluginId, TrustTier};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// Parameters for starting one sandbox.
#[derive(Clone)]
pub struct SandboxOptions {
    pub plugin_id: PluginId,
    pub tier: TrustTier,
    /// Capabilities granted at start. Passed to the worker in `init`.
    pub capabilities: BTreeSet<Capability>,
    /// Resolved plugin configuration handed to the worker.
    pub config: Value,
    /// Installed before `init` so the worker may call host APIs from it.
    pub handlers: Option<Arc<PluginApiHandlers>>,
    pub rpc_timeout: Duration,
    pub init_timeout: Duration,
    pub api_timeout: Duration,
}

impl SandboxOptions {
    pub fn new(plugin_id: PluginId, tier: TrustTier) -> Self {
        let defaults = SandboxConfig::default();
        Self {
            plugin_id,
            tier,
            capabilities: BTreeSet::new(),
            config: Value::Null,
            handlers: None,
            rpc_timeout: defaults.rpc_timeout(),
            init_timeout: defaults.init_timeout(),
            api_timeout: defaults.api_timeout(),
        }
    }

    pub fn with_timeouts(mut self, config: &SandboxConfig) -> Self {
        self.rpc_timeout = config.rpc_timeout();
        self.init_timeout = config.init_timeout();
        self.api_timeout = config.api_timeout();
        self
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_handlers(mut self, handlers: Arc<PluginApiHandlers>) -> Self {
        self.handlers = Some(handlers);
        self
    }
}

/// Published to [`WorkerSandbox::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxEvent {
    /// The worker called `emit`.
    Emitted { name: String, payload: Value },
    /// The worker thread exited or panicked without being asked to.
    Crashed { reason: String },
    Terminated,
}

/// Running sandboxes by plugin id, shared with collaborators that need to
/// reach a plugin's worker outside the loader.
#[derive(Default)]
pub struct LiveSandboxes {
    sandboxes: RwLock<HashMap<PluginId, WorkerSandbox>>,
}

impl LiveSandboxes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sandbox: WorkerSandbox) -> Option<WorkerSandbox> {
        self.sandboxes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sandbox.plugin_id().clone(), sandbox)
    }

    /// Removes the entry only if it is still the sandbox with `session_id`.
    pub fn remove(&self, plugin_id: &PluginId, session_id: Uuid) -> bool {
        let mut sandboxes = self.sandboxes.write().unwrap_or_else(|e| e.into_inner());
        if sandboxes.get(plugin_id).is_some_and(|s| s.session_id() == session_id) {
            sandboxes.remove(plugin_id);
            true
        } else {
            false
        }
    }

    pub fn get(&self, plugin_id: &PluginId) -> Option<WorkerSandbox> {
        self.sandboxes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(plugin_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sandboxes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
