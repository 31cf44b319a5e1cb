//! Collaborators the loader is built from.

use crate::adapters::{MechanicAdapter, PluginCollectionFetcher, SettingsAdapter, SourceAdapter, ThemeAdapter};
use crate::config::HostConfig;
use crate::error::Result;
use crate::fetch::{HttpFetcher, MemoryFetcher, PluginFetcher};
use crate::install::InstallRegistry;
use crate::permissions::{ConsentPrompt, PermissionManager};
use crate::policy::PolicyEngine;
use crate::sandbox::{HandlerServices, LiveSandboxes, PluginApiHandlers, WorkerRegistry, create_plugin_api_handlers};
use holofoil_storage::{KvStore, MemoryKvStore, PluginCache, PluginStorage, SqliteKvStore};
use std::sync::Arc;
use tracing::info;

/// Everything a [`PluginLoader`](super::PluginLoader) talks to.
#[derive(Clone)]
pub struct HostServices {
    pub config: HostConfig,
    pub policy: Arc<PolicyEngine>,
    pub permissions: Arc<PermissionManager>,
    pub cache: Arc<PluginCache>,
    pub storage: Arc<PluginStorage>,
    pub fetcher: Arc<dyn PluginFetcher>,
    pub install: Arc<InstallRegistry>,
    pub workers: Arc<WorkerRegistry>,
    pub sandboxes: Arc<LiveSandboxes>,
    pub handlers: Arc<PluginApiHandlers>,
    pub themes: Arc<ThemeAdapter>,
    pub mechanics: Arc<MechanicAdapter>,
    pub settings: Arc<SettingsAdapter>,
    pub sources: Arc<SourceAdapter>,
}

impl HostServices {
    /// Wires the services over the given store, fetcher and install registry.
    pub fn new(
        config: HostConfig,
        store: Arc<dyn KvStore>,
        fetcher: Arc<dyn PluginFetcher>,
        install: Arc<InstallRegistry>,
        prompt: Arc<dyn ConsentPrompt>,
    ) -> Self {
        let policy = Arc::new(PolicyEngine::new(config.policy.clone()));
        let permissions = Arc::new(PermissionManager::new(Arc::clone(&policy), prompt));
        let cache = Arc::new(PluginCache::new(Arc::clone(&store)));
        let storage = Arc::new(PluginStorage::new(store));
        let settings = Arc::new(SettingsAdapter::new());
        let sandboxes = Arc::new(LiveSandboxes::new());
        let sources = Arc::new(SourceAdapter::new(Arc::new(PluginCollectionFetcher::new(
            Arc::clone(&fetcher),
            Arc::clone(&sandboxes),
        ))));
        let handlers = create_plugin_api_handlers(HandlerServices {
            storage: Some(Arc::clone(&storage)),
            settings: Some(Arc::clone(&settings)),
            fetcher: Some(Arc::clone(&fetcher)),
        });

        Self {
            config,
            policy,
            permissions,
            cache,
            storage,
            fetcher,
            install,
            workers: Arc::new(WorkerRegistry::new()),
            sandboxes,
            handlers,
            themes: Arc::new(ThemeAdapter::new()),
            mechanics: Arc::new(MechanicAdapter::new()),
            settings,
            sources,
        }
    }

    /// Nothing touches disk or network. Used by tests and previews.
    pub fn in_memory(config: HostConfig, prompt: Arc<dyn ConsentPrompt>) -> Self {
        Self::new(
            config,
            Arc::new(MemoryKvStore::new()),
            Arc::new(MemoryFetcher::new()),
            Arc::new(InstallRegistry::in_memory()),
            prompt,
        )
    }

    /// SQLite cache, HTTP fetcher and on-disk install registry, at the paths
    /// named by `config`.
    pub async fn open(config: HostConfig, prompt: Arc<dyn ConsentPrompt>) -> Result<Self> {
        let db_path = config.cache.database_path();
        let store = Arc::new(SqliteKvStore::open(&db_path)?);
        let install = Arc::new(InstallRegistry::open(config.install.registry_path()).await?);
        let fetcher = Arc::new(HttpFetcher::new()?);
        info!(cache = %db_path.display(), "plugin host services opened");
        Ok(Self::new(config, store, fetcher, install, prompt))
    }
}
