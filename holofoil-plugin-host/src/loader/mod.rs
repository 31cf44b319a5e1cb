//! Plugin loader and lifecycle registry.
//!
//! The loader owns one record per plugin id and drives it through
//! [`PluginState`]: validation, permission resolution, sandbox start and
//! adapter wiring. Each sandbox holds a slot from its tier's semaphore for
//! as long as it runs; loads beyond the ceiling wait for a slot, preloads
//! skip instead.
//!
//! Every load carries a generation number. Unloading or replacing a record
//! bumps it, so a load still in flight notices it was superseded and backs
//! out instead of resurrecting the plugin.

mod services;

pub use services::HostServices;

use crate::adapters::PluginTheme;
use crate::capabilities::{self, Capability};
use crate::error::{PluginHostError, Result};
use crate::install::{InstalledPluginInfo, PluginOrigin};
use crate::lifecycle::PluginState;
use crate::permissions::PermissionRequestResult;
use crate::preload::{PreloadCandidate, PreloadOptions, PreloadQueue, select_preload_candidates};
use crate::sandbox::{
    NativeWorkerCtor, SandboxEvent, SandboxOptions, WorkerFactory, WorkerSandbox, create_worker_sandbox,
    register_sandbox_api_handlers,
};
use crate::validator::{self, ValidationIssue, ValidationResult};
use holofoil_storage::{CacheQuota, MaintenanceReport};
use holofoil_types::{AssetDecl, PluginId, PluginManifest, TrustTier};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 128;

/// Raw material for one plugin, as fetched or bundled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginPackage {
    /// Untrusted manifest JSON. Validated on load.
    pub manifest: Value,
    pub code: Option<String>,
    /// Asset bytes by declared path. Missing assets come from the cache or
    /// are fetched relative to the plugin's origin.
    pub assets: BTreeMap<String, Vec<u8>>,
}

impl PluginPackage {
    pub fn new(manifest: Value) -> Self {
        Self {
            manifest,
            ..Default::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_asset(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.assets.insert(path.into(), bytes.into());
        self
    }
}

/// Read-only view of a plugin record.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedPlugin {
    pub plugin_id: PluginId,
    pub name: String,
    pub version: String,
    pub state: PluginState,
    pub tier: TrustTier,
    pub builtin: bool,
    pub origin: PluginOrigin,
    /// Present once validation passed.
    pub manifest: Option<PluginManifest>,
    pub granted: BTreeSet<Capability>,
    /// Outcome of the last permission resolution.
    pub permission: Option<PermissionRequestResult>,
    pub warnings: Vec<ValidationIssue>,
    /// Why the plugin is in `error`, readable by end users.
    pub last_error: Option<String>,
    pub sandbox_session: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoaderEvent {
    Discovered { plugin_id: PluginId },
    StateChanged {
        plugin_id: PluginId,
        from: PluginState,
        to: PluginState,
    },
    /// Forwarded from a plugin's sandbox.
    Emitted {
        plugin_id: PluginId,
        name: String,
        payload: Value,
    },
}

struct PluginRecord {
    plugin_id: PluginId,
    name: String,
    version: String,
    package: PluginPackage,
    manifest: Option<PluginManifest>,
    state: PluginState,
    tier: TrustTier,
    builtin: bool,
    origin: PluginOrigin,
    granted: BTreeSet<Capability>,
    permission: Option<PermissionRequestResult>,
    warnings: Vec<ValidationIssue>,
    last_error: Option<String>,
    sandbox: Option<WorkerSandbox>,
    permit: Option<OwnedSemaphorePermit>,
    generation: u64,
}

/// Sandbox and slot taken off a record, to be released outside the lock.
struct Detached {
    sandbox: Option<WorkerSandbox>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PluginRecord {
    fn detach(&mut self) -> Detached {
        Detached {
            sandbox: self.sandbox.take(),
            permit: self.permit.take(),
        }
    }

    fn snapshot(&self) -> LoadedPlugin {
        LoadedPlugin {
            plugin_id: self.plugin_id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            state: self.state,
            tier: self.tier,
            builtin: self.builtin,
            origin: self.origin.clone(),
            manifest: self.manifest.clone(),
            granted: self.granted.clone(),
            permission: self.permission.clone(),
            warnings: self.warnings.clone(),
            last_error: self.last_error.clone(),
            sandbox_session: self.sandbox.as_ref().map(|s| s.session_id()),
        }
    }
}

struct LoadTicket {
    generation: u64,
    package: PluginPackage,
    tier: TrustTier,
    builtin: bool,
    origin: PluginOrigin,
}

/// The plugin loader. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct PluginLoader {
    inner: Arc<LoaderInner>,
}

struct LoaderInner {
    services: HostServices,
    plugins: RwLock<HashMap<PluginId, PluginRecord>>,
    builtin_ids: RwLock<BTreeSet<PluginId>>,
    slots: HashMap<TrustTier, Arc<Semaphore>>,
    load_locks: Mutex<HashMap<PluginId, Arc<tokio::sync::Mutex<()>>>>,
    preload_queue: PreloadQueue,
    next_generation: AtomicU64,
    events: broadcast::Sender<LoaderEvent>,
    initialized: AtomicBool,
}

impl PluginLoader {
    pub fn new(services: HostServices) -> Self {
        let slots = TrustTier::ALL
            .iter()
            .map(|tier| {
                let limit = capabilities::get_tier_limits(*tier).max_concurrent_sandboxes;
                (*tier, Arc::new(Semaphore::new(limit)))
            })
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(LoaderInner {
                services,
                plugins: RwLock::new(HashMap::new()),
                builtin_ids: RwLock::new(BTreeSet::new()),
                slots,
                load_locks: Mutex::new(HashMap::new()),
                preload_queue: PreloadQueue::new(),
                next_generation: AtomicU64::new(1),
                events,
                initialized: AtomicBool::new(false),
            }),
        }
    }

    pub fn services(&self) -> &HostServices {
        &self.inner.services
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.inner.events.subscribe()
    }

    // ================================================================
    // Startup / shutdown
    // ================================================================

    /// Restores persisted grants, rediscovers installed plugins and runs the
    /// configured preload. Call after builtins are registered and before any
    /// explicit load. Calling it twice does nothing.
    pub async fn init(&self) -> Result<()> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let s = &self.inner.services;
        s.permissions.restore(s.install.permissions().await);

        let mut discovered = 0usize;
        for info in s.install.list().await {
            if info.origin == PluginOrigin::Bundled || self.get_plugin(&info.plugin_id).is_some() {
                continue;
            }
            if !s.install.preferences(&info.plugin_id).await.enabled {
                debug!(plugin_id = %info.plugin_id, "installed plugin disabled, not discovering");
                continue;
            }
            match self.discover_installed(&info).await {
                Ok(_) => discovered += 1,
                Err(e) => {
                    warn!(plugin_id = %info.plugin_id, error = %e, "installed plugin could not be discovered");
                }
            }
        }

        self.perform_cache_maintenance().await;
        let preloaded = self
            .preload_plugins(PreloadOptions::from(&s.config.preload))
            .await;
        info!(discovered, preloaded = preloaded.len(), "plugin loader initialized");
        Ok(())
    }

    /// Stops every sandbox and persists grants. Last-active preferences are
    /// kept so the next start can preload the same plugins.
    pub async fn shutdown(&self) {
        self.inner.preload_queue.clear();
        let live: Vec<PluginId> = self
            .inner
            .read()
            .values()
            .filter(|r| r.state.has_sandbox() || r.state.is_loading())
            .map(|r| r.plugin_id.clone())
            .collect();
        for plugin_id in &live {
            if let Err(e) = self.teardown(plugin_id).await {
                debug!(plugin_id = %plugin_id, error = %e, "teardown during shutdown failed");
            }
        }
        self.persist_permissions().await;
        self.inner.initialized.store(false, Ordering::SeqCst);
        info!(stopped = live.len(), "plugin loader shut down");
    }

    // ================================================================
    // Discovery
    // ================================================================

    /// Records a plugin as `discovered`. An existing record with the same id
    /// is replaced; its sandbox is torn down first.
    pub async fn discover_plugin(&self, origin: PluginOrigin, package: PluginPackage) -> Result<PluginId> {
        let raw_id = package
            .manifest
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| PluginHostError::Validation {
                plugin_id: "<unknown>".into(),
                summary: "manifest has no string 'id'".into(),
            })?;
        let plugin_id = PluginId::parse(raw_id).map_err(|e| PluginHostError::Validation {
            plugin_id: raw_id.to_string(),
            summary: e.to_string(),
        })?;

        let builtin = self.is_builtin(&plugin_id);
        if builtin && origin != PluginOrigin::Bundled {
            return Err(PluginHostError::PolicyDenied(format!(
                "'{plugin_id}' is reserved for a builtin plugin"
            )));
        }
        let hint = package
            .manifest
            .get("tier")
            .and_then(Value::as_str)
            .and_then(|t| t.parse::<TrustTier>().ok())
            .unwrap_or_default();
        let tier = hint.min(tier_ceiling(&origin, builtin));
        let name = string_field(&package.manifest, "name").unwrap_or_else(|| plugin_id.to_string());
        let version = string_field(&package.manifest, "version").unwrap_or_else(|| "0.0.0".into());

        let s = &self.inner.services;
        if origin != PluginOrigin::Bundled {
            let known = s
                .install
                .get(&plugin_id)
                .await
                .is_some_and(|i| i.version == version && i.origin == origin && i.tier == tier);
            if !known {
                s.install
                    .record_install(&plugin_id, &name, &version, tier, origin.clone())
                    .await?;
            }
        }

        let record = PluginRecord {
            plugin_id: plugin_id.clone(),
            name,
            version,
            package,
            manifest: None,
            state: PluginState::Discovered,
            tier,
            builtin,
            origin,
            granted: BTreeSet::new(),
            permission: None,
            warnings: Vec::new(),
            last_error: None,
            sandbox: None,
            permit: None,
            generation: self.inner.next_generation(),
        };
        let previous = self.inner.write().insert(plugin_id.clone(), record);
        if let Some(mut old) = previous {
            let detached = old.detach();
            if detached.sandbox.is_some() {
                info!(plugin_id = %plugin_id, "replacing plugin record, stopping previous sandbox");
            }
            if old.state == PluginState::PermissionPending {
                debug!(plugin_id = %plugin_id, "replacing plugin record, abandoning its consent prompt");
            }
            s.permissions.cancel_pending_consent(&plugin_id);
            self.inner.teardown_detached(&plugin_id, detached);
        }

        info!(plugin_id = %plugin_id, tier = %tier, builtin, "plugin discovered");
        let _ = self.inner.events.send(LoaderEvent::Discovered {
            plugin_id: plugin_id.clone(),
        });
        Ok(plugin_id)
    }

    /// Fetches a manifest (and the code it names) from the origin's URL and
    /// discovers it.
    pub async fn discover_from_url(&self, origin: PluginOrigin) -> Result<PluginId> {
        let url = origin
            .url()
            .ok_or_else(|| PluginHostError::Config("bundled plugins have no url".into()))?
            .to_string();
        let fetcher = &self.inner.services.fetcher;
        let manifest = fetcher.fetch(&url).await?.json()?;
        let mut package = PluginPackage::new(manifest);
        if let Some(main) = string_field(&package.manifest, "main") {
            if let Some(problem) = validator::relative_path_problem(&main) {
                return Err(PluginHostError::Validation {
                    plugin_id: string_field(&package.manifest, "id").unwrap_or_default(),
                    summary: format!("main '{main}' {problem}"),
                });
            }
            let code_url = resolve_url(&url, &main)?;
            package.code = Some(fetcher.fetch(&code_url).await?.text());
        }
        self.discover_plugin(origin, package).await
    }

    /// Rediscovers an installed plugin, from the cache when it is still fresh.
    async fn discover_installed(&self, info: &InstalledPluginInfo) -> Result<PluginId> {
        let cache = &self.inner.services.cache;
        match cache.get_cached_manifest(&info.plugin_id).await {
            Ok(Some(cached)) => {
                let code = match &cached.manifest.main {
                    Some(main) => cache
                        .get_cached_asset(&info.plugin_id, main, None)
                        .await
                        .ok()
                        .flatten()
                        .map(|a| String::from_utf8_lossy(&a.bytes).into_owned()),
                    None => None,
                };
                if cached.manifest.main.is_none() || code.is_some() {
                    debug!(plugin_id = %info.plugin_id, "using cached manifest");
                    let package = PluginPackage {
                        manifest: serde_json::to_value(&cached.manifest)?,
                        code,
                        assets: BTreeMap::new(),
                    };
                    return self.discover_plugin(info.origin.clone(), package).await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(plugin_id = %info.plugin_id, error = %e, "manifest cache unavailable"),
        }
        self.discover_from_url(info.origin.clone()).await
    }

    // ================================================================
    // Builtins
    // ================================================================

    /// Registers a plugin compiled into the host. Builtins skip fetching and
    /// code validation but still go through the permission manager.
    pub async fn register_builtin_plugin(
        &self,
        mut manifest: PluginManifest,
        worker: Option<NativeWorkerCtor>,
    ) -> Result<PluginId> {
        let plugin_id = manifest.id.clone();
        self.inner
            .builtin_ids
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(plugin_id.clone());
        if let Some(ctor) = worker {
            self.inner
                .services
                .workers
                .register_native(plugin_id.clone(), move |m| ctor(m));
        }
        manifest.tier = TrustTier::Builtin;
        let package = PluginPackage::new(serde_json::to_value(&manifest)?);
        self.discover_plugin(PluginOrigin::Bundled, package).await
    }

    pub fn get_builtin_plugin_ids(&self) -> Vec<PluginId> {
        self.inner
            .builtin_ids
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn is_builtin(&self, plugin_id: &PluginId) -> bool {
        self.inner
            .builtin_ids
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(plugin_id)
    }

    // ================================================================
    // Loading
    // ================================================================

    /// Loads (or reloads) a plugin up to `ready`. A running instance is torn
    /// down first.
    pub async fn load_plugin(&self, plugin_id: &PluginId) -> Result<LoadedPlugin> {
        let lock = self.inner.load_lock(plugin_id);
        let _guard = lock.lock().await;
        self.load_locked(plugin_id, None).await
    }

    /// Loads the plugin if nothing has loaded it yet; otherwise returns its
    /// current record.
    pub async fn lazy_load_plugin(&self, plugin_id: &PluginId) -> Result<LoadedPlugin> {
        let lock = self.inner.load_lock(plugin_id);
        let _guard = lock.lock().await;
        match self.inner.state_of(plugin_id)? {
            PluginState::Discovered | PluginState::Unloaded => self.load_locked(plugin_id, None).await,
            _ => self.snapshot(plugin_id),
        }
    }

    /// Loads a discovered plugin only if a sandbox slot is free right now.
    /// Returns whether the plugin ended up with a sandbox.
    pub async fn preload_plugin(&self, plugin_id: &PluginId) -> Result<bool> {
        let lock = self.inner.load_lock(plugin_id);
        let _guard = lock.lock().await;
        let (state, tier) = {
            let plugins = self.inner.read();
            let record = plugins
                .get(plugin_id)
                .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))?;
            (record.state, record.tier)
        };
        if state.has_sandbox() {
            return Ok(true);
        }
        if !matches!(state, PluginState::Discovered | PluginState::Unloaded) {
            return Ok(false);
        }
        let Ok(permit) = self.inner.slot(tier).try_acquire_owned() else {
            debug!(plugin_id = %plugin_id, tier = %tier, "no free sandbox slot, preload skipped");
            return Ok(false);
        };
        self.load_locked(plugin_id, Some(permit)).await?;
        Ok(true)
    }

    /// Queues the plugins `options.strategy` selects and preloads them with at
    /// most `options.max_concurrent` at a time. Returns the ones now loaded.
    pub async fn preload_plugins(&self, options: PreloadOptions) -> Vec<PluginId> {
        if options.max_concurrent == 0 {
            return Vec::new();
        }
        let s = &self.inner.services;
        let last_active: HashSet<PluginId> = s.install.last_active_ids().await.into_iter().collect();
        let discovered: Vec<(PluginId, bool)> = self
            .inner
            .read()
            .values()
            .filter(|r| r.state == PluginState::Discovered)
            .map(|r| (r.plugin_id.clone(), r.builtin))
            .collect();

        let mut candidates = Vec::with_capacity(discovered.len());
        for (plugin_id, builtin) in discovered {
            if !s.install.preferences(&plugin_id).await.enabled {
                continue;
            }
            candidates.push(PreloadCandidate {
                last_active: last_active.contains(&plugin_id),
                plugin_id,
                builtin,
            });
        }
        for plugin_id in select_preload_candidates(options.strategy, &candidates) {
            self.inner.preload_queue.push(plugin_id);
        }

        let loaded = Mutex::new(Vec::new());
        let (this, loaded_ref) = (self, &loaded);
        let workers = (0..options.max_concurrent).map(move |_| async move {
            while let Some(plugin_id) = this.inner.preload_queue.pop() {
                match this.preload_plugin(&plugin_id).await {
                    Ok(true) => loaded_ref.lock().unwrap_or_else(|e| e.into_inner()).push(plugin_id),
                    Ok(false) => {}
                    Err(e) => warn!(plugin_id = %plugin_id, error = %e, "preload failed"),
                }
            }
        });
        futures::future::join_all(workers).await;
        loaded.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    async fn load_locked(
        &self,
        plugin_id: &PluginId,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<LoadedPlugin> {
        let ticket = self.begin_load(plugin_id)?;
        let generation = ticket.generation;
        match self.run_load(plugin_id, ticket, permit).await {
            Ok(()) => self.snapshot(plugin_id),
            Err(e) => Err(self.inner.fail(plugin_id, generation, e)),
        }
    }

    fn begin_load(&self, plugin_id: &PluginId) -> Result<LoadTicket> {
        let generation = self.inner.next_generation();
        let (ticket, from, old) = {
            let mut plugins = self.inner.write();
            let record = plugins
                .get_mut(plugin_id)
                .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))?;
            let from = record.state;
            if from.is_loading() {
                return Err(PluginHostError::InvalidTransition {
                    plugin_id: plugin_id.to_string(),
                    from,
                    to: PluginState::Validating,
                });
            }
            // A running instance goes through `unloaded` on its way back.
            let via = if from.has_sandbox() { PluginState::Unloaded } else { from };
            record.state = via.transition(plugin_id, PluginState::Validating)?;
            let old = record.detach();
            record.generation = generation;
            record.manifest = None;
            record.granted.clear();
            record.permission = None;
            record.warnings.clear();
            record.last_error = None;
            let ticket = LoadTicket {
                generation,
                package: record.package.clone(),
                tier: record.tier,
                builtin: record.builtin,
                origin: record.origin.clone(),
            };
            (ticket, from, old)
        };
        if old.sandbox.is_some() {
            info!(plugin_id = %plugin_id, "reloading, stopping running sandbox first");
        }
        self.inner.teardown_detached(plugin_id, old);
        self.inner.state_changed(plugin_id, from, PluginState::Validating);
        Ok(ticket)
    }

    async fn run_load(
        &self,
        plugin_id: &PluginId,
        ticket: LoadTicket,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<()> {
        let LoadTicket {
            generation,
            package,
            tier,
            builtin,
            origin,
        } = ticket;
        let inner = &self.inner;
        let s = &inner.services;

        if !s.policy.is_plugin_allowed(plugin_id.as_str(), builtin) {
            return Err(PluginHostError::PolicyDenied(format!(
                "plugin '{plugin_id}' is blocked by host policy"
            )));
        }

        let (manifest, warnings) = validate_package(plugin_id, &package, builtin)?;
        let remote = self
            .store_package(plugin_id, &manifest, &package, &origin, tier)
            .await?;
        inner.update(plugin_id, generation, |r| {
            r.manifest = Some(manifest.clone());
            r.warnings = warnings.clone();
        })?;
        inner.advance(plugin_id, generation, PluginState::Validated)?;

        inner.advance(plugin_id, generation, PluginState::PermissionPending)?;
        let granted = self
            .resolve_permissions(plugin_id, generation, tier, &manifest, warnings)
            .await?;
        self.fetch_remote_assets(plugin_id, &remote, &granted, tier).await?;

        let permit = match permit {
            Some(permit) => permit,
            None => inner
                .slot(tier)
                .acquire_owned()
                .await
                .map_err(|_| PluginHostError::SandboxInit {
                    plugin_id: plugin_id.to_string(),
                    message: "sandbox slots closed".into(),
                })?,
        };
        let sandbox = self
            .start_sandbox_with_retry(plugin_id, tier, &manifest, &granted)
            .await?;
        let attached = inner.update(plugin_id, generation, |r| {
            r.sandbox = Some(sandbox.clone());
            r.permit = Some(permit);
        });
        if let Err(e) = attached {
            sandbox.terminate();
            return Err(e);
        }
        s.sandboxes.insert(sandbox.clone());
        self.watch_sandbox(plugin_id.clone(), generation, &sandbox)?;

        inner.advance(plugin_id, generation, PluginState::Sandboxed)?;
        inner.advance(plugin_id, generation, PluginState::Ready)?;
        Ok(())
    }

    /// Caches the manifest, code and assets. Assets missing from the package
    /// come from the cache, then from the plugin's origin. Absolute-URL
    /// assets not in the cache are returned for [`Self::fetch_remote_assets`].
    /// Cache failures are absorbed.
    async fn store_package<'m>(
        &self,
        plugin_id: &PluginId,
        manifest: &'m PluginManifest,
        package: &PluginPackage,
        origin: &PluginOrigin,
        tier: TrustTier,
    ) -> Result<Vec<&'m AssetDecl>> {
        let s = &self.inner.services;
        let ttl = cache_ttl(tier);
        if let Err(e) = s.cache.cache_manifest(manifest, ttl).await {
            warn!(plugin_id = %plugin_id, error = %e, "failed to cache manifest");
        }
        if let (Some(main), Some(code)) = (&manifest.main, &package.code)
            && let Err(e) = s.cache.cache_asset(plugin_id, main, code.as_bytes(), ttl).await
        {
            warn!(plugin_id = %plugin_id, error = %e, "failed to cache plugin code");
        }

        let mut remote = Vec::new();
        for decl in &manifest.assets {
            let bytes = match package.assets.get(&decl.path) {
                Some(bytes) => bytes.clone(),
                None => {
                    match s
                        .cache
                        .get_cached_asset(plugin_id, &decl.path, decl.sha256.as_deref())
                        .await
                    {
                        Ok(Some(_)) => continue,
                        Ok(None) => {}
                        Err(e) => warn!(plugin_id = %plugin_id, asset = %decl.path, error = %e, "asset cache unavailable"),
                    }
                    if validator::is_url(&decl.path) {
                        remote.push(decl);
                        continue;
                    }
                    let base = origin.url().ok_or_else(|| PluginHostError::Validation {
                        plugin_id: plugin_id.to_string(),
                        summary: format!("asset '{}' is missing", decl.path),
                    })?;
                    s.fetcher.fetch(&resolve_url(base, &decl.path)?).await?.body
                }
            };
            check_asset(plugin_id, decl, &bytes)?;
            if let Err(e) = s.cache.cache_asset(plugin_id, &decl.path, &bytes, ttl).await {
                warn!(plugin_id = %plugin_id, asset = %decl.path, error = %e, "failed to cache asset");
            }
        }
        Ok(remote)
    }

    /// Fetches absolute-URL assets once `network` is granted. Without the
    /// grant they are skipped and the host never contacts their servers.
    async fn fetch_remote_assets(
        &self,
        plugin_id: &PluginId,
        remote: &[&AssetDecl],
        granted: &BTreeSet<Capability>,
        tier: TrustTier,
    ) -> Result<()> {
        if remote.is_empty() {
            return Ok(());
        }
        if !granted.contains(&Capability::Network) {
            for decl in remote {
                warn!(plugin_id = %plugin_id, asset = %decl.path, "network not granted, skipping remote asset");
            }
            return Ok(());
        }
        let s = &self.inner.services;
        let ttl = cache_ttl(tier);
        for decl in remote {
            let bytes = s.fetcher.fetch(&decl.path).await?.body;
            check_asset(plugin_id, decl, &bytes)?;
            if let Err(e) = s.cache.cache_asset(plugin_id, &decl.path, &bytes, ttl).await {
                warn!(plugin_id = %plugin_id, asset = %decl.path, error = %e, "failed to cache asset");
            }
        }
        Ok(())
    }

    async fn resolve_permissions(
        &self,
        plugin_id: &PluginId,
        generation: u64,
        tier: TrustTier,
        manifest: &PluginManifest,
        warnings: Vec<ValidationIssue>,
    ) -> Result<BTreeSet<Capability>> {
        let s = &self.inner.services;
        s.permissions.register_plugin(plugin_id, tier);
        let (requested, unknown) =
            capabilities::parse_capabilities(manifest.capabilities.iter().map(String::as_str));
        for id in unknown {
            warn!(plugin_id = %plugin_id, capability = %id, "ignoring unknown capability");
        }

        let result = s
            .permissions
            .request_plugin_capabilities(plugin_id, &requested, warnings)
            .await?;
        self.persist_permissions().await;

        for capability in &result.blocked {
            info!(plugin_id = %plugin_id, capability = %capability, tier = %tier, "capability unavailable at this tier");
        }
        let granted = result.granted.clone();
        let refusal = result
            .is_fully_refused()
            .then(|| refusal_error(plugin_id, tier, &result));
        self.inner.update(plugin_id, generation, |r| {
            r.granted = granted.clone();
            r.permission = Some(result);
        })?;
        match refusal {
            Some(e) => Err(e),
            None => Ok(granted),
        }
    }

    async fn start_sandbox_with_retry(
        &self,
        plugin_id: &PluginId,
        tier: TrustTier,
        manifest: &PluginManifest,
        granted: &BTreeSet<Capability>,
    ) -> Result<WorkerSandbox> {
        let s = &self.inner.services;
        let config = match s.cache.get_cached_config(plugin_id).await {
            Ok(Some(cached)) => cached.config,
            Ok(None) => Value::Null,
            Err(e) => {
                warn!(plugin_id = %plugin_id, error = %e, "cached config unavailable");
                Value::Null
            }
        };
        let options = SandboxOptions::new(plugin_id.clone(), tier)
            .with_timeouts(&s.config.sandbox)
            .with_capabilities(granted.iter().copied())
            .with_config(config)
            .with_handlers(Arc::clone(&s.handlers));

        match self.start_sandbox(manifest, options.clone()).await {
            Err(e) if e.is_retryable() => {
                warn!(plugin_id = %plugin_id, error = %e, "sandbox failed to start, retrying once");
                tokio::time::sleep(s.config.sandbox.init_retry_backoff()).await;
                self.start_sandbox(manifest, options).await
            }
            other => other,
        }
    }

    async fn start_sandbox(&self, manifest: &PluginManifest, options: SandboxOptions) -> Result<WorkerSandbox> {
        let s = &self.inner.services;
        let worker = s.workers.create_worker(manifest)?;
        create_worker_sandbox(options, worker, Arc::clone(&s.permissions)).await
    }

    /// Forwards sandbox events and moves the plugin to `error` if its worker
    /// dies.
    fn watch_sandbox(&self, plugin_id: PluginId, generation: u64, sandbox: &WorkerSandbox) -> Result<()> {
        let mut events = sandbox.subscribe();
        // A crash between start and subscribe has already been broadcast.
        if let Some(reason) = sandbox.crash_reason() {
            return Err(PluginHostError::SandboxCrashed {
                plugin_id: plugin_id.to_string(),
                message: reason,
            });
        }
        let loader = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(plugin_id = %plugin_id, skipped, "sandbox events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(inner) = loader.upgrade() else {
                    break;
                };
                match event {
                    SandboxEvent::Emitted { name, payload } => {
                        let _ = inner.events.send(LoaderEvent::Emitted {
                            plugin_id: plugin_id.clone(),
                            name,
                            payload,
                        });
                    }
                    SandboxEvent::Crashed { reason } => {
                        inner.fail(
                            &plugin_id,
                            generation,
                            PluginHostError::SandboxCrashed {
                                plugin_id: plugin_id.to_string(),
                                message: reason,
                            },
                        );
                        break;
                    }
                    SandboxEvent::Terminated => break,
                }
            }
        });
        Ok(())
    }

    // ================================================================
    // Activation
    // ================================================================

    /// Wires the plugin into the adapters. A plugin that was never loaded is
    /// loaded first. Activating a theme moves the previous theme plugin to
    /// `inactive`.
    pub async fn activate_plugin(&self, plugin_id: &PluginId) -> Result<LoadedPlugin> {
        if matches!(
            self.inner.state_of(plugin_id)?,
            PluginState::Discovered | PluginState::Unloaded
        ) {
            self.lazy_load_plugin(plugin_id).await?;
        }

        let manifest = {
            let plugins = self.inner.read();
            let record = plugins
                .get(plugin_id)
                .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))?;
            if record.state == PluginState::Active {
                return Ok(record.snapshot());
            }
            if !record.state.is_activatable() {
                return Err(PluginHostError::InvalidTransition {
                    plugin_id: plugin_id.to_string(),
                    from: record.state,
                    to: PluginState::Active,
                });
            }
            record
                .manifest
                .clone()
                .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))?
        };

        let displaced = self.wire(plugin_id, &manifest).await;
        if let Err(e) = self.inner.advance_current(plugin_id, PluginState::Active) {
            self.inner.unwire(plugin_id);
            return Err(e);
        }
        if let Some(previous) = displaced {
            info!(plugin_id = %previous, replaced_by = %plugin_id, "theme replaced");
            if let Err(e) = self.deactivate_plugin(&previous).await {
                debug!(plugin_id = %previous, error = %e, "displaced theme plugin was not active");
            }
        }
        self.remember_active(plugin_id, true).await;
        self.snapshot(plugin_id)
    }

    /// Unwires the plugin from the adapters. The sandbox keeps running.
    pub async fn deactivate_plugin(&self, plugin_id: &PluginId) -> Result<LoadedPlugin> {
        if self.inner.state_of(plugin_id)? == PluginState::Inactive {
            return self.snapshot(plugin_id);
        }
        let tier = self.inner.advance_current(plugin_id, PluginState::Inactive)?;
        self.persist_settings(plugin_id, tier).await;
        self.inner.unwire(plugin_id);
        self.remember_active(plugin_id, false).await;
        self.snapshot(plugin_id)
    }

    /// Registers entry points with the adapters. Returns the plugin whose
    /// theme was displaced, if any.
    async fn wire(&self, plugin_id: &PluginId, manifest: &PluginManifest) -> Option<PluginId> {
        let s = &self.inner.services;
        if s.settings.register_plugin_settings(plugin_id, manifest) {
            match s.cache.get_cached_config(plugin_id).await {
                Ok(Some(cached)) => s.settings.restore_values(plugin_id, &cached.config),
                Ok(None) => {}
                Err(e) => warn!(plugin_id = %plugin_id, error = %e, "cached settings unavailable"),
            }
        }
        s.mechanics.register_mechanic_from_plugin(plugin_id, manifest);
        s.sources.register_source_from_plugin(plugin_id, manifest);

        let mut displaced = None;
        if let Some(theme) = &manifest.entry_points.theme {
            let stylesheet = match &theme.stylesheet {
                Some(path) => self.read_asset_text(plugin_id, manifest, path).await,
                None => None,
            };
            displaced = s.themes.apply_theme(PluginTheme {
                plugin_id: plugin_id.clone(),
                theme: theme.clone(),
                stylesheet,
            });
        }
        debug!(plugin_id = %plugin_id, entry_points = ?manifest.entry_point_kinds(), "adapters wired");
        displaced
    }

    async fn read_asset_text(&self, plugin_id: &PluginId, manifest: &PluginManifest, path: &str) -> Option<String> {
        let digest = manifest
            .assets
            .iter()
            .find(|a| a.path == path)
            .and_then(|a| a.sha256.as_deref());
        match self
            .inner
            .services
            .cache
            .get_cached_asset(plugin_id, path, digest)
            .await
        {
            Ok(Some(asset)) => Some(String::from_utf8_lossy(&asset.bytes).into_owned()),
            Ok(None) => {
                warn!(plugin_id = %plugin_id, asset = %path, "stylesheet not in cache");
                None
            }
            Err(e) => {
                warn!(plugin_id = %plugin_id, asset = %path, error = %e, "stylesheet unavailable");
                None
            }
        }
    }

    // ================================================================
    // Unload / uninstall
    // ================================================================

    /// Stops the sandbox, rejecting its outstanding calls, and cancels any
    /// pending consent or queued preload. Cached data is kept.
    pub async fn unload_plugin(&self, plugin_id: &PluginId) -> Result<()> {
        if self.teardown(plugin_id).await? {
            self.remember_active(plugin_id, false).await;
        }
        Ok(())
    }

    /// Unloads the plugin and forgets it: grants, cache, stored data and the
    /// install record.
    pub async fn uninstall_plugin(&self, plugin_id: &PluginId) -> Result<()> {
        if self.is_builtin(plugin_id) {
            return Err(PluginHostError::PolicyDenied(format!(
                "builtin plugin '{plugin_id}' cannot be uninstalled"
            )));
        }
        self.teardown(plugin_id).await?;

        let s = &self.inner.services;
        self.inner.write().remove(plugin_id);
        self.inner
            .load_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(plugin_id);
        s.permissions.clear_plugin(plugin_id);
        s.settings.forget(plugin_id);
        s.workers.unregister_native(plugin_id);
        if let Err(e) = s.cache.clear_plugin_cache(plugin_id).await {
            warn!(plugin_id = %plugin_id, error = %e, "failed to clear plugin cache");
        }
        if let Err(e) = s.storage.clear(plugin_id).await {
            warn!(plugin_id = %plugin_id, error = %e, "failed to clear plugin storage");
        }
        s.install.remove(plugin_id).await?;
        self.persist_permissions().await;
        info!(plugin_id = %plugin_id, "plugin uninstalled");
        Ok(())
    }

    /// Moves a record to `unloaded`. Returns `false` if it already was.
    async fn teardown(&self, plugin_id: &PluginId) -> Result<bool> {
        self.inner.preload_queue.remove(plugin_id);
        let generation = self.inner.next_generation();
        let (from, tier, detached) = {
            let mut plugins = self.inner.write();
            let record = plugins
                .get_mut(plugin_id)
                .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))?;
            if record.state == PluginState::Unloaded {
                return Ok(false);
            }
            let from = record.state;
            record.state = from.transition(plugin_id, PluginState::Unloaded)?;
            record.generation = generation;
            (from, record.tier, record.detach())
        };
        self.inner.services.permissions.cancel_pending_consent(plugin_id);
        if from == PluginState::Active {
            self.persist_settings(plugin_id, tier).await;
        }
        self.inner.teardown_detached(plugin_id, detached);
        self.inner.state_changed(plugin_id, from, PluginState::Unloaded);
        Ok(true)
    }

    // ================================================================
    // Calls and permissions
    // ================================================================

    /// Invokes a plugin method through its sandbox, loading it on first use.
    pub async fn call_plugin(&self, plugin_id: &PluginId, method: &str, params: Value) -> Result<Value> {
        if matches!(
            self.inner.state_of(plugin_id)?,
            PluginState::Discovered | PluginState::Unloaded
        ) {
            self.lazy_load_plugin(plugin_id).await?;
        }
        let sandbox = self
            .sandbox(plugin_id)
            .ok_or_else(|| PluginHostError::SandboxTerminated(plugin_id.to_string()))?;
        sandbox.request(method, params).await
    }

    /// Grants a capability and installs its handler into a running sandbox.
    pub async fn grant_plugin_capability(&self, plugin_id: &PluginId, capability: Capability) -> Result<()> {
        let s = &self.inner.services;
        s.permissions.grant_plugin_capability(plugin_id, capability)?;
        let running = {
            let mut plugins = self.inner.write();
            let record = plugins
                .get_mut(plugin_id)
                .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))?;
            record.granted.insert(capability);
            record.sandbox.clone().map(|sb| (sb, record.granted.clone()))
        };
        if let Some((sandbox, granted)) = running {
            register_sandbox_api_handlers(&sandbox, &s.handlers, &granted);
        }
        self.persist_permissions().await;
        Ok(())
    }

    /// Revokes a capability. A running sandbox keeps going; its next call
    /// needing the capability fails.
    pub async fn revoke_plugin_capability(&self, plugin_id: &PluginId, capability: Capability) -> bool {
        let revoked = self
            .inner
            .services
            .permissions
            .revoke_plugin_capability(plugin_id, capability);
        if let Some(record) = self.inner.write().get_mut(plugin_id) {
            record.granted.remove(&capability);
        }
        self.persist_permissions().await;
        revoked
    }

    // ================================================================
    // Queries
    // ================================================================

    pub fn get_plugin(&self, plugin_id: &PluginId) -> Option<LoadedPlugin> {
        self.inner.read().get(plugin_id).map(PluginRecord::snapshot)
    }

    /// All records, ordered by id.
    pub fn list_plugins(&self) -> Vec<LoadedPlugin> {
        let mut plugins: Vec<LoadedPlugin> = self.inner.read().values().map(PluginRecord::snapshot).collect();
        plugins.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        plugins
    }

    pub fn sandbox(&self, plugin_id: &PluginId) -> Option<WorkerSandbox> {
        self.inner.read().get(plugin_id).and_then(|r| r.sandbox.clone())
    }

    pub fn preload_queue_len(&self) -> usize {
        self.inner.preload_queue.len()
    }

    /// Sweeps expired cache records and evicts down to the tier budgets.
    /// Failures are logged and absorbed.
    pub async fn perform_cache_maintenance(&self) -> Option<MaintenanceReport> {
        let s = &self.inner.services;
        let quota = CacheQuota {
            per_plugin: self
                .inner
                .read()
                .values()
                .map(|r| {
                    let limit = capabilities::get_tier_limits(r.tier).max_cache_bytes;
                    (r.plugin_id.to_string(), limit)
                })
                .collect(),
            default_per_plugin: Some(capabilities::get_tier_limits(TrustTier::Community).max_cache_bytes),
            global: s.config.cache.global_quota_bytes,
        };
        match s.cache.perform_cache_maintenance(&quota).await {
            Ok(report) => {
                debug!(
                    expired = report.expired_removed,
                    evicted = report.evicted,
                    bytes_freed = report.bytes_freed,
                    "cache maintenance finished"
                );
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "cache maintenance failed");
                None
            }
        }
    }

    fn snapshot(&self, plugin_id: &PluginId) -> Result<LoadedPlugin> {
        self.get_plugin(plugin_id)
            .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))
    }

    // ================================================================
    // Persistence helpers (failures absorbed)
    // ================================================================

    async fn persist_permissions(&self) {
        let s = &self.inner.services;
        if let Err(e) = s.install.save_permissions(s.permissions.snapshot()).await {
            warn!(error = %e, "failed to persist permission grants");
        }
    }

    async fn persist_settings(&self, plugin_id: &PluginId, tier: TrustTier) {
        let s = &self.inner.services;
        let values = s.settings.values_for(plugin_id);
        if values.as_object().is_none_or(|v| v.is_empty()) {
            return;
        }
        if let Err(e) = s.cache.cache_config(plugin_id, &values, cache_ttl(tier)).await {
            warn!(plugin_id = %plugin_id, error = %e, "failed to cache plugin settings");
        }
    }

    async fn remember_active(&self, plugin_id: &PluginId, active: bool) {
        if let Err(e) = self.inner.services.install.set_last_active(plugin_id, active).await {
            warn!(plugin_id = %plugin_id, error = %e, "failed to record active state");
        }
    }
}

impl LoaderInner {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PluginId, PluginRecord>> {
        self.plugins.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PluginId, PluginRecord>> {
        self.plugins.write().unwrap_or_else(|e| e.into_inner())
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn load_lock(&self, plugin_id: &PluginId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.load_locks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(plugin_id.clone())
                .or_default(),
        )
    }

    fn slot(&self, tier: TrustTier) -> Arc<Semaphore> {
        Arc::clone(&self.slots[&tier])
    }

    fn state_of(&self, plugin_id: &PluginId) -> Result<PluginState> {
        self.read()
            .get(plugin_id)
            .map(|r| r.state)
            .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))
    }

    /// Applies `f` if the record still belongs to load `generation`.
    fn update(&self, plugin_id: &PluginId, generation: u64, f: impl FnOnce(&mut PluginRecord)) -> Result<()> {
        let mut plugins = self.write();
        match plugins.get_mut(plugin_id) {
            Some(record) if record.generation == generation => {
                f(record);
                Ok(())
            }
            _ => Err(PluginHostError::LoadCancelled(plugin_id.to_string())),
        }
    }

    fn advance(&self, plugin_id: &PluginId, generation: u64, to: PluginState) -> Result<()> {
        let from = {
            let mut plugins = self.write();
            let record = plugins
                .get_mut(plugin_id)
                .filter(|r| r.generation == generation)
                .ok_or_else(|| PluginHostError::LoadCancelled(plugin_id.to_string()))?;
            let from = record.state;
            record.state = from.transition(plugin_id, to)?;
            from
        };
        self.state_changed(plugin_id, from, to);
        Ok(())
    }

    /// Transition on whatever load is current. Returns the plugin's tier.
    fn advance_current(&self, plugin_id: &PluginId, to: PluginState) -> Result<TrustTier> {
        let (from, tier) = {
            let mut plugins = self.write();
            let record = plugins
                .get_mut(plugin_id)
                .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))?;
            let from = record.state;
            record.state = from.transition(plugin_id, to)?;
            (from, record.tier)
        };
        self.state_changed(plugin_id, from, to);
        Ok(tier)
    }

    /// Moves the plugin to `error` with a readable reason and releases its
    /// sandbox and adapters. Returns `error` for the caller to propagate.
    fn fail(&self, plugin_id: &PluginId, generation: u64, error: PluginHostError) -> PluginHostError {
        if matches!(error, PluginHostError::LoadCancelled(_)) {
            debug!(plugin_id = %plugin_id, "load superseded");
            return error;
        }
        let failed = {
            let mut plugins = self.write();
            match plugins.get_mut(plugin_id) {
                Some(record)
                    if record.generation == generation
                        && record.state.can_transition_to(PluginState::Error) =>
                {
                    let from = record.state;
                    record.state = PluginState::Error;
                    record.last_error = Some(error.to_string());
                    Some((from, record.detach()))
                }
                _ => None,
            }
        };
        if let Some((from, detached)) = failed {
            error!(plugin_id = %plugin_id, error = %error, "plugin failed");
            self.teardown_detached(plugin_id, detached);
            self.state_changed(plugin_id, from, PluginState::Error);
        }
        error
    }

    fn teardown_detached(&self, plugin_id: &PluginId, detached: Detached) {
        if let Some(sandbox) = detached.sandbox {
            sandbox.terminate();
            self.services.sandboxes.remove(plugin_id, sandbox.session_id());
        }
        self.unwire(plugin_id);
        drop(detached.permit);
    }

    fn unwire(&self, plugin_id: &PluginId) {
        let s = &self.services;
        s.themes.remove_theme_of(plugin_id);
        s.mechanics.unregister_mechanics_from_plugin(plugin_id);
        s.settings.unregister_plugin_settings(plugin_id);
        s.sources.unregister_sources_from_plugin(plugin_id);
    }

    fn state_changed(&self, plugin_id: &PluginId, from: PluginState, to: PluginState) {
        info!(plugin_id = %plugin_id, from = %from, to = %to, "plugin state changed");
        let _ = self.events.send(LoaderEvent::StateChanged {
            plugin_id: plugin_id.clone(),
            from,
            to,
        });
    }
}

/// Most trusted tier a plugin from `origin` may claim.
fn tier_ceiling(origin: &PluginOrigin, builtin: bool) -> TrustTier {
    match origin {
        PluginOrigin::Bundled if builtin => TrustTier::Builtin,
        PluginOrigin::Bundled | PluginOrigin::Registry { .. } => TrustTier::Curated,
        PluginOrigin::User { .. } => TrustTier::Community,
    }
}

fn cache_ttl(tier: TrustTier) -> chrono::Duration {
    let ttl = capabilities::get_tier_limits(tier).cache_ttl;
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1))
}

fn string_field(value: &Value, name: &str) -> Option<String> {
    value.get(name).and_then(Value::as_str).map(str::to_string)
}

fn resolve_url(base: &str, relative: &str) -> Result<String> {
    reqwest::Url::parse(base)
        .and_then(|url| url.join(relative))
        .map(|url| url.to_string())
        .map_err(|e| PluginHostError::Config(format!("cannot resolve '{relative}' against '{base}': {e}")))
}

/// Runs the validator. Builtins are trusted to be well formed and only
/// deserialized.
fn validate_package(
    plugin_id: &PluginId,
    package: &PluginPackage,
    builtin: bool,
) -> Result<(PluginManifest, Vec<ValidationIssue>)> {
    let invalid = |report: &ValidationResult| PluginHostError::Validation {
        plugin_id: plugin_id.to_string(),
        summary: validator::format_validation_result(report),
    };

    let (manifest, mut report) = if builtin {
        let manifest: PluginManifest = serde_json::from_value(package.manifest.clone())?;
        (manifest, ValidationResult::default())
    } else {
        match validator::parse_manifest(&package.manifest) {
            Ok(validated) => (validated.manifest, validated.report),
            Err(report) => return Err(invalid(&report)),
        }
    };
    if manifest.id != *plugin_id {
        return Err(PluginHostError::Validation {
            plugin_id: plugin_id.to_string(),
            summary: format!("manifest id changed to '{}'", manifest.id),
        });
    }

    if !builtin && let Some(main) = &manifest.main {
        let Some(code) = &package.code else {
            return Err(PluginHostError::Validation {
                plugin_id: plugin_id.to_string(),
                summary: format!("code '{main}' is missing"),
            });
        };
        let (requested, _) =
            capabilities::parse_capabilities(manifest.capabilities.iter().map(String::as_str));
        report.merge(validator::validate_plugin_code(code, &requested));
        if !report.is_valid() {
            return Err(invalid(&report));
        }
    }

    let warnings = report.warnings().cloned().collect();
    Ok((manifest, warnings))
}

fn check_asset(plugin_id: &PluginId, decl: &AssetDecl, bytes: &[u8]) -> Result<()> {
    let mismatch = |what: &str| PluginHostError::Validation {
        plugin_id: plugin_id.to_string(),
        summary: format!("asset '{}' does not match its declared {what}", decl.path),
    };
    if bytes.len() as u64 != decl.size {
        return Err(mismatch("size"));
    }
    if let Some(expected) = &decl.sha256 {
        let actual = hex::encode(Sha256::digest(bytes));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(mismatch("sha256"));
        }
    }
    Ok(())
}

fn refusal_error(plugin_id: &PluginId, tier: TrustTier, result: &PermissionRequestResult) -> PluginHostError {
    let join = |set: &BTreeSet<Capability>| {
        set.iter()
            .map(Capability::id)
            .collect::<Vec<_>>()
            .join(", ")
    };
    if result.policy_denied.is_empty() {
        PluginHostError::TierBlocked {
            capability: join(&result.blocked),
            tier: tier.to_string(),
        }
    } else {
        PluginHostError::PolicyDenied(format!(
            "every capability '{plugin_id}' requested is refused ({})",
            join(&result.requested)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn origin_caps_the_tier_hint() {
        let user = PluginOrigin::User { url: "https://x.test/p.json".into() };
        let registry = PluginOrigin::Registry { url: "https://x.test/p.json".into() };
        assert_eq!(tier_ceiling(&user, false), TrustTier::Community);
        assert_eq!(tier_ceiling(&registry, false), TrustTier::Curated);
        assert_eq!(tier_ceiling(&PluginOrigin::Bundled, true), TrustTier::Builtin);
        assert_eq!(TrustTier::Builtin.min(tier_ceiling(&user, false)), TrustTier::Community);
    }

    #[test]
    fn relative_urls_resolve_against_the_manifest() {
        assert_eq!(
            resolve_url("https://plugins.test/foil/plugin.json", "assets/foil.css").unwrap(),
            "https://plugins.test/foil/assets/foil.css"
        );
        assert!(resolve_url("not a url", "x").is_err());
    }

    #[test]
    fn asset_checks_size_and_digest() {
        let id = PluginId::parse("community.foil").unwrap();
        let bytes = b"body { }";
        let decl = AssetDecl {
            path: "foil.css".into(),
            size: bytes.len() as u64,
            sha256: Some(hex::encode(Sha256::digest(bytes))),
        };
        assert!(check_asset(&id, &decl, bytes).is_ok());
        assert!(check_asset(&id, &decl, b"body { x }").is_err());
        let wrong_digest = AssetDecl { sha256: Some("00".repeat(32)), ..decl };
        assert!(check_asset(&id, &wrong_digest, bytes).is_err());
    }

    #[test]
    fn code_is_validated_for_untrusted_plugins() {
        let id = PluginId::parse("community.evil").unwrap();
        let package = PluginPackage::new(json!({
            "id": "community.evil",
            "name": "Evil",
            "version": "1.0.0",
            "main": "index.js",
            "entry_points": { "mechanic": { "id": "m", "name": "M" } }
        }))
        .with_code("eval(atob(payload))");
        let err = validate_package(&id, &package, false).unwrap_err();
        assert!(matches!(err, PluginHostError::Validation { .. }));

        let missing_code = PluginPackage { code: None, ..package };
        assert!(validate_package(&id, &missing_code, false).is_err());
    }
}
