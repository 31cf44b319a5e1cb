use super::handlers::{ApiCaller, PluginApiHandlers};
use super::{SandboxEvent, SandboxOptions};
use crate::capabilities::Capability;
use crate::error::{PluginHostError, Result};
use crate::permissions::PermissionManager;
use holofoil_plugin_sdk::protocol::{decode, encode};
use holofoil_plugin_sdk::{
    ApiRequest, CorrelationId, ErrorTag, LogLevel, PluginWorker, ProtocolError, Reply, WorkerChannel,
    WorkerError, WorkerExit, WorkerInMessage, WorkerOutMessage, run_worker,
};
use holofoil_types::{PluginId, TrustTier};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;
/// Most timed-out ids remembered at once. The oldest is forgotten first.
const RETIRED_LIMIT: usize = 256;

/// How the worker thread ended: its own exit value, or a panic message.
type ThreadExit = std::result::Result<WorkerExit, String>;

struct PendingReply {
    /// Position in the order requests were posted to the worker.
    seq: u64,
    tx: oneshot::Sender<Result<WorkerOutMessage>>,
}

/// Host handle to a running sandbox. Cheap to clone; all clones share the
/// same worker.
#[derive(Clone)]
pub struct WorkerSandbox {
    inner: Arc<Inner>,
}

struct Inner {
    plugin_id: PluginId,
    tier: TrustTier,
    session_id: Uuid,
    outbound: Mutex<Option<UnboundedSender<String>>>,
    pending: Mutex<HashMap<CorrelationId, PendingReply>>,
    /// Ids whose caller gave up, keyed by post order. Their late replies
    /// are dropped.
    retired: Mutex<BTreeMap<u64, CorrelationId>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    installed: RwLock<BTreeSet<Capability>>,
    handlers: RwLock<Option<Arc<PluginApiHandlers>>>,
    permissions: Arc<PermissionManager>,
    events: broadcast::Sender<SandboxEvent>,
    ready: Mutex<Option<oneshot::Sender<Result<()>>>>,
    terminated: AtomicBool,
    crash_reason: Mutex<Option<String>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    rpc_timeout: Duration,
    api_timeout: Duration,
}

/// Starts a worker on its own thread and waits until it reports ready.
///
/// Fails with [`PluginHostError::SandboxInit`] if the thread cannot be
/// spawned, the worker's `init` fails, the worker dies first, or it does not
/// answer within `options.init_timeout`.
pub async fn create_worker_sandbox(
    options: SandboxOptions,
    worker: Box<dyn PluginWorker>,
    permissions: Arc<PermissionManager>,
) -> Result<WorkerSandbox> {
    let plugin_id = options.plugin_id.clone();
    let (host_tx, worker_rx) = mpsc::unbounded_channel::<String>();
    let (worker_tx, host_rx) = mpsc::unbounded_channel::<String>();
    let (exit_tx, exit_rx) = oneshot::channel::<ThreadExit>();
    let (ready_tx, ready_rx) = oneshot::channel();
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    let inner = Arc::new(Inner {
        plugin_id: plugin_id.clone(),
        tier: options.tier,
        session_id: Uuid::now_v7(),
        outbound: Mutex::new(Some(host_tx)),
        pending: Mutex::new(HashMap::new()),
        retired: Mutex::new(BTreeMap::new()),
        next_id: AtomicU64::new(1),
        next_seq: AtomicU64::new(0),
        installed: RwLock::new(if options.handlers.is_some() {
            options.capabilities.clone()
        } else {
            BTreeSet::new()
        }),
        handlers: RwLock::new(options.handlers.clone()),
        permissions,
        events,
        ready: Mutex::new(Some(ready_tx)),
        terminated: AtomicBool::new(false),
        crash_reason: Mutex::new(None),
        reader: Mutex::new(None),
        rpc_timeout: options.rpc_timeout,
        api_timeout: options.api_timeout,
    });

    let channel = WorkerChannel {
        inbound: worker_rx,
        outbound: worker_tx,
    };
    std::thread::Builder::new()
        .name(format!("plugin-{plugin_id}"))
        .spawn(move || {
            let exit = catch_unwind(AssertUnwindSafe(|| run_worker(worker, channel)))
                .map_err(|payload| panic_message(payload.as_ref()));
            let _ = exit_tx.send(exit);
        })
        .map_err(|e| PluginHostError::SandboxInit {
            plugin_id: plugin_id.to_string(),
            message: format!("failed to spawn worker thread: {e}"),
        })?;

    let reader = tokio::spawn(read_loop(Arc::downgrade(&inner), host_rx, exit_rx));
    *inner.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(reader);

    let sandbox = WorkerSandbox { inner };
    sandbox.inner.post(&WorkerInMessage::Init {
        plugin_id: plugin_id.to_string(),
        capabilities: options.capabilities.iter().map(|c| c.id().to_string()).collect(),
        config: options.config,
    })?;

    let started = match tokio::time::timeout(options.init_timeout, ready_rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(PluginHostError::SandboxInit {
            plugin_id: plugin_id.to_string(),
            message: "worker went away during init".into(),
        }),
        Err(_) => Err(PluginHostError::SandboxInit {
            plugin_id: plugin_id.to_string(),
            message: format!(
                "worker not ready within {}ms",
                options.init_timeout.as_millis()
            ),
        }),
    };
    if let Err(e) = started {
        sandbox.terminate();
        return Err(e);
    }

    info!(
        plugin_id = %plugin_id,
        session = %sandbox.inner.session_id,
        capabilities = options.capabilities.len(),
        "sandbox started"
    );
    Ok(sandbox)
}

impl WorkerSandbox {
    pub fn plugin_id(&self) -> &PluginId {
        &self.inner.plugin_id
    }

    /// Random id of this sandbox instance, for log correlation.
    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    /// Sends a request and waits for the reply carrying the same id.
    ///
    /// Only [`WorkerInMessage::Request`] expects a reply. An id that is
    /// already in flight, or whose caller timed out and whose reply has not
    /// arrived yet, is rejected with [`PluginHostError::DuplicateCorrelationId`].
    pub async fn send(&self, message: WorkerInMessage) -> Result<WorkerOutMessage> {
        let WorkerInMessage::Request { id, method, .. } = &message else {
            return Err(ProtocolError::Unexpected("only requests expect a reply".into()).into());
        };
        let (id, method) = (*id, method.clone());
        self.inner.ensure_running()?;

        let (tx, rx) = oneshot::channel();
        {
            // Held across the post so sequence numbers follow post order.
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            let retired_id = self
                .inner
                .retired
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .values()
                .any(|r| *r == id);
            if pending.contains_key(&id) || retired_id {
                return Err(PluginHostError::DuplicateCorrelationId(id));
            }
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            self.inner.post(&message)?;
            pending.insert(id, PendingReply { seq, tx });
        }
        debug!(plugin_id = %self.inner.plugin_id, id, method = %method, "sandbox request");

        match tokio::time::timeout(self.inner.rpc_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(self.inner.gone_error()),
            Err(_) => {
                if let Some(pending) = self.inner.take_pending(id) {
                    self.inner.retire(id, pending.seq);
                }
                warn!(plugin_id = %self.inner.plugin_id, id, method = %method, "sandbox request timed out");
                Err(PluginHostError::SandboxTimeout {
                    plugin_id: self.inner.plugin_id.to_string(),
                    timeout_ms: self.inner.rpc_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Calls a plugin method with a fresh correlation id.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        match self.send(WorkerInMessage::request(id, method, params)).await? {
            WorkerOutMessage::Response { reply, .. } => {
                reply.into_result().map_err(|e| self.inner.worker_error(e))
            }
            other => Err(ProtocolError::Unexpected(format!("{other:?}")).into()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.inner.events.subscribe()
    }

    /// Installs the handlers answering this sandbox's host API calls, limited
    /// to `capabilities`. Replaces any earlier installation.
    pub fn install_handlers(&self, handlers: Arc<PluginApiHandlers>, capabilities: BTreeSet<Capability>) {
        *self.inner.handlers.write().unwrap_or_else(|e| e.into_inner()) = Some(handlers);
        *self.inner.installed.write().unwrap_or_else(|e| e.into_inner()) = capabilities;
    }

    pub fn installed_capabilities(&self) -> BTreeSet<Capability> {
        self.inner.installed.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Why the worker died, if it crashed.
    pub fn crash_reason(&self) -> Option<String> {
        self.inner.crash_reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Shuts the worker down and rejects every outstanding request.
    /// Calling it again does nothing.
    ///
    /// A worker stuck inside a handler cannot be interrupted; its thread is
    /// left to finish on its own and its output is ignored.
    pub fn terminate(&self) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.post_unchecked(&WorkerInMessage::Shutdown);
        self.inner.outbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(reader) = self.inner.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reader.abort();
        }
        let rejected = self.inner.drain_pending(|| {
            PluginHostError::SandboxTerminated(self.inner.plugin_id.to_string())
        });
        let _ = self.inner.events.send(SandboxEvent::Terminated);
        info!(plugin_id = %self.inner.plugin_id, rejected, "sandbox terminated");
    }
}

impl Inner {
    fn ensure_running(&self) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            Err(self.gone_error())
        } else {
            Ok(())
        }
    }

    fn gone_error(&self) -> PluginHostError {
        match self.crash_reason.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            Some(message) => PluginHostError::SandboxCrashed {
                plugin_id: self.plugin_id.to_string(),
                message,
            },
            None => PluginHostError::SandboxTerminated(self.plugin_id.to_string()),
        }
    }

    fn post(&self, message: &WorkerInMessage) -> Result<()> {
        self.ensure_running()?;
        self.post_unchecked(message)
    }

    fn post_unchecked(&self, message: &WorkerInMessage) -> Result<()> {
        let raw = encode(message)?;
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(tx) if tx.send(raw).is_ok() => Ok(()),
            _ => Err(self.gone_error()),
        }
    }

    fn take_pending(&self, id: CorrelationId) -> Option<PendingReply> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id)
    }

    fn drain_pending(&self, error: impl Fn() -> PluginHostError) -> usize {
        let drained: Vec<PendingReply> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.tx.send(Err(error()));
        }
        count
    }

    fn retire(&self, id: CorrelationId, seq: u64) {
        let mut retired = self.retired.lock().unwrap_or_else(|e| e.into_inner());
        retired.insert(seq, id);
        while retired.len() > RETIRED_LIMIT {
            retired.pop_first();
        }
    }

    /// The worker answers in post order, so once the reply to `seq` is in,
    /// nothing posted before it can still reply.
    fn forget_retired_before(&self, seq: u64) {
        let mut retired = self.retired.lock().unwrap_or_else(|e| e.into_inner());
        *retired = retired.split_off(&seq);
    }

    fn worker_error(&self, error: WorkerError) -> PluginHostError {
        match error.tag {
            ErrorTag::PermissionDenied => PluginHostError::PermissionDenied {
                plugin_id: self.plugin_id.to_string(),
                capability: error.message,
            },
            ErrorTag::HandlerUnavailable => PluginHostError::HandlerUnavailable(error.message),
            _ => PluginHostError::Worker {
                plugin_id: self.plugin_id.to_string(),
                error,
            },
        }
    }

    fn route(self: &Arc<Self>, message: WorkerOutMessage) {
        match message {
            WorkerOutMessage::Response { id, .. } => match self.take_pending(id) {
                Some(pending) => {
                    self.forget_retired_before(pending.seq);
                    let _ = pending.tx.send(Ok(message));
                }
                None => {
                    let was_retired = {
                        let mut retired = self.retired.lock().unwrap_or_else(|e| e.into_inner());
                        let before = retired.len();
                        retired.retain(|_, r| *r != id);
                        retired.len() < before
                    };
                    if was_retired {
                        debug!(plugin_id = %self.plugin_id, id, "discarding late reply");
                    } else {
                        warn!(plugin_id = %self.plugin_id, id, "reply for unknown correlation id");
                    }
                }
            },
            WorkerOutMessage::ApiCall { call_id, request } => {
                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.answer_api_call(call_id, request).await });
            }
            WorkerOutMessage::Event { name, payload } => {
                trace!(plugin_id = %self.plugin_id, event = %name, "sandbox event");
                let _ = self.events.send(SandboxEvent::Emitted { name, payload });
            }
            WorkerOutMessage::Log { level, message } => self.forward_log(level, &message),
            WorkerOutMessage::Ready => self.resolve_ready(Ok(())),
            WorkerOutMessage::InitFailed { error } => {
                self.resolve_ready(Err(PluginHostError::SandboxInit {
                    plugin_id: self.plugin_id.to_string(),
                    message: error.to_string(),
                }));
            }
        }
    }

    fn resolve_ready(&self, result: Result<()>) {
        match self.ready.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => warn!(plugin_id = %self.plugin_id, "unexpected init message after start"),
        }
    }

    async fn answer_api_call(&self, call_id: u64, request: ApiRequest) {
        let api = request.name();
        let result = match self.authorize(Capability::for_api(&request)) {
            Ok(handlers) => {
                let caller = ApiCaller {
                    plugin_id: self.plugin_id.clone(),
                    tier: self.tier,
                };
                match tokio::time::timeout(self.api_timeout, handlers.dispatch(&caller, request)).await {
                    Ok(result) => result,
                    Err(_) => Err(WorkerError::new(
                        ErrorTag::Unavailable,
                        format!("'{api}' timed out"),
                    )),
                }
            }
            Err(e) => Err(e),
        };
        debug!(plugin_id = %self.plugin_id, call_id, api, ok = result.is_ok(), "host api call");
        let reply = WorkerInMessage::ApiResponse {
            call_id,
            reply: Reply::from(result),
        };
        if self.post(&reply).is_err() {
            debug!(plugin_id = %self.plugin_id, call_id, "sandbox gone before api reply");
        }
    }

    /// Gate for one host API call: the capability must be installed for this
    /// sandbox and still granted right now.
    fn authorize(&self, capability: Capability) -> std::result::Result<Arc<PluginApiHandlers>, WorkerError> {
        let installed = self
            .installed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&capability);
        let granted = installed
            && self
                .permissions
                .check_plugin_capability(&self.plugin_id, capability)
                .is_granted();
        if !granted {
            warn!(plugin_id = %self.plugin_id, capability = %capability, "host api call denied");
            return Err(WorkerError::new(ErrorTag::PermissionDenied, capability.id()));
        }
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                WorkerError::new(
                    ErrorTag::HandlerUnavailable,
                    format!("no handlers installed for '{capability}'"),
                )
            })
    }

    fn forward_log(&self, level: LogLevel, message: &str) {
        let plugin_id = &self.plugin_id;
        match level {
            LogLevel::Trace => trace!(plugin_id = %plugin_id, "{message}"),
            LogLevel::Debug => debug!(plugin_id = %plugin_id, "{message}"),
            LogLevel::Info => info!(plugin_id = %plugin_id, "{message}"),
            LogLevel::Warn => warn!(plugin_id = %plugin_id, "{message}"),
            LogLevel::Error => error!(plugin_id = %plugin_id, "{message}"),
        }
    }

    fn on_worker_exit(&self, exit: ThreadExit) {
        let reason = match exit {
            // Already reported through `InitFailed`.
            Ok(WorkerExit::InitFailed(_)) => return,
            Ok(WorkerExit::Shutdown) => "worker shut down unprompted".to_string(),
            Ok(WorkerExit::Disconnected) => "worker disconnected".to_string(),
            Err(panic) => format!("worker panicked: {panic}"),
        };

        if self.ready.lock().unwrap_or_else(|e| e.into_inner()).is_some() {
            self.resolve_ready(Err(PluginHostError::SandboxInit {
                plugin_id: self.plugin_id.to_string(),
                message: reason,
            }));
            return;
        }
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        error!(plugin_id = %self.plugin_id, reason = %reason, "sandbox crashed");
        *self.crash_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.clone());
        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        let plugin_id = self.plugin_id.to_string();
        self.drain_pending(|| PluginHostError::SandboxCrashed {
            plugin_id: plugin_id.clone(),
            message: reason.clone(),
        });
        let _ = self.events.send(SandboxEvent::Crashed { reason });
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    mut inbound: UnboundedReceiver<String>,
    exit: oneshot::Receiver<ThreadExit>,
) {
    while let Some(raw) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match decode::<WorkerOutMessage>(&raw) {
            Ok(message) => inner.route(message),
            Err(e) => warn!(plugin_id = %inner.plugin_id, error = %e, "malformed worker message"),
        }
    }

    // The worker's sender is gone, so its thread has returned or unwound.
    let exit = exit
        .await
        .unwrap_or_else(|_| Err("worker thread vanished".to_string()));
    if let Some(inner) = inner.upgrade() {
        inner.on_worker_exit(exit);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::AutoApprove;
    use crate::policy::PolicyEngine;
    use futures::future::join_all;
    use holofoil_plugin_sdk::WorkerContext;
    use serde_json::json;

    struct Echo;

    impl PluginWorker for Echo {
        fn handle(&mut self, method: &str, params: Value, _ctx: &mut WorkerContext) -> std::result::Result<Value, WorkerError> {
            match method {
                "echo" => Ok(params),
                "sleep" => {
                    std::thread::sleep(Duration::from_millis(params["ms"].as_u64().unwrap_or(0)));
                    Ok(params)
                }
                "panic" => panic!("boom"),
                other => Err(WorkerError::unknown_method(other)),
            }
        }
    }

    fn permissions() -> Arc<PermissionManager> {
        Arc::new(PermissionManager::new(
            Arc::new(PolicyEngine::unrestricted()),
            Arc::new(AutoApprove),
        ))
    }

    fn options() -> SandboxOptions {
        SandboxOptions::new(PluginId::parse("community.echo").unwrap(), TrustTier::Community)
    }

    #[tokio::test]
    async fn request_round_trip() {
        let sandbox = create_worker_sandbox(options(), Box::new(Echo), permissions()).await.unwrap();
        assert_eq!(sandbox.request("echo", json!({"a": 1})).await.unwrap(), json!({"a": 1}));
        let err = sandbox.request("missing", Value::Null).await.unwrap_err();
        assert!(matches!(err, PluginHostError::Worker { .. }));
        sandbox.terminate();
    }

    #[tokio::test]
    async fn non_requests_are_rejected_by_send() {
        let sandbox = create_worker_sandbox(options(), Box::new(Echo), permissions()).await.unwrap();
        let err = sandbox.send(WorkerInMessage::Shutdown).await.unwrap_err();
        assert!(matches!(err, PluginHostError::Protocol(_)));
        sandbox.terminate();
    }

    #[tokio::test]
    async fn panic_is_reported_as_crash() {
        let sandbox = create_worker_sandbox(options(), Box::new(Echo), permissions()).await.unwrap();
        let mut events = sandbox.subscribe();
        let err = sandbox.request("panic", Value::Null).await.unwrap_err();
        assert!(matches!(err, PluginHostError::SandboxCrashed { .. }), "{err:?}");
        assert!(matches!(events.recv().await.unwrap(), SandboxEvent::Crashed { .. }));
        assert!(sandbox.is_terminated());
        assert!(sandbox.crash_reason().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn retired_ids_are_bounded_and_drain_once_the_worker_catches_up() {
        let mut opts = options();
        opts.rpc_timeout = Duration::from_millis(20);
        let sandbox = create_worker_sandbox(opts, Box::new(Echo), permissions()).await.unwrap();

        let stuck = sandbox.request("sleep", json!({ "ms": 300 }));
        let queued = join_all((0..RETIRED_LIMIT + 10).map(|_| sandbox.request("echo", Value::Null)));
        let (stuck, queued) = tokio::join!(stuck, queued);
        assert!(matches!(stuck, Err(PluginHostError::SandboxTimeout { .. })));
        assert!(queued.iter().all(|r| matches!(r, Err(PluginHostError::SandboxTimeout { .. }))));
        assert_eq!(sandbox.inner.retired.lock().unwrap().len(), RETIRED_LIMIT);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(sandbox.inner.retired.lock().unwrap().is_empty());
        assert_eq!(sandbox.request("echo", json!("alive")).await.unwrap(), json!("alive"));
        sandbox.terminate();
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
