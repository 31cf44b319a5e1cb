//! Guest side of a sandbox: the [`PluginWorker`] trait and its message loop.
//!
//! A worker runs on its own thread and only sees JSON strings. Calls into
//! the host go through [`WorkerContext::call_api`], which blocks the worker
//! until the host replies. Requests that arrive meanwhile are queued and
//! served afterwards.

use crate::error::ProtocolError;
use crate::protocol::{
    self, ApiRequest, ErrorTag, LogLevel, Reply, WorkerError, WorkerInMessage, WorkerOutMessage,
};
use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Plugin code living inside a sandbox.
pub trait PluginWorker: Send {
    /// Runs once before any request. An error aborts sandbox start.
    fn init(&mut self, _ctx: &mut WorkerContext) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Handles one host request.
    fn handle(
        &mut self,
        method: &str,
        params: Value,
        ctx: &mut WorkerContext,
    ) -> Result<Value, WorkerError>;

    fn shutdown(&mut self, _ctx: &mut WorkerContext) {}
}

/// Worker ends of the two sandbox channels.
pub struct WorkerChannel {
    pub inbound: UnboundedReceiver<String>,
    pub outbound: UnboundedSender<String>,
}

/// How the message loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Host asked for shutdown.
    Shutdown,
    /// Host dropped its sender.
    Disconnected,
    /// `init` failed or the first message was not `init`.
    InitFailed(String),
}

/// Handle passed to every worker callback.
pub struct WorkerContext {
    plugin_id: String,
    capabilities: Vec<String>,
    config: Value,
    inbound: UnboundedReceiver<String>,
    outbound: UnboundedSender<String>,
    queued: VecDeque<WorkerInMessage>,
    next_call_id: u64,
    shutting_down: bool,
}

impl WorkerContext {
    fn new(channel: WorkerChannel) -> Self {
        Self {
            plugin_id: String::new(),
            capabilities: Vec::new(),
            config: Value::Null,
            inbound: channel.inbound,
            outbound: channel.outbound,
            queued: VecDeque::new(),
            next_call_id: 1,
            shutting_down: false,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Configuration handed over at init.
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Whether a capability was granted when the sandbox started. The host
    /// re-checks on every call, so this is advisory.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Calls a host API and waits for its reply.
    pub fn call_api(&mut self, request: ApiRequest) -> Result<Value, WorkerError> {
        if self.shutting_down {
            return Err(WorkerError::new(ErrorTag::Unavailable, "sandbox is shutting down"));
        }
        let call_id = self.next_call_id;
        self.next_call_id += 1;
        self.send(&WorkerOutMessage::ApiCall { call_id, request })
            .map_err(|e| WorkerError::new(ErrorTag::Unavailable, e.to_string()))?;

        loop {
            let Some(raw) = self.inbound.blocking_recv() else {
                self.shutting_down = true;
                return Err(WorkerError::new(ErrorTag::Unavailable, "host disconnected"));
            };
            match protocol::decode::<WorkerInMessage>(&raw) {
                Ok(WorkerInMessage::ApiResponse { call_id: id, reply }) if id == call_id => {
                    return reply.into_result();
                }
                Ok(WorkerInMessage::ApiResponse { call_id: stale, .. }) => {
                    self.log(LogLevel::Debug, format!("discarding stale api reply {stale}"));
                }
                Ok(WorkerInMessage::Shutdown) => {
                    self.shutting_down = true;
                    self.queued.push_back(WorkerInMessage::Shutdown);
                    return Err(WorkerError::new(ErrorTag::Unavailable, "sandbox is shutting down"));
                }
                Ok(other) => self.queued.push_back(other),
                Err(e) => self.log(LogLevel::Warn, format!("malformed host message: {e}")),
            }
        }
    }

    /// Publishes an event to host subscribers.
    pub fn emit(&self, name: impl Into<String>, payload: Value) {
        let _ = self.send(&WorkerOutMessage::Event {
            name: name.into(),
            payload,
        });
    }

    /// Forwards a log line to the host's logger.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let _ = self.send(&WorkerOutMessage::Log {
            level,
            message: message.into(),
        });
    }

    fn send(&self, message: &WorkerOutMessage) -> Result<(), ProtocolError> {
        let raw = protocol::encode(message)?;
        self.outbound
            .send(raw)
            .map_err(|_| ProtocolError::Disconnected)
    }

    fn next_message(&mut self) -> Option<Result<WorkerInMessage, ProtocolError>> {
        if let Some(queued) = self.queued.pop_front() {
            return Some(Ok(queued));
        }
        let raw = self.inbound.blocking_recv()?;
        Some(protocol::decode(&raw))
    }
}

/// Runs a worker until the host shuts it down or disconnects.
///
/// Blocks the calling thread. Must not be called from inside an async
/// runtime.
pub fn run_worker(mut worker: Box<dyn PluginWorker>, channel: WorkerChannel) -> WorkerExit {
    let mut ctx = WorkerContext::new(channel);

    match ctx.next_message() {
        Some(Ok(WorkerInMessage::Init {
            plugin_id,
            capabilities,
            config,
        })) => {
            ctx.plugin_id = plugin_id;
            ctx.capabilities = capabilities;
            ctx.config = config;
        }
        None => return WorkerExit::Disconnected,
        Some(Ok(other)) => {
            let reason = format!("expected init, got {other:?}");
            let _ = ctx.send(&WorkerOutMessage::InitFailed {
                error: WorkerError::internal(reason.clone()),
            });
            return WorkerExit::InitFailed(reason);
        }
        Some(Err(e)) => {
            let reason = e.to_string();
            let _ = ctx.send(&WorkerOutMessage::InitFailed {
                error: WorkerError::internal(reason.clone()),
            });
            return WorkerExit::InitFailed(reason);
        }
    }

    if let Err(error) = worker.init(&mut ctx) {
        let reason = error.to_string();
        let _ = ctx.send(&WorkerOutMessage::InitFailed { error });
        return WorkerExit::InitFailed(reason);
    }
    if ctx.send(&WorkerOutMessage::Ready).is_err() {
        return WorkerExit::Disconnected;
    }

    loop {
        let Some(next) = ctx.next_message() else {
            return WorkerExit::Disconnected;
        };
        match next {
            Ok(WorkerInMessage::Request { id, method, params }) => {
                let reply: Reply = worker.handle(&method, params, &mut ctx).into();
                if ctx.send(&WorkerOutMessage::Response { id, reply }).is_err() {
                    return WorkerExit::Disconnected;
                }
            }
            Ok(WorkerInMessage::Shutdown) => {
                worker.shutdown(&mut ctx);
                return WorkerExit::Shutdown;
            }
            Ok(WorkerInMessage::ApiResponse { call_id, .. }) => {
                ctx.log(LogLevel::Debug, format!("discarding stale api reply {call_id}"));
            }
            Ok(WorkerInMessage::Init { .. }) => {
                ctx.log(LogLevel::Warn, "ignoring repeated init");
            }
            Err(e) => ctx.log(LogLevel::Warn, format!("malformed host message: {e}")),
        }
    }
}
