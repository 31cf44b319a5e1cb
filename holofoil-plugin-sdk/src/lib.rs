//! Guest SDK for building Holofoil plugins.
//!
//! Plugin authors implement [`PluginWorker`]; the host runs it on a
//! dedicated thread through [`run_worker`] and talks to it only through JSON
//! messages defined in [`protocol`].
//!
//! ```
//! use holofoil_plugin_sdk::prelude::*;
//! use serde_json::{json, Value};
//!
//! struct Greeter;
//!
//! impl PluginWorker for Greeter {
//!     fn handle(&mut self, method: &str, params: Value, ctx: &mut WorkerContext)
//!         -> Result<Value, WorkerError>
//!     {
//!         match method {
//!             "greet" => {
//!                 ctx.emit("greeted", params.clone());
//!                 Ok(json!({ "hello": params }))
//!             }
//!             other => Err(WorkerError::unknown_method(other)),
//!         }
//!     }
//! }
//! ```

pub mod error;
pub mod protocol;
pub mod worker;

pub use error::ProtocolError;
pub use protocol::{
    ApiRequest, CardSummary, CorrelationId, ErrorTag, LogLevel, NotificationLevel, Reply,
    WorkerError, WorkerInMessage, WorkerOutMessage,
};
pub use worker::{PluginWorker, WorkerChannel, WorkerContext, WorkerExit, run_worker};

pub mod prelude {
    pub use crate::protocol::{ApiRequest, CardSummary, ErrorTag, LogLevel, NotificationLevel, WorkerError};
    pub use crate::worker::{PluginWorker, WorkerContext};
}
