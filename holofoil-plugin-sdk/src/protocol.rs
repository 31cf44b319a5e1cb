//! Sandbox wire protocol.
//!
//! Every message crossing the sandbox boundary is a JSON string holding one
//! of the enums below. Host-to-worker requests carry a [`CorrelationId`];
//! the matching [`WorkerOutMessage::Response`] echoes it. Worker-to-host API
//! calls carry their own `call_id`, answered by
//! [`WorkerInMessage::ApiResponse`].

use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Per-sandbox integer tagging a request and its reply.
pub type CorrelationId = u64;

// ---- Host → worker ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerInMessage {
    /// First message on every channel. The worker answers `ready` or `init_failed`.
    Init {
        plugin_id: String,
        /// Capability ids granted at sandbox start.
        capabilities: Vec<String>,
        #[serde(default)]
        config: Value,
    },
    /// Invoke a plugin method.
    Request {
        id: CorrelationId,
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Reply to a worker's [`WorkerOutMessage::ApiCall`].
    ApiResponse { call_id: u64, reply: Reply },
    Shutdown,
}

impl WorkerInMessage {
    pub fn request(id: CorrelationId, method: impl Into<String>, params: Value) -> Self {
        Self::Request {
            id,
            method: method.into(),
            params,
        }
    }
}

// ---- Worker → host ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerOutMessage {
    Ready,
    InitFailed { error: WorkerError },
    Response { id: CorrelationId, reply: Reply },
    ApiCall { call_id: u64, request: ApiRequest },
    /// Fire-and-forget notification to host subscribers.
    Event { name: String, #[serde(default)] payload: Value },
    Log { level: LogLevel, message: String },
}

impl WorkerOutMessage {
    /// Correlation id of a response, if this is one.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::Response { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Either a result value or a tagged error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(Value),
    Err(WorkerError),
}

impl Reply {
    pub fn into_result(self) -> Result<Value, WorkerError> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Err(e) => Err(e),
        }
    }
}

impl From<Result<Value, WorkerError>> for Reply {
    fn from(result: Result<Value, WorkerError>) -> Self {
        match result {
            Ok(v) => Self::Ok(v),
            Err(e) => Self::Err(e),
        }
    }
}

// ---- Errors ----

/// Error kinds understood on both sides of the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorTag {
    UnknownMethod,
    InvalidParams,
    PermissionDenied,
    HandlerUnavailable,
    Unavailable,
    Internal,
}

impl ErrorTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownMethod => "unknown-method",
            Self::InvalidParams => "invalid-params",
            Self::PermissionDenied => "permission-denied",
            Self::HandlerUnavailable => "handler-unavailable",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerError {
    pub tag: ErrorTag,
    pub message: String,
}

impl WorkerError {
    pub fn new(tag: ErrorTag, message: impl Into<String>) -> Self {
        Self {
            tag,
            message: message.into(),
        }
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(ErrorTag::UnknownMethod, format!("no method '{method}'"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorTag::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorTag::Internal, message)
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tag.as_str(), self.message)
    }
}

impl std::error::Error for WorkerError {}

// ---- Host API ----

/// A host API call made by a worker. Each variant is gated on exactly one
/// capability by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "api", content = "args")]
pub enum ApiRequest {
    #[serde(rename = "storage.get")]
    StorageGet { key: String },
    #[serde(rename = "storage.set")]
    StorageSet { key: String, value: Value },
    #[serde(rename = "storage.remove")]
    StorageRemove { key: String },
    #[serde(rename = "notify")]
    Notify {
        title: String,
        #[serde(default)]
        body: String,
        #[serde(default)]
        level: NotificationLevel,
    },
    #[serde(rename = "settings.get")]
    SettingsGet { key: String },
    #[serde(rename = "settings.set")]
    SettingsSet { key: String, value: Value },
    #[serde(rename = "modal")]
    Modal {
        title: String,
        #[serde(default)]
        body: String,
        #[serde(default)]
        buttons: Vec<String>,
    },
    #[serde(rename = "collection.list")]
    CollectionList {
        #[serde(default)]
        offset: usize,
        #[serde(default)]
        limit: Option<usize>,
    },
    #[serde(rename = "collection.get")]
    CollectionGet { card_id: String },
    #[serde(rename = "collection.tag")]
    CollectionTag { card_id: String, tag: String },
    #[serde(rename = "http.get")]
    HttpGet { url: String },
}

impl ApiRequest {
    /// Wire name of the API.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StorageGet { .. } => "storage.get",
            Self::StorageSet { .. } => "storage.set",
            Self::StorageRemove { .. } => "storage.remove",
            Self::Notify { .. } => "notify",
            Self::SettingsGet { .. } => "settings.get",
            Self::SettingsSet { .. } => "settings.set",
            Self::Modal { .. } => "modal",
            Self::CollectionList { .. } => "collection.list",
            Self::CollectionGet { .. } => "collection.get",
            Self::CollectionTag { .. } => "collection.tag",
            Self::HttpGet { .. } => "http.get",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A card as exposed to plugins. Always a copy of the live collection entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub set: String,
    #[serde(default)]
    pub rarity: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

// ---- Codec ----

pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let msg = WorkerInMessage::request(7, "render", json!({"card": "c1"}));
        let value: Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "request", "id": 7, "method": "render", "params": {"card": "c1"}})
        );
    }

    #[test]
    fn api_call_names_the_api() {
        let msg = WorkerOutMessage::ApiCall {
            call_id: 1,
            request: ApiRequest::HttpGet {
                url: "https://example.test".into(),
            },
        };
        let value: Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(value["request"]["api"], "http.get");
        assert_eq!(value["request"]["args"]["url"], "https://example.test");
    }

    #[test]
    fn error_reply_carries_tag() {
        let reply = Reply::Err(WorkerError::unknown_method("explode"));
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["err"]["tag"], "unknown-method");
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        assert!(decode::<WorkerOutMessage>("{\"type\":\"nope\"}").is_err());
        assert!(decode::<WorkerOutMessage>("not json").is_err());
    }
}
