use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Correlation token for a request, unique per client connection
pub type RequestId = u64;

/// Method name of the cancellation notification sent by clients
///
/// Params are `{"id": <request id>}`. The server never answers this method.
pub const CANCEL_METHOD: &str = "$/cancel";

/// Method name that lists the tools registered in the dispatcher
pub const LIST_TOOLS_METHOD: &str = "$/listTools";

/// A request sent from a client to the bridge server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Deadline for this request in milliseconds, the tool's default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Request {
    /// Creates a new request
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            timeout_ms: None,
        }
    }

    /// Sets the deadline of the request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    /// Gets the requested deadline, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Creates a cancellation notification for a previously sent request
    pub fn cancel(id: RequestId, target: RequestId) -> Self {
        Self::new(id, CANCEL_METHOD, serde_json::json!({ "id": target }))
    }

    /// Whether this request is a cancellation notification
    pub fn is_cancel(&self) -> bool {
        self.method == CANCEL_METHOD
    }

    /// Extracts the target id of a cancellation notification
    pub fn cancel_target(&self) -> Option<RequestId> {
        if !self.is_cancel() {
            return None;
        }
        self.params.get("id").and_then(Value::as_u64)
    }
}

/// A response to exactly one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Either the result of a request or a structured error, never both
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(ErrorBody),
}

impl Response {
    /// Creates a successful response
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result),
        }
    }

    /// Creates an error response
    pub fn error(id: RequestId, error: ErrorBody) -> Self {
        Self {
            id,
            outcome: Outcome::Error(error),
        }
    }

    /// Whether the response carries an error
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    /// Converts the response into the caller-facing result
    pub fn into_result(self) -> Result<Value, ErrorBody> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(error) => Err(error),
        }
    }
}

/// Kinds of errors that can be reported for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed frame on the wire, fatal to the connection
    FramingError,
    /// The connection dropped before a response arrived
    ConnectionLost,
    /// The request deadline elapsed
    Timeout,
    /// No tool is registered under the requested method name
    UnknownTool,
    /// The tool rejected its parameters
    InvalidParams,
    /// The tool failed internally
    ToolFailed,
    /// No reachable Unity instance was found
    DiscoveryError,
    /// The caller cancelled the request
    Cancelled,
}

impl ErrorKind {
    /// Convert to the string representation used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::FramingError => "FramingError",
            ErrorKind::ConnectionLost => "ConnectionLost",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::UnknownTool => "UnknownTool",
            ErrorKind::InvalidParams => "InvalidParams",
            ErrorKind::ToolFailed => "ToolFailed",
            ErrorKind::DiscoveryError => "DiscoveryError",
            ErrorKind::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error carried in a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ErrorBody {
    /// Creates an error without additional data
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: Value::Null,
        }
    }

    /// Attaches additional data to the error
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Errors that can occur in the bridge transport
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Framing error: {0}")]
    FramingError(String),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Discovery error: {0}")]
    DiscoveryError(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Failed to bind port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("Lock marker error: {0}")]
    LockError(#[from] crate::lock_coordinator::LockError),
    #[error("Project error: {0}")]
    ProjectError(#[from] crate::unity_project_manager::UnityProjectError),
    #[error("Bridge has been shut down")]
    Shutdown,
}

impl BridgeError {
    /// Maps a transport failure to the error kind reported to callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::FramingError(_) => ErrorKind::FramingError,
            BridgeError::Timeout(_) => ErrorKind::Timeout,
            BridgeError::DiscoveryError(_) | BridgeError::ProjectError(_) => {
                ErrorKind::DiscoveryError
            }
            BridgeError::JsonError(_) => ErrorKind::InvalidParams,
            _ => ErrorKind::ConnectionLost,
        }
    }
}

impl From<BridgeError> for ErrorBody {
    fn from(error: BridgeError) -> Self {
        ErrorBody::new(error.kind(), error.to_string())
    }
}
