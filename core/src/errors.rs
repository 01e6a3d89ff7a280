//! Error types for the bridge core

use serde_json::{json, Value};
use thiserror::Error;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge error types.
///
/// Errors are `Clone` because a single failure is often observed by many
/// awaiters at once: every dependent of a failed plugin, every request
/// pending on a torn-down connection.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// The backend connection is closed; pending and future requests fail with this
    #[error("Connection closed")]
    ConnectionClosed,

    /// Could not open the byte stream to the debuggee
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Malformed frame or message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Legacy response with `success=false`
    #[error("Command failed: {message}")]
    Command { message: String, body: Value },

    /// A command or event handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Plugin initializer failed; carries the failing plugin's identity
    #[error("Plugin {name} failed: {message}")]
    PluginFailed { name: String, message: String },

    /// Reentrant plugin dependency
    #[error("Plugin dependency cycle: {0}")]
    PluginCycle(String),

    #[error("Script not found: {0}")]
    ScriptNotFound(String),

    /// Live edit rejected before reaching the wire
    #[error("Live edit rejected: {0}")]
    LiveEdit(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl BridgeError {
    /// Build a command error from a failed legacy response
    pub fn command(message: Option<String>, body: Value) -> Self {
        let message = message
            .or_else(|| body.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "unknown backend error".to_string());
        BridgeError::Command { message, body }
    }

    /// Get the error code for this error
    pub fn code(&self) -> i64 {
        match self {
            BridgeError::ConnectionClosed => -32010,
            BridgeError::ConnectionFailed(_) => -32010,
            BridgeError::Protocol(_) => -32700,
            BridgeError::Command { .. } => -32000,
            BridgeError::Handler(_) => -32603,
            BridgeError::PluginNotFound(_) => -32601,
            BridgeError::PluginFailed { .. } => -32001,
            BridgeError::PluginCycle(_) => -32001,
            BridgeError::ScriptNotFound(_) => -32002,
            BridgeError::LiveEdit(_) => -32003,
            BridgeError::InvalidParams(_) => -32602,
            BridgeError::Serialization(_) => -32700,
            BridgeError::Io(_) => -32603,
        }
    }

    /// Convert to a modern-protocol error object
    pub fn to_client_error(&self) -> Value {
        match self {
            BridgeError::Command { message, body } if !body.is_null() => json!({
                "code": self.code(),
                "message": message,
                "data": body
            }),
            _ => json!({
                "code": self.code(),
                "message": self.to_string()
            }),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}
