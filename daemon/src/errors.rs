/// Error types for the bridge daemon

use inspector_bridge_core::BridgeError;
use thiserror::Error;

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Daemon error types
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Server error
    #[error("Server error: {0}")]
    ServerError(String),

    /// Websocket handshake or transport failure
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Failure inside the bridge core
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for DaemonError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        DaemonError::WebSocketError(e.to_string())
    }
}
