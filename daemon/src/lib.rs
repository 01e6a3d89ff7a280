/// Inspector bridge daemon: websocket server fronting legacy debuggees
/// Each client session is bound to a shared pipeline for its debuggee
pub mod config;
pub mod errors;
pub mod registry;
pub mod server;
pub mod session;

// Re-export commonly used types
pub use config::{DaemonConfig, DebuggeeConfig, LoggingConfig, ServerConfig};
pub use errors::{DaemonError, DaemonResult};
pub use registry::{BackendConnector, SessionRegistry, TcpConnector};
pub use server::{debuggee_from_query, BridgeServer};
pub use session::{DomainGate, FrontendSession, OutboundFrame, SessionEnd};

/// Daemon version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
