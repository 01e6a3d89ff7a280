// Inspector Bridge: modern debugging protocol over a legacy debug port
// Core library providing the backend connection, extension pipeline and agents

pub mod agents;
pub mod backend;
pub mod config;
pub mod errors;
pub mod modern;
pub mod pipeline;
pub mod scripts;
pub mod transaction;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export commonly used types
pub use errors::{BridgeError, BridgeResult};

pub use config::{BridgeOptions, InjectionPaths, DEFAULT_STACK_TRACE_LIMIT};

pub use backend::{
    BackendConnection, BackendNotice, ConnectionState, DebuggeeAddress, LegacyCodec,
    LegacyEvent, LegacyFrame, LegacyMessage, LegacyRequest, LegacyResponse, Requester,
    DEFAULT_DEBUG_PORT,
};

pub use modern::{ClientCommand, ClientEvent, Domain, ModernCodec, ServerMessage};

pub use pipeline::{
    Capability, HandlerChain, Next, Pipeline, PipelineHandle, Plugin, PluginContext,
    SessionNotice,
};

pub use scripts::{Registration, Script, ScriptRegistry};

pub use transaction::{TransactionCoordinator, TransactionRequester, TRANSACTION_COMMAND};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
