//! Legacy debug protocol backend.
//!
//! This module provides the byte-stream side of the bridge:
//! - [`codec`]: `Content-Length` framing
//! - [`message`]: request/response/event bodies
//! - [`connection`]: request correlation and event demultiplexing

pub mod codec;
pub mod connection;
pub mod message;

pub use codec::{FrameHeaders, LegacyCodec, LegacyFrame};
pub use connection::{BackendConnection, BackendNotice, ConnectionState, DebuggeeAddress};
pub use message::{LegacyEvent, LegacyMessage, LegacyRequest, LegacyResponse};

use crate::errors::BridgeResult;
use async_trait::async_trait;
use serde_json::Value;

/// Default debug port of a debuggee
pub const DEFAULT_DEBUG_PORT: u16 = 5858;

/// Anything that can issue a legacy request and await its body.
///
/// Implemented by the raw connection, by the pipeline (which routes through
/// command chains and middleware), and by transaction-scoped requesters.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn request(&self, command: &str, args: Value) -> BridgeResult<Value>;
}
