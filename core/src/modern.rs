//! Modern domain/method protocol spoken to UI clients.
//!
//! One JSON value per transport message, so there is no framing; a bad
//! message fails on its own and never poisons the connection.

use crate::errors::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Inbound `{id, method, params}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientCommand {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl ClientCommand {
    pub fn domain(&self) -> Domain {
        Domain::of(&self.method)
    }

    /// `Some(domain)` for `Domain.enable`
    pub fn enabled_domain(&self) -> Option<Domain> {
        match self.method.split_once('.') {
            Some((domain, "enable")) => Some(Domain::from(domain)),
            _ => None,
        }
    }
}

/// Outbound `{method, params}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEvent {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl ClientEvent {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        ClientEvent {
            method: method.into(),
            params,
        }
    }

    pub fn domain(&self) -> Domain {
        Domain::of(&self.method)
    }
}

/// Any message sent to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Result { id: u64, result: Value },
    Error { id: u64, error: Value },
    Event(ClientEvent),
}

impl ServerMessage {
    /// Reply for a handler result; void results become `{}`.
    pub fn reply(id: u64, result: BridgeResult<Value>) -> Self {
        match result {
            Ok(Value::Null) => ServerMessage::Result { id, result: json!({}) },
            Ok(result) => ServerMessage::Result { id, result },
            Err(e) => ServerMessage::Error {
                id,
                error: e.to_client_error(),
            },
        }
    }
}

/// Modern protocol domains the bridge knows by name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Domain {
    Console,
    Css,
    Database,
    Debugger,
    Dom,
    DomStorage,
    Emulation,
    HeapProfiler,
    IndexedDb,
    Inspector,
    Network,
    Page,
    Profiler,
    Runtime,
    Timeline,
    Worker,
    Other(String),
}

impl Domain {
    /// Domain of a `Domain.method` name
    pub fn of(method: &str) -> Self {
        let name = method.split_once('.').map_or(method, |(domain, _)| domain);
        Domain::from(name)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Domain::Console => "Console",
            Domain::Css => "CSS",
            Domain::Database => "Database",
            Domain::Debugger => "Debugger",
            Domain::Dom => "DOM",
            Domain::DomStorage => "DOMStorage",
            Domain::Emulation => "Emulation",
            Domain::HeapProfiler => "HeapProfiler",
            Domain::IndexedDb => "IndexedDB",
            Domain::Inspector => "Inspector",
            Domain::Network => "Network",
            Domain::Page => "Page",
            Domain::Profiler => "Profiler",
            Domain::Runtime => "Runtime",
            Domain::Timeline => "Timeline",
            Domain::Worker => "Worker",
            Domain::Other(name) => name,
        }
    }
}

impl From<&str> for Domain {
    fn from(name: &str) -> Self {
        match name {
            "Console" => Domain::Console,
            "CSS" => Domain::Css,
            "Database" => Domain::Database,
            "Debugger" => Domain::Debugger,
            "DOM" => Domain::Dom,
            "DOMStorage" => Domain::DomStorage,
            "Emulation" => Domain::Emulation,
            "HeapProfiler" => Domain::HeapProfiler,
            "IndexedDB" => Domain::IndexedDb,
            "Inspector" => Domain::Inspector,
            "Network" => Domain::Network,
            "Page" => Domain::Page,
            "Profiler" => Domain::Profiler,
            "Runtime" => Domain::Runtime,
            "Timeline" => Domain::Timeline,
            "Worker" => Domain::Worker,
            other => Domain::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-message codec for the modern protocol
pub struct ModernCodec;

impl ModernCodec {
    pub fn decode(text: &str) -> BridgeResult<ClientCommand> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| BridgeError::Protocol(format!("invalid JSON: {}", e)))?;
        serde_json::from_value(value)
            .map_err(|e| BridgeError::Protocol(format!("invalid command: {}", e)))
    }

    /// Best-effort `id` of a message that failed to decode
    pub fn recover_id(text: &str) -> Option<u64> {
        serde_json::from_str::<Value>(text)
            .ok()?
            .get("id")?
            .as_u64()
    }

    pub fn encode(message: &ServerMessage) -> BridgeResult<String> {
        Ok(serde_json::to_string(message)?)
    }
}
