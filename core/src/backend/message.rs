//! Legacy debug protocol messages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A decoded legacy message body, tagged by its `type` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LegacyMessage {
    Request(LegacyRequest),
    Response(LegacyResponse),
    Event(LegacyEvent),
}

impl LegacyMessage {
    /// The `running` flag carried by the frame, if any
    pub fn running(&self) -> Option<bool> {
        match self {
            LegacyMessage::Request(_) => None,
            LegacyMessage::Response(r) => r.running,
            LegacyMessage::Event(e) => e.running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRequest {
    pub seq: u64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyResponse {
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub request_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<Vec<Value>>,
}

impl LegacyResponse {
    /// Successful response to `request`
    pub fn ok(request: &LegacyRequest, body: Value) -> Self {
        LegacyResponse {
            seq: 0,
            request_seq: request.seq,
            command: Some(request.command.clone()),
            success: true,
            body,
            running: None,
            message: None,
            refs: None,
        }
    }

    /// Failed response to `request`
    pub fn error(request: &LegacyRequest, message: impl Into<String>) -> Self {
        LegacyResponse {
            success: false,
            message: Some(message.into()),
            ..Self::ok(request, Value::Null)
        }
    }

    pub fn with_running(mut self, running: bool) -> Self {
        self.running = Some(running);
        self
    }

    /// Body with `refs` folded in as a map keyed by handle.
    pub fn into_body(self) -> Value {
        let mut body = self.body;
        let Some(refs) = self.refs else {
            return body;
        };

        let mut by_handle = Map::new();
        for r in refs {
            if let Some(handle) = r.get("handle") {
                let key = match handle {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                by_handle.insert(key, r);
            }
        }

        match &mut body {
            Value::Object(map) => {
                map.insert("refs".to_string(), Value::Object(by_handle));
            }
            Value::Null => {
                let mut map = Map::new();
                map.insert("refs".to_string(), Value::Object(by_handle));
                body = Value::Object(map);
            }
            _ => {}
        }
        body
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyEvent {
    #[serde(default)]
    pub seq: u64,
    pub event: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
}

impl LegacyEvent {
    pub fn new(event: impl Into<String>, body: Value) -> Self {
        LegacyEvent {
            seq: 0,
            event: event.into(),
            body,
            running: None,
        }
    }

    /// Events that imply the debuggee has suspended
    pub fn is_pause(&self) -> bool {
        self.event == "break" || self.event == "exception"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serializes_with_type_tag() {
        let msg = LegacyMessage::Request(LegacyRequest {
            seq: 3,
            command: "continue".to_string(),
            arguments: None,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "request", "seq": 3, "command": "continue"}));
    }

    #[test]
    fn test_response_refs_folded_into_body() {
        let raw = json!({
            "type": "response",
            "request_seq": 1,
            "success": true,
            "body": {"frames": []},
            "refs": [{"handle": 7, "type": "object"}],
            "running": false
        });
        let LegacyMessage::Response(response) = serde_json::from_value(raw).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(response.running, Some(false));
        let body = response.into_body();
        assert_eq!(body["refs"]["7"]["type"], "object");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let raw = json!({"type": "telemetry", "seq": 1});
        assert!(serde_json::from_value::<LegacyMessage>(raw).is_err());
    }

    #[test]
    fn test_pause_events() {
        assert!(LegacyEvent::new("break", Value::Null).is_pause());
        assert!(LegacyEvent::new("exception", Value::Null).is_pause());
        assert!(!LegacyEvent::new("afterCompile", Value::Null).is_pause());
    }
}
