//! Bridge-originated log lines shown in the client console.

use super::event;
use crate::errors::BridgeResult;
use crate::modern::ClientEvent;
use crate::pipeline::{Capability, PipelineHandle, Plugin, PluginContext};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Sent by the inspector helper module when the debuggee is about to exit
pub const PROCESS_EXIT: &str = "NodeInspector.processExit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Log,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Log => "log",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        })
    }
}

/// `Console.messageAdded` params for a bridge-originated message
pub fn console_message(level: LogLevel, text: &str) -> Value {
    json!({
        "message": {
            "source": "other",
            "level": level.to_string(),
            "text": text,
            "url": "",
            "line": 0,
            "column": 0,
            "repeatCount": 1,
            "timestamp": chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    })
}

pub struct Notifier {
    handle: PipelineHandle,
}

impl Notifier {
    pub fn new(handle: PipelineHandle) -> Self {
        Notifier { handle }
    }

    /// Emit through the event chain, so it reaches every session
    pub async fn log(&self, level: LogLevel, text: &str) -> BridgeResult<()> {
        self.handle
            .emit_event("Console.messageAdded", console_message(level, text))
            .await
    }

    async fn on_process_exit(self: Arc<Self>, _body: Value) -> BridgeResult<Option<ClientEvent>> {
        warn!("Debuggee reported process exit");
        self.log(LogLevel::Warning, "Debugger process exit").await?;
        Ok(None)
    }
}

pub struct NotifyAgent;

#[async_trait]
impl Plugin for NotifyAgent {
    fn name(&self) -> &str {
        super::NOTIFY
    }

    async fn init(&self, cx: PluginContext) -> BridgeResult<Capability> {
        let notifier = Arc::new(Notifier::new(cx.handle()));
        event(cx.pipeline(), PROCESS_EXIT, &notifier, Notifier::on_process_exit);
        Ok(notifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_message_shape() {
        let params = console_message(LogLevel::Warning, "step in to refresh the stack");
        assert_eq!(params["message"]["level"], "warning");
        assert_eq!(params["message"]["text"], "step in to refresh the stack");
        assert!(params["message"]["timestamp"].is_f64());
    }
}
