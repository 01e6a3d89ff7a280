//! Options shared by every pipeline built over a backend connection.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of frames fetched when the debuggee pauses
pub const DEFAULT_STACK_TRACE_LIMIT: u32 = 50;

/// Bridge options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeOptions {
    /// Frames requested per backtrace
    pub stack_trace_limit: u32,
    /// Persist live edits back to the script's file on disk
    pub save_live_edit: bool,
    /// Resume the debuggee once the pipeline is ready
    pub resume_on_attach: bool,
    /// Grace period for the polite disconnect on close, in milliseconds
    pub close_grace_ms: u64,
    /// Opaque helper modules installed into the debuggee
    pub injections: InjectionPaths,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        BridgeOptions {
            stack_trace_limit: DEFAULT_STACK_TRACE_LIMIT,
            save_live_edit: false,
            resume_on_attach: false,
            close_grace_ms: 500,
            injections: InjectionPaths::default(),
        }
    }
}

impl BridgeOptions {
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Module paths handed to the injector, one per agent that needs native-level help
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionPaths {
    pub debugger: Option<String>,
    pub runtime: Option<String>,
    pub console: Option<String>,
}

impl InjectionPaths {
    pub fn any(&self) -> bool {
        self.debugger.is_some() || self.runtime.is_some() || self.console.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = BridgeOptions::default();
        assert_eq!(options.stack_trace_limit, 50);
        assert!(!options.save_live_edit);
        assert_eq!(options.close_grace(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let options: BridgeOptions =
            serde_json::from_str(r#"{"save_live_edit": true}"#).unwrap();
        assert!(options.save_live_edit);
        assert_eq!(options.stack_trace_limit, DEFAULT_STACK_TRACE_LIMIT);
        assert!(options.injections.debugger.is_none());
    }
}
