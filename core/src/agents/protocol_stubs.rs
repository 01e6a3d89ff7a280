//! Canned replies for methods the legacy protocol has no counterpart for.

use crate::errors::BridgeResult;
use crate::pipeline::{Capability, Plugin, PluginContext};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

const FALSE_BY_DOMAIN: &[(&str, &[&str])] = &[
    ("Console", &["enable", "setMonitoringXHREnabled", "setTracingBasedTimeline"]),
    ("CSS", &["disable", "enable"]),
    (
        "Debugger",
        &[
            "disable",
            "setAsyncCallStackDepth",
            "setOverlayMessage",
            "skipStackFrames",
            "compileScript",
            "canSetScriptSource",
        ],
    ),
    ("DOM", &["disable", "enable", "hideHighlight", "getDocument"]),
    (
        "DOMDebugger",
        &[
            "removeInstrumentationBreakpoint",
            "removeXHRBreakpoint",
            "setInstrumentationBreakpoint",
            "setXHRBreakpoint",
        ],
    ),
    ("HeapProfiler", &["addInspectedHeapObject", "enable"]),
    ("Network", &["enable", "setCacheDisabled", "canEmulateNetworkConditions"]),
    (
        "Page",
        &[
            "addToEvaluateOnLoad",
            "clearDeviceOrientationOverride",
            "clearGeolocationOverride",
            "canScreencast",
            "enable",
            "reload",
            "removeScriptToEvaluateOnLoad",
            "setContinuousPaintingEnabled",
            "setDeviceMetricsOverride",
            "setDeviceOrientationOverride",
            "setEmulatedMedia",
            "setForceCompositingMode",
            "setGeolocationOverride",
            "setOverlayMessage",
            "setScriptExecutionDisabled",
            "setShowDebugBorders",
            "setShowFPSCounter",
            "setShowPaintRects",
            "setShowScrollBottleneckRects",
            "setShowViewportSizeOnResize",
            "setTouchEmulationEnabled",
        ],
    ),
    ("Profiler", &["enable", "setSamplingInterval"]),
    ("Worker", &["enable", "canInspectWorkers", "setAutoconnectToWorkers"]),
    ("IndexedDB", &["enable"]),
    ("Database", &["enable"]),
    ("DOMStorage", &["enable"]),
    ("Inspector", &["enable"]),
    ("Runtime", &["run"]),
    ("Emulation", &["canEmulate"]),
];

/// Every stubbed method with its reply
pub fn stub_table() -> Vec<(String, Value)> {
    let mut table: Vec<(String, Value)> = FALSE_BY_DOMAIN
        .iter()
        .flat_map(|(domain, methods)| {
            methods
                .iter()
                .map(move |method| (format!("{}.{}", domain, method), json!(false)))
        })
        .collect();

    table.extend([
        ("CSS.getSupportedCSSProperties".to_string(), json!({"cssProperties": []})),
        ("Network.setUserAgentOverride".to_string(), json!({})),
        ("Page.getScriptExecutionStatus".to_string(), json!("enabled")),
        ("IndexedDB.requestDatabaseNames".to_string(), json!({"databaseNames": []})),
    ]);
    table
}

pub struct ProtocolStubs;

#[async_trait]
impl Plugin for ProtocolStubs {
    fn name(&self) -> &str {
        super::PROTOCOL_STUBS
    }

    async fn init(&self, cx: PluginContext) -> BridgeResult<Capability> {
        for (method, reply) in stub_table() {
            cx.pipeline().register_command(&method, move |_params, _next| {
                let reply = reply.clone();
                async move { Ok(reply) }
            });
        }
        Ok(Arc::new(()))
    }
}
