//! Debugger domain: breakpoints, stepping, pauses and live edit.

use super::eval::{function_details, remote_object, thrown_object, Evaluator};
use super::injector::Injector;
use super::notify::{LogLevel, Notifier};
use super::{command, event, parse_params};
use crate::backend::Requester;
use crate::errors::{BridgeError, BridgeResult};
use crate::modern::ClientEvent;
use crate::pipeline::{Capability, PipelineHandle, Plugin, PluginContext};
use crate::scripts::{
    parse_script_id, url_to_path, ClientLocation, LegacyLocation, ScriptDescriptor,
    ScriptRegistry,
};
use crate::transaction::TransactionCoordinator;
use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

const STEP_IN_WARNING: &str =
    "The call stack changed in a way that needs a step in before it can be shown again";

/// Breakpoint-related state shared by the Debugger commands and the pause handler
#[derive(Debug, Clone, PartialEq)]
pub struct BreakpointStatus {
    pub active: bool,
    pub skip_all_pauses: bool,
    /// Transient breakpoint set by `Debugger.continueToLocation`
    pub continue_to: Option<u64>,
}

impl Default for BreakpointStatus {
    fn default() -> Self {
        BreakpointStatus {
            active: true,
            skip_all_pauses: false,
            continue_to: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PauseOnExceptionsParams {
    state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BreakpointByUrlParams {
    url: Option<String>,
    url_regex: Option<String>,
    line_number: u32,
    #[serde(default)]
    column_number: Option<u32>,
    #[serde(default)]
    condition: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BreakpointParams {
    location: ClientLocation,
    #[serde(default)]
    condition: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BreakpointIdParams {
    breakpoint_id: String,
}

#[derive(Debug, Deserialize)]
struct ActiveParams {
    active: bool,
}

#[derive(Debug, Deserialize)]
struct SkipParams {
    skipped: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptIdParams {
    script_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptSourceParams {
    script_id: String,
    script_source: String,
    #[serde(default)]
    preview: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateOnCallFrameParams {
    call_frame_id: String,
    expression: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionIdParams {
    function_id: String,
}

/// Legacy `setbreakpoint` response body
#[derive(Debug, Deserialize)]
struct BreakpointSet {
    breakpoint: u64,
    #[serde(default)]
    actual_locations: Vec<LegacyLocation>,
}

pub struct DebuggerState {
    handle: PipelineHandle,
    scripts: Arc<ScriptRegistry>,
    transactions: Arc<TransactionCoordinator>,
    notifier: Arc<Notifier>,
    evaluator: Arc<Evaluator>,
    status: Mutex<BreakpointStatus>,
    stack_trace_limit: u32,
    /// A helper module serves `Debugger.getBacktrace` inside the debuggee
    injected: bool,
}

impl DebuggerState {
    pub fn status(&self) -> BreakpointStatus {
        self.status.lock().clone()
    }

    /// Current call frames in client form
    pub async fn fetch_stack(&self, requester: &dyn Requester) -> BridgeResult<Value> {
        if self.injected {
            return requester
                .request(
                    "Debugger.getBacktrace",
                    json!({"stackTraceLimit": self.stack_trace_limit}),
                )
                .await;
        }

        let body = requester
            .request(
                "backtrace",
                json!({"fromFrame": 0, "toFrame": self.stack_trace_limit, "inlineRefs": true}),
            )
            .await?;
        let refs = body.get("refs").cloned().unwrap_or(Value::Null);
        let frames = body
            .get("frames")
            .and_then(Value::as_array)
            .map(|frames| frames.iter().map(|f| convert_frame(f, &refs)).collect())
            .unwrap_or_default();
        Ok(Value::Array(frames))
    }

    async fn enable(self: Arc<Self>, _params: Value) -> BridgeResult<Value> {
        self.scripts.reload(&self.handle).await?;
        for script in self.scripts.all() {
            self.handle
                .emit_event("Debugger.scriptParsed", script.parsed_params())
                .await?;
        }

        if !self.handle.running() {
            let call_frames = self.fetch_stack(&self.handle).await?;
            self.handle
                .emit_event(
                    "Debugger.paused",
                    json!({"callFrames": call_frames, "reason": "other", "hitBreakpoints": []}),
                )
                .await?;
        }
        Ok(Value::Null)
    }

    async fn resume(self: Arc<Self>, _params: Value) -> BridgeResult<Value> {
        self.handle.request("continue", json!({})).await?;
        self.handle.emit_event("Debugger.resumed", json!({})).await?;
        Ok(Value::Null)
    }

    async fn step(&self, action: &str) -> BridgeResult<Value> {
        self.handle
            .request("continue", json!({"stepaction": action, "stepcount": 1}))
            .await?;
        self.handle.emit_event("Debugger.resumed", json!({})).await?;
        Ok(Value::Null)
    }

    async fn step_over(self: Arc<Self>, _params: Value) -> BridgeResult<Value> {
        self.step("next").await
    }

    async fn step_into(self: Arc<Self>, _params: Value) -> BridgeResult<Value> {
        self.step("in").await
    }

    async fn step_out(self: Arc<Self>, _params: Value) -> BridgeResult<Value> {
        self.step("out").await
    }

    async fn pause(self: Arc<Self>, _params: Value) -> BridgeResult<Value> {
        self.handle.request("suspend", json!({})).await?;
        Ok(Value::Null)
    }

    async fn set_pause_on_exceptions(self: Arc<Self>, params: Value) -> BridgeResult<Value> {
        let params: PauseOnExceptionsParams = parse_params(params)?;
        let requests = ["all", "uncaught"].map(|kind| {
            self.handle.request(
                "setexceptionbreak",
                json!({"type": kind, "enabled": params.state == kind}),
            )
        });
        try_join_all(requests).await?;
        Ok(Value::Null)
    }

    async fn set_breakpoint_by_url(self: Arc<Self>, params: Value) -> BridgeResult<Value> {
        let params: BreakpointByUrlParams = parse_params(params)?;
        if params.url_regex.is_some() {
            return Err(BridgeError::InvalidParams(
                "breakpoints by url regex are not supported".to_string(),
            ));
        }
        let url = params
            .url
            .ok_or_else(|| BridgeError::InvalidParams("missing url".to_string()))?;

        let active = self.status.lock().active;
        let body = self
            .handle
            .request(
                "setbreakpoint",
                json!({
                    "type": "script",
                    "target": url_to_path(&url),
                    "line": params.line_number,
                    "column": params.column_number,
                    "condition": params.condition,
                    "enabled": active,
                }),
            )
            .await?;
        let set: BreakpointSet = serde_json::from_value(body)?;
        let locations: Vec<ClientLocation> =
            set.actual_locations.into_iter().map(Into::into).collect();

        Ok(json!({"breakpointId": set.breakpoint.to_string(), "locations": locations}))
    }

    async fn set_breakpoint(self: Arc<Self>, params: Value) -> BridgeResult<Value> {
        let params: BreakpointParams = parse_params(params)?;
        let target = parse_script_id(&params.location.script_id)?;

        let active = self.status.lock().active;
        let body = self
            .handle
            .request(
                "setbreakpoint",
                json!({
                    "type": "scriptId",
                    "target": target,
                    "line": params.location.line_number,
                    "column": params.location.column_number,
                    "condition": params.condition,
                    "enabled": active,
                }),
            )
            .await?;
        let set: BreakpointSet = serde_json::from_value(body)?;
        let actual = set
            .actual_locations
            .into_iter()
            .next()
            .map(ClientLocation::from)
            .unwrap_or(params.location);

        Ok(json!({"breakpointId": set.breakpoint.to_string(), "actualLocation": actual}))
    }

    async fn remove_breakpoint(self: Arc<Self>, params: Value) -> BridgeResult<Value> {
        let params: BreakpointIdParams = parse_params(params)?;
        let breakpoint = parse_breakpoint_id(&params.breakpoint_id)?;
        self.handle
            .request("clearbreakpoint", json!({"breakpoint": breakpoint}))
            .await?;
        Ok(Value::Null)
    }

    async fn continue_to_location(self: Arc<Self>, params: Value) -> BridgeResult<Value> {
        self.clear_continue_to().await?;

        let set = self.handle.request("Debugger.setBreakpoint", params).await?;
        let breakpoint = set
            .get("breakpointId")
            .and_then(Value::as_str)
            .map(parse_breakpoint_id)
            .transpose()?;
        self.status.lock().continue_to = breakpoint;

        self.handle.request("Debugger.resume", json!({})).await?;
        Ok(Value::Null)
    }

    async fn set_breakpoints_active(self: Arc<Self>, params: Value) -> BridgeResult<Value> {
        let params: ActiveParams = parse_params(params)?;
        self.status.lock().active = params.active;

        let listed = self.handle.request("listbreakpoints", json!({})).await?;
        let numbers: Vec<u64> = listed
            .get("breakpoints")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|bp| bp.get("number").and_then(Value::as_u64))
            .collect();

        let changes = numbers.into_iter().map(|number| {
            self.handle.request(
                "changebreakpoint",
                json!({"breakpoint": number, "enabled": params.active}),
            )
        });
        try_join_all(changes).await?;
        Ok(Value::Null)
    }

    async fn set_skip_all_pauses(self: Arc<Self>, params: Value) -> BridgeResult<Value> {
        let params: SkipParams = parse_params(params)?;
        self.status.lock().skip_all_pauses = params.skipped;
        Ok(Value::Null)
    }

    async fn get_script_source(self: Arc<Self>, params: Value) -> BridgeResult<Value> {
        let params: ScriptIdParams = parse_params(params)?;
        let id = parse_script_id(&params.script_id)?;
        let source = self.scripts.get_source(&self.handle, id).await?;
        Ok(json!({"scriptSource": source}))
    }

    async fn set_script_source(self: Arc<Self>, params: Value) -> BridgeResult<Value> {
        let params: ScriptSourceParams = parse_params(params)?;
        let id = parse_script_id(&params.script_id)?;

        let state = Arc::clone(&self);
        let (edit, call_frames) = self
            .transactions
            .transaction(|tx| async move {
                let edit = state
                    .scripts
                    .set_source(&tx, id, &params.script_source, params.preview)
                    .await?;
                let mut call_frames = None;
                if edit.stack_modified && !edit.stack_update_needs_step_in {
                    match state.fetch_stack(&tx).await {
                        Ok(frames) => call_frames = Some(frames),
                        Err(e) => debug!("Stack refetch after live edit failed: {}", e),
                    }
                }
                Ok((edit, call_frames))
            })
            .await?;

        if edit.stack_update_needs_step_in {
            self.notifier.log(LogLevel::Warning, STEP_IN_WARNING).await?;
        }

        let mut reply = json!({"stackChanged": edit.stack_modified});
        if let Some(frames) = call_frames {
            reply["callFrames"] = frames;
        }
        Ok(reply)
    }

    async fn can_set_script_source(self: Arc<Self>, _params: Value) -> BridgeResult<Value> {
        Ok(json!({"result": true}))
    }

    /// Evaluation failures are answered, not raised: the client shows them
    /// as a thrown value.
    async fn evaluate_on_call_frame(self: Arc<Self>, params: Value) -> BridgeResult<Value> {
        let params: EvaluateOnCallFrameParams = parse_params(params)?;
        let frame = params.call_frame_id.parse::<u32>().map_err(|_| {
            BridgeError::InvalidParams(format!("invalid call frame id: {}", params.call_frame_id))
        })?;

        match self.evaluator.evaluate_in_frame(frame, &params.expression).await {
            Ok(mirror) => Ok(json!({"result": remote_object(&mirror), "wasThrown": false})),
            Err(BridgeError::Command { message, .. }) => {
                Ok(json!({"result": thrown_object(&message), "wasThrown": true}))
            }
            Err(e) => Err(e),
        }
    }

    async fn get_function_details(self: Arc<Self>, params: Value) -> BridgeResult<Value> {
        let params: FunctionIdParams = parse_params(params)?;
        let handle = params.function_id.parse::<u64>().map_err(|_| {
            BridgeError::InvalidParams(format!("invalid function id: {}", params.function_id))
        })?;

        let body = self
            .handle
            .request("lookup", json!({"handles": [handle], "includeSource": false}))
            .await?;
        match body.get(handle.to_string()) {
            Some(mirror) => Ok(json!({"details": function_details(mirror)})),
            None => Err(BridgeError::Command {
                message: format!("no function with handle {}", handle),
                body,
            }),
        }
    }

    async fn clear_continue_to(&self) -> BridgeResult<()> {
        let previous = self.status.lock().continue_to.take();
        if let Some(breakpoint) = previous {
            self.handle
                .request("clearbreakpoint", json!({"breakpoint": breakpoint}))
                .await?;
        }
        Ok(())
    }

    /// `break` and `exception`
    async fn on_break(self: Arc<Self>, body: Value) -> BridgeResult<Option<ClientEvent>> {
        if self.handle.running() {
            return Ok(None);
        }

        let skip = self.status.lock().skip_all_pauses;
        if skip {
            self.handle.request("continue", json!({})).await?;
            return Ok(None);
        }

        let exception = body.get("exception").filter(|e| !e.is_null());
        let script_id = body.pointer("/script/id").and_then(Value::as_u64);
        let known = match script_id {
            Some(id) => self.scripts.resolve_by_id(&self.handle, id).await.is_ok(),
            None => false,
        };
        if !known && exception.is_none() {
            debug!("Stepping out of unknown script {:?}", script_id);
            self.handle
                .request("continue", json!({"stepaction": "out"}))
                .await?;
            return Ok(None);
        }

        self.clear_continue_to().await?;

        let hit_breakpoints: Vec<String> = body
            .get("breakpoints")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|bp| bp.as_u64().map(|n| n.to_string()))
            .collect();

        let reason = if exception.is_some() { "exception" } else { "other" };
        let call_frames = self.fetch_stack(&self.handle).await?;
        let mut params = json!({
            "callFrames": call_frames,
            "reason": reason,
            "hitBreakpoints": hit_breakpoints,
        });
        if let Some(exception) = exception {
            let text = exception.get("text").and_then(Value::as_str).unwrap_or("Error");
            params["data"] = json!({"type": "object", "desc": text});
        }
        Ok(Some(ClientEvent::new("Debugger.paused", params)))
    }

    async fn on_after_compile(self: Arc<Self>, body: Value) -> BridgeResult<Option<ClientEvent>> {
        let Some(script) = body.get("script").cloned() else {
            warn!("afterCompile without a script");
            return Ok(None);
        };
        let descriptor: ScriptDescriptor = serde_json::from_value(script)?;
        Ok(self
            .scripts
            .add(&descriptor)
            .added()
            .map(|script| ClientEvent::new("Debugger.scriptParsed", script.parsed_params())))
    }
}

fn parse_breakpoint_id(id: &str) -> BridgeResult<u64> {
    id.parse()
        .map_err(|_| BridgeError::InvalidParams(format!("invalid breakpoint id {:?}", id)))
}

fn scope_type(kind: u64) -> &'static str {
    match kind {
        0 => "global",
        1 => "local",
        2 => "with",
        3 => "closure",
        4 => "catch",
        5 => "block",
        _ => "script",
    }
}

/// Legacy `backtrace` frame to a client call frame
pub(crate) fn convert_frame(frame: &Value, refs: &Value) -> Value {
    let index = frame.get("index").and_then(Value::as_u64).unwrap_or(0);
    let func = frame.get("func").cloned().unwrap_or(Value::Null);

    let name = func
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .or_else(|| func.get("inferredName").and_then(Value::as_str))
        .filter(|n| !n.is_empty())
        .unwrap_or("(anonymous function)");

    let script_id = func.get("scriptId").and_then(Value::as_u64).or_else(|| {
        let script_ref = frame.pointer("/script/ref")?.as_u64()?;
        refs.get(script_ref.to_string())?.get("id")?.as_u64()
    });

    let location = json!({
        "scriptId": script_id.map(|id| id.to_string()).unwrap_or_default(),
        "lineNumber": frame.get("line").and_then(Value::as_u64).unwrap_or(0),
        "columnNumber": frame.get("column").and_then(Value::as_u64).unwrap_or(0),
    });

    let scope_chain: Vec<Value> = frame
        .get("scopes")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|scope| {
            let scope_index = scope.get("index").and_then(Value::as_u64).unwrap_or(0);
            let kind = scope.get("type").and_then(Value::as_u64).unwrap_or(0);
            json!({
                "type": scope_type(kind),
                "object": {
                    "type": "object",
                    "objectId": format!("scope:{}:{}", index, scope_index),
                    "className": "Object",
                    "description": "Object",
                },
            })
        })
        .collect();

    let receiver = frame.get("receiver").cloned().unwrap_or(Value::Null);
    let this = json!({
        "type": receiver.get("type").and_then(Value::as_str).unwrap_or("object"),
        "objectId": receiver.get("ref").map(|r| r.to_string()).unwrap_or_default(),
        "className": receiver.get("className").and_then(Value::as_str).unwrap_or("Object"),
        "description": receiver.get("text").and_then(Value::as_str).unwrap_or("Object"),
    });

    json!({
        "callFrameId": index.to_string(),
        "functionName": name,
        "location": location,
        "scopeChain": scope_chain,
        "this": this,
    })
}

pub struct DebuggerAgent;

#[async_trait]
impl Plugin for DebuggerAgent {
    fn name(&self) -> &str {
        super::DEBUGGER
    }

    async fn init(&self, cx: PluginContext) -> BridgeResult<Capability> {
        let scripts: Arc<ScriptRegistry> = cx.require(super::SCRIPTS).await?;
        let transactions: Arc<TransactionCoordinator> = cx.require(super::TRANSACTION).await?;
        let notifier: Arc<Notifier> = cx.require(super::NOTIFY).await?;
        let evaluator: Arc<Evaluator> = cx.require(super::EVAL).await?;

        let options = cx.pipeline().options().clone();
        if let Some(path) = &options.injections.debugger {
            let injector: Arc<Injector> = cx.require(super::INJECTOR).await?;
            injector.inject(path, json!({})).await?;
        }

        let state = Arc::new(DebuggerState {
            handle: cx.handle(),
            scripts,
            transactions,
            notifier,
            evaluator,
            status: Mutex::new(BreakpointStatus::default()),
            stack_trace_limit: options.stack_trace_limit,
            injected: options.injections.debugger.is_some(),
        });

        let pipeline = cx.pipeline();
        command(pipeline, "Debugger.enable", &state, DebuggerState::enable);
        command(pipeline, "Debugger.resume", &state, DebuggerState::resume);
        command(pipeline, "Debugger.stepOver", &state, DebuggerState::step_over);
        command(pipeline, "Debugger.stepInto", &state, DebuggerState::step_into);
        command(pipeline, "Debugger.stepOut", &state, DebuggerState::step_out);
        command(pipeline, "Debugger.pause", &state, DebuggerState::pause);
        command(
            pipeline,
            "Debugger.setPauseOnExceptions",
            &state,
            DebuggerState::set_pause_on_exceptions,
        );
        command(
            pipeline,
            "Debugger.setBreakpointByUrl",
            &state,
            DebuggerState::set_breakpoint_by_url,
        );
        command(pipeline, "Debugger.setBreakpoint", &state, DebuggerState::set_breakpoint);
        command(
            pipeline,
            "Debugger.removeBreakpoint",
            &state,
            DebuggerState::remove_breakpoint,
        );
        command(
            pipeline,
            "Debugger.continueToLocation",
            &state,
            DebuggerState::continue_to_location,
        );
        command(
            pipeline,
            "Debugger.setBreakpointsActive",
            &state,
            DebuggerState::set_breakpoints_active,
        );
        command(
            pipeline,
            "Debugger.setSkipAllPauses",
            &state,
            DebuggerState::set_skip_all_pauses,
        );
        command(
            pipeline,
            "Debugger.getScriptSource",
            &state,
            DebuggerState::get_script_source,
        );
        command(
            pipeline,
            "Debugger.setScriptSource",
            &state,
            DebuggerState::set_script_source,
        );
        command(
            pipeline,
            "Debugger.canSetScriptSource",
            &state,
            DebuggerState::can_set_script_source,
        );

        command(
            pipeline,
            "Debugger.evaluateOnCallFrame",
            &state,
            DebuggerState::evaluate_on_call_frame,
        );
        command(
            pipeline,
            "Debugger.getFunctionDetails",
            &state,
            DebuggerState::get_function_details,
        );

        event(pipeline, "break", &state, DebuggerState::on_break);
        event(pipeline, "exception", &state, DebuggerState::on_break);
        event(pipeline, "afterCompile", &state, DebuggerState::on_after_compile);

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_frame_inline_refs() {
        let frame = json!({
            "index": 2,
            "func": {"ref": 5, "name": "", "inferredName": "Server.listen", "scriptId": 41},
            "receiver": {"ref": 6, "type": "object", "className": "Server", "text": "#<Server>"},
            "line": 17,
            "column": 4,
            "scopes": [{"type": 1, "index": 0}, {"type": 0, "index": 1}],
        });
        let converted = convert_frame(&frame, &Value::Null);

        assert_eq!(converted["callFrameId"], "2");
        assert_eq!(converted["functionName"], "Server.listen");
        assert_eq!(
            converted["location"],
            json!({"scriptId": "41", "lineNumber": 17, "columnNumber": 4})
        );
        assert_eq!(converted["scopeChain"][0]["type"], "local");
        assert_eq!(converted["scopeChain"][1]["object"]["objectId"], "scope:2:1");
        assert_eq!(converted["this"]["className"], "Server");
        assert_eq!(converted["this"]["objectId"], "6");
    }

    #[test]
    fn test_convert_frame_script_from_refs() {
        let frame = json!({"index": 0, "func": {"ref": 1}, "script": {"ref": 9}, "line": 3});
        let refs = json!({"9": {"handle": 9, "type": "script", "id": 77}});
        let converted = convert_frame(&frame, &refs);

        assert_eq!(converted["functionName"], "(anonymous function)");
        assert_eq!(converted["location"]["scriptId"], "77");
        assert_eq!(converted["location"]["columnNumber"], 0);
    }

    #[test]
    fn test_breakpoint_status_default() {
        let status = BreakpointStatus::default();
        assert!(status.active);
        assert!(!status.skip_all_pauses);
        assert_eq!(status.continue_to, None);
    }

    #[test]
    fn test_parse_breakpoint_id() {
        assert_eq!(parse_breakpoint_id("12").unwrap(), 12);
        assert!(matches!(
            parse_breakpoint_id("a:b"),
            Err(BridgeError::InvalidParams(_))
        ));
    }
}
