use crate::backend::Requester;
use crate::errors::BridgeResult;
use crate::pipeline::{Capability, PipelineHandle, Plugin, PluginContext};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Global-context evaluation in the debuggee
pub struct Evaluator {
    handle: PipelineHandle,
}

impl Evaluator {
    pub fn new(handle: PipelineHandle) -> Self {
        Evaluator { handle }
    }

    pub async fn evaluate(&self, expression: &str) -> BridgeResult<Value> {
        self.evaluate_with(expression, Value::Null).await
    }

    /// Evaluate with extra `evaluate` arguments merged in (e.g. `additional_context`)
    pub async fn evaluate_with(&self, expression: &str, extra: Value) -> BridgeResult<Value> {
        let mut args = json!({"expression": expression, "global": true});
        if let (Some(args), Value::Object(extra)) = (args.as_object_mut(), extra) {
            args.extend(extra);
        }
        self.handle.request("evaluate", args).await
    }

    /// Evaluate in the scope of a paused frame
    pub async fn evaluate_in_frame(&self, frame: u32, expression: &str) -> BridgeResult<Value> {
        self.handle
            .request(
                "evaluate",
                json!({"expression": expression, "frame": frame, "global": false}),
            )
            .await
    }
}

/// Client `RemoteObject` for a legacy value mirror
pub fn remote_object(mirror: &Value) -> Value {
    let kind = mirror["type"].as_str().unwrap_or("undefined");
    let text = mirror.get("text").and_then(Value::as_str);
    match kind {
        "undefined" => json!({"type": "undefined"}),
        "null" => json!({"type": "object", "subtype": "null", "value": null}),
        "boolean" | "number" | "string" => {
            let description = text.map(str::to_string).unwrap_or_else(|| match &mirror["value"] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            json!({"type": kind, "value": mirror["value"], "description": description})
        }
        _ => {
            let class = mirror["className"].as_str().unwrap_or("Object");
            let mut object = json!({
                "type": if kind == "function" { "function" } else { "object" },
                "className": class,
                "description": text.unwrap_or(class),
            });
            if matches!(kind, "regexp" | "date" | "error") {
                object["subtype"] = json!(kind);
            } else if class == "Array" {
                object["subtype"] = json!("array");
            }
            if let Some(handle) = mirror.get("handle").and_then(Value::as_i64) {
                object["objectId"] = json!(handle.to_string());
            }
            object
        }
    }
}

/// Client `RemoteObject` for an exception the debuggee reported as a message
pub fn thrown_object(message: &str) -> Value {
    json!({
        "type": "object",
        "subtype": "error",
        "className": "Error",
        "description": message,
    })
}

/// `Debugger.getFunctionDetails` details for a legacy function mirror
pub fn function_details(mirror: &Value) -> Value {
    let name = mirror["name"]
        .as_str()
        .filter(|name| !name.is_empty())
        .or_else(|| mirror["inferredName"].as_str())
        .unwrap_or("");
    json!({
        "location": {
            "scriptId": mirror["scriptId"].to_string(),
            "lineNumber": mirror["line"],
            "columnNumber": mirror["column"],
        },
        "functionName": name,
        "isGenerator": false,
    })
}

pub struct EvalAgent;

#[async_trait]
impl Plugin for EvalAgent {
    fn name(&self) -> &str {
        super::EVAL
    }

    async fn init(&self, cx: PluginContext) -> BridgeResult<Capability> {
        Ok(Arc::new(Evaluator::new(cx.handle())))
    }
}
