//! Loading opaque helper modules into the debuggee.
//!
//! The loader reaches the debuggee's module system through the scope of the
//! global `console` getter, which closes over the runtime's native module
//! table. That handle is captured once at init and reused for every load.

use super::eval::Evaluator;
use super::environment::Environment;
use crate::backend::Requester;
use crate::errors::{BridgeError, BridgeResult};
use crate::pipeline::{Capability, PipelineHandle, Plugin, PluginContext};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

const CONSOLE_GETTER: &str = "Object.getOwnPropertyDescriptor(global, 'console').get";
const NATIVE_MODULE: &str = "NativeModule";

pub struct Injector {
    handle: PipelineHandle,
    eval: Arc<Evaluator>,
    native_module: u64,
}

impl Injector {
    /// Load `module_path` in the debuggee and call its export with `options`.
    ///
    /// Returns whatever JSON the module's export returned.
    pub async fn inject(&self, module_path: &str, options: Value) -> BridgeResult<Value> {
        let expression = format!(
            "JSON.stringify(NM.require('module')._load({})({}))",
            serde_json::to_string(module_path)?,
            serde_json::to_string(&options)?,
        );

        let result = with_suspended(&self.handle, || async {
            self.eval
                .evaluate_with(
                    &expression,
                    json!({"additional_context": [{"name": "NM", "handle": self.native_module}]}),
                )
                .await
        })
        .await?;

        info!("Injected {}", module_path);
        match result.get("value").and_then(Value::as_str) {
            Some(text) => Ok(serde_json::from_str(text)?),
            None => Ok(Value::Null),
        }
    }
}

/// Run `f` with the debuggee suspended, resuming afterwards if it was running.
async fn with_suspended<F, Fut, T>(handle: &PipelineHandle, f: F) -> BridgeResult<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = BridgeResult<T>>,
{
    let running = handle.running();
    if running {
        handle.request("suspend", json!({})).await?;
    }
    let result = f().await;
    if running {
        handle.request("continue", json!({})).await?;
    }
    result
}

/// Handle of the native module table inside a `scope` response body
fn find_native_module(scope: &Value) -> BridgeResult<u64> {
    let object_ref = scope
        .pointer("/object/ref")
        .and_then(Value::as_u64)
        .ok_or_else(|| BridgeError::Protocol("scope response without object ref".to_string()))?;

    scope
        .get("refs")
        .and_then(|refs| refs.get(object_ref.to_string()))
        .and_then(|object| object.get("properties"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|prop| prop.get("name").and_then(Value::as_str) == Some(NATIVE_MODULE))
        .and_then(|prop| prop.get("ref").and_then(Value::as_u64))
        .ok_or_else(|| BridgeError::Protocol("no NativeModule in target scope".to_string()))
}

pub struct InjectorAgent;

#[async_trait]
impl Plugin for InjectorAgent {
    fn name(&self) -> &str {
        super::INJECTOR
    }

    async fn init(&self, cx: PluginContext) -> BridgeResult<Capability> {
        let _: Arc<Environment> = cx.require(super::ENVIRONMENT).await?;
        let eval: Arc<Evaluator> = cx.require(super::EVAL).await?;
        let handle = cx.handle();

        let native_module = with_suspended(&handle, || async {
            let getter = eval.evaluate(CONSOLE_GETTER).await?;
            let function = getter
                .get("handle")
                .and_then(Value::as_u64)
                .ok_or_else(|| BridgeError::Protocol("console getter has no handle".to_string()))?;
            let scope = handle
                .request("scope", json!({"functionHandle": function}))
                .await?;
            find_native_module(&scope)
        })
        .await?;

        debug!("Native module table at handle {}", native_module);
        Ok(Arc::new(Injector {
            handle,
            eval,
            native_module,
        }))
    }
}

/// Loads the console helper module; contributes no handlers of its own
pub struct ConsoleAgent {
    module_path: String,
}

impl ConsoleAgent {
    pub fn new(module_path: impl Into<String>) -> Self {
        ConsoleAgent {
            module_path: module_path.into(),
        }
    }
}

#[async_trait]
impl Plugin for ConsoleAgent {
    fn name(&self) -> &str {
        super::CONSOLE
    }

    async fn init(&self, cx: PluginContext) -> BridgeResult<Capability> {
        let injector: Arc<Injector> = cx.require(super::INJECTOR).await?;
        let reply = injector.inject(&self.module_path, json!({})).await?;
        Ok(Arc::new(reply))
    }
}
