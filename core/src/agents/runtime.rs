use super::injector::Injector;
use super::{command, TOP_FRAME_ID};
use crate::errors::BridgeResult;
use crate::pipeline::{Capability, PipelineHandle, Plugin, PluginContext};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

pub struct RuntimeState {
    handle: PipelineHandle,
}

impl RuntimeState {
    async fn enable(self: Arc<Self>, _params: Value) -> BridgeResult<Value> {
        self.handle
            .emit_event(
                "Runtime.executionContextCreated",
                json!({
                    "context": {
                        "id": 1,
                        "isPageContext": true,
                        "name": "<top frame>",
                        "origin": "<top frame>",
                        "frameId": TOP_FRAME_ID,
                    }
                }),
            )
            .await?;
        Ok(Value::Null)
    }
}

pub struct RuntimeAgent;

#[async_trait]
impl Plugin for RuntimeAgent {
    fn name(&self) -> &str {
        super::RUNTIME
    }

    async fn init(&self, cx: PluginContext) -> BridgeResult<Capability> {
        if let Some(path) = &cx.pipeline().options().injections.runtime {
            let injector: Arc<Injector> = cx.require(super::INJECTOR).await?;
            injector.inject(path, json!({})).await?;
        }

        let state = Arc::new(RuntimeState { handle: cx.handle() });
        command(cx.pipeline(), "Runtime.enable", &state, RuntimeState::enable);
        Ok(state)
    }
}

/// Lets a debuggee started paused run as soon as the bridge is attached
pub struct ResumeOnAttach;

#[async_trait]
impl Plugin for ResumeOnAttach {
    fn name(&self) -> &str {
        super::RESUME_ON_ATTACH
    }

    async fn init(&self, cx: PluginContext) -> BridgeResult<Capability> {
        let handle = cx.handle();
        // Readiness includes this initializer, so wait for it elsewhere.
        tokio::spawn(async move {
            let Ok(pipeline) = handle.upgrade() else {
                return;
            };
            pipeline.ready().await;
            if pipeline.backend().running() {
                return;
            }
            match pipeline.request("Debugger.resume", json!({})).await {
                Ok(_) => info!("Resumed {} on attach", pipeline.backend().address()),
                Err(e) => warn!("Resume on attach failed: {}", e),
            }
        });
        Ok(Arc::new(()))
    }
}
