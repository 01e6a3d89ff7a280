//! Page domain: the resource tree the client uses to list sources.

use super::environment::Environment;
use super::{command, parse_params};
use crate::errors::{BridgeError, BridgeResult};
use crate::pipeline::{Capability, PipelineHandle, Plugin, PluginContext};
use crate::scripts::{path_to_url, ScriptRegistry};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct ResourceContentParams {
    url: String,
}

fn frame(kind: &str, url: &str, loader_id: u32) -> Value {
    json!({
        "id": format!("ni-{}-frame", kind),
        "name": format!("<{} frame>", kind),
        "url": url,
        "loaderId": loader_id.to_string(),
        "securityOrigin": "node-inspector",
        "mimeType": "text/javascript",
    })
}

pub struct PageState {
    handle: PipelineHandle,
    env: Arc<Environment>,
    scripts: Arc<ScriptRegistry>,
}

impl PageState {
    async fn get_resource_tree(self: Arc<Self>, _params: Value) -> BridgeResult<Value> {
        if self.scripts.is_empty() {
            self.scripts.reload(&self.handle).await?;
        }

        let main_url = path_to_url(&self.env.filename, false);
        let resources: Vec<Value> = self.scripts.all().iter().map(|s| s.resource()).collect();

        Ok(json!({
            "frameTree": {
                "frame": frame("top", &main_url, self.env.pid),
                "resources": [],
                "childFrames": [
                    {"frame": frame("script", &main_url, self.env.pid), "resources": resources},
                    {"frame": frame("native", "node://", self.env.pid), "resources": []},
                ],
            }
        }))
    }

    async fn get_resource_content(self: Arc<Self>, params: Value) -> BridgeResult<Value> {
        let params: ResourceContentParams = parse_params(params)?;
        let script = self
            .scripts
            .resolve_by_url(&params.url)
            .ok_or_else(|| BridgeError::ScriptNotFound(params.url.clone()))?;
        let content = self.scripts.get_source(&self.handle, script.id).await?;
        Ok(json!({"content": content}))
    }
}

pub struct PageAgent;

#[async_trait]
impl Plugin for PageAgent {
    fn name(&self) -> &str {
        super::PAGE
    }

    async fn init(&self, cx: PluginContext) -> BridgeResult<Capability> {
        let env: Arc<Environment> = cx.require(super::ENVIRONMENT).await?;
        let scripts: Arc<ScriptRegistry> = cx.require(super::SCRIPTS).await?;

        let state = Arc::new(PageState {
            handle: cx.handle(),
            env,
            scripts,
        });
        command(cx.pipeline(), "Page.getResourceTree", &state, PageState::get_resource_tree);
        command(
            cx.pipeline(),
            "Page.getResourceContent",
            &state,
            PageState::get_resource_content,
        );
        Ok(state)
    }
}
