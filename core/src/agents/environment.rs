use super::eval::Evaluator;
use crate::errors::{BridgeError, BridgeResult};
use crate::pipeline::{Capability, Plugin, PluginContext};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

const ENVIRONMENT_EXPRESSION: &str = "JSON.stringify({\
    pid: process.pid, \
    cwd: process.cwd(), \
    filename: process.mainModule ? process.mainModule.filename : process.argv[1], \
    nodeVersion: process.version\
})";

/// Debuggee process facts, fetched once per backend
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub pid: u32,
    pub cwd: String,
    #[serde(default)]
    pub filename: String,
    pub node_version: String,
}

impl Environment {
    /// Parse the string mirror returned by `evaluate`
    pub fn from_mirror(mirror: &Value) -> BridgeResult<Self> {
        let text = mirror
            .get("value")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::Protocol("environment query returned no string".to_string()))?;
        Ok(serde_json::from_str(text)?)
    }
}

/// Also settles the running flag: its evaluate response carries `running`.
pub struct EnvironmentAgent;

#[async_trait]
impl Plugin for EnvironmentAgent {
    fn name(&self) -> &str {
        super::ENVIRONMENT
    }

    async fn init(&self, cx: PluginContext) -> BridgeResult<Capability> {
        let eval: Arc<Evaluator> = cx.require(super::EVAL).await?;
        let mirror = eval.evaluate(ENVIRONMENT_EXPRESSION).await?;
        let env = Environment::from_mirror(&mirror)?;
        info!(
            "Debuggee pid {} running {} ({})",
            env.pid, env.filename, env.node_version
        );
        Ok(Arc::new(env))
    }
}
