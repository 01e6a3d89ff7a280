//! Built-in agents.
//!
//! Each agent is a [`Plugin`] that registers command and event handlers on
//! the pipeline and exposes a capability to the agents that depend on it.

pub mod debugger;
pub mod environment;
pub mod eval;
pub mod injector;
pub mod notify;
pub mod page;
pub mod protocol_stubs;
pub mod runtime;

pub use debugger::{BreakpointStatus, DebuggerAgent, DebuggerState};
pub use environment::{Environment, EnvironmentAgent};
pub use eval::{EvalAgent, Evaluator};
pub use injector::{ConsoleAgent, Injector, InjectorAgent};
pub use notify::{LogLevel, Notifier, NotifyAgent};
pub use page::PageAgent;
pub use protocol_stubs::ProtocolStubs;
pub use runtime::{ResumeOnAttach, RuntimeAgent};

use crate::errors::{BridgeError, BridgeResult};
use crate::modern::ClientEvent;
use crate::pipeline::{Pipeline, Plugin};
use crate::scripts::ScriptsPlugin;
use crate::transaction::TransactionPlugin;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

pub const PROTOCOL_STUBS: &str = "protocol-stubs";
pub const TRANSACTION: &str = "transaction";
pub const EVAL: &str = "eval";
pub const NOTIFY: &str = "notify";
pub const ENVIRONMENT: &str = "environment";
pub const SCRIPTS: &str = "scripts";
pub const INJECTOR: &str = "injector";
pub const DEBUGGER: &str = "debugger";
pub const RUNTIME: &str = "runtime";
pub const PAGE: &str = "page";
pub const CONSOLE: &str = "console";
pub const RESUME_ON_ATTACH: &str = "resume-on-attach";

/// Frame every execution context and resource hangs off
pub const TOP_FRAME_ID: &str = "ni-top-frame";

/// Register the standard agent set on `pipeline`.
///
/// Order matters only for command layering: stubs go first so every other
/// agent wraps them.
pub fn install_defaults(pipeline: &Pipeline) {
    let options = pipeline.options().clone();
    let mut plugins: Vec<Arc<dyn Plugin>> = vec![
        Arc::new(ProtocolStubs),
        Arc::new(TransactionPlugin),
        Arc::new(EvalAgent),
        Arc::new(NotifyAgent),
        Arc::new(EnvironmentAgent),
        Arc::new(ScriptsPlugin),
        Arc::new(DebuggerAgent),
        Arc::new(RuntimeAgent),
        Arc::new(PageAgent),
    ];
    if options.injections.any() {
        plugins.push(Arc::new(InjectorAgent));
    }
    if let Some(path) = options.injections.console {
        plugins.push(Arc::new(ConsoleAgent::new(path)));
    }
    if options.resume_on_attach {
        plugins.push(Arc::new(ResumeOnAttach));
    }

    for plugin in plugins {
        pipeline.register_plugin(plugin);
    }
}

/// Bind an agent method as the newest layer of a command.
///
/// The method decides on its own whether to delegate, so the continuation
/// is dropped.
pub(crate) fn command<S, F, Fut>(pipeline: &Pipeline, name: &str, state: &Arc<S>, method: F)
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BridgeResult<Value>> + Send + 'static,
{
    let state = Arc::clone(state);
    pipeline.register_command(name, move |params, _next| method(Arc::clone(&state), params));
}

/// Bind an agent method as the newest layer of an event.
pub(crate) fn event<S, F, Fut>(pipeline: &Pipeline, name: &str, state: &Arc<S>, method: F)
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BridgeResult<Option<ClientEvent>>> + Send + 'static,
{
    let state = Arc::clone(state);
    pipeline.register_event(name, move |params, _next| method(Arc::clone(&state), params));
}

/// Deserialize command params; an absent params object reads as `{}`.
pub(crate) fn parse_params<T: DeserializeOwned>(params: Value) -> BridgeResult<T> {
    let params = match params {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(params).map_err(|e| BridgeError::InvalidParams(e.to_string()))
}
