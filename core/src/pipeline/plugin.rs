//! Plugins: named, lazily initialized capabilities.
//!
//! A plugin's initializer runs at most once per pipeline. Every caller of
//! the same name shares one future and receives the same capability, or
//! the same error. Initializers express their dependencies by requiring
//! other plugins through their [`PluginContext`].

use super::{Pipeline, PipelineHandle, SessionNotice};
use crate::errors::{BridgeError, BridgeResult};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Capability object produced by a plugin initializer
pub type Capability = Arc<dyn Any + Send + Sync>;

type SharedInit = Shared<BoxFuture<'static, BridgeResult<Capability>>>;

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Register handlers and build the capability other plugins will receive
    async fn init(&self, cx: PluginContext) -> BridgeResult<Capability>;
}

/// Handed to an initializer while it runs
pub struct PluginContext {
    pipeline: Arc<Pipeline>,
    name: String,
}

impl PluginContext {
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Weak handle for handlers that outlive initialization
    pub fn handle(&self) -> PipelineHandle {
        self.pipeline.handle()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Await another plugin's capability
    pub async fn require<T: Any + Send + Sync>(&self, name: &str) -> BridgeResult<Arc<T>> {
        let capability = self
            .pipeline
            .plugins
            .acquire(&self.pipeline, name, Some(&self.name))
            .await?;
        downcast(name, capability)
    }
}

pub(crate) fn downcast<T: Any + Send + Sync>(
    name: &str,
    capability: Capability,
) -> BridgeResult<Arc<T>> {
    capability.downcast::<T>().map_err(|_| BridgeError::PluginFailed {
        name: name.to_string(),
        message: format!("capability is not a {}", std::any::type_name::<T>()),
    })
}

/// Plugin definitions plus their memoized initializations
pub struct PluginRegistry {
    definitions: RwLock<Vec<Arc<dyn Plugin>>>,
    resolved: Mutex<HashMap<String, SharedInit>>,
    /// dependent -> plugins it is currently awaiting
    waits: Mutex<HashMap<String, HashSet<String>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry {
            definitions: RwLock::new(Vec::new()),
            resolved: Mutex::new(HashMap::new()),
            waits: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, plugin: Arc<dyn Plugin>) {
        let mut definitions = self.definitions.write();
        if let Some(existing) = definitions.iter_mut().find(|p| p.name() == plugin.name()) {
            warn!(
                "Plugin '{}' already registered, replacing the previous definition",
                plugin.name()
            );
            *existing = plugin;
        } else {
            definitions.push(plugin);
        }
    }

    /// Registered names, in registration order
    pub fn list_plugins(&self) -> Vec<String> {
        self.definitions
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub(crate) async fn acquire(
        &self,
        pipeline: &Arc<Pipeline>,
        name: &str,
        requester: Option<&str>,
    ) -> BridgeResult<Capability> {
        if let Some(requester) = requester {
            self.begin_wait(requester, name)?;
        }

        let result = match self.resolve(pipeline, name) {
            Ok(init) => init.await,
            Err(e) => Err(e),
        };

        if let Some(requester) = requester {
            self.end_wait(requester, name);
        }
        result
    }

    fn resolve(&self, pipeline: &Arc<Pipeline>, name: &str) -> BridgeResult<SharedInit> {
        let mut resolved = self.resolved.lock();
        if let Some(init) = resolved.get(name) {
            return Ok(init.clone());
        }

        let plugin = self
            .definitions
            .read()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| BridgeError::PluginNotFound(name.to_string()))?;

        let cx = PluginContext {
            pipeline: Arc::clone(pipeline),
            name: name.to_string(),
        };
        let handle = pipeline.handle();
        let owned = name.to_string();

        let init = async move {
            debug!("Initializing plugin {}", owned);
            match plugin.init(cx).await {
                Ok(capability) => {
                    info!("Plugin {} ready", owned);
                    Ok(capability)
                }
                Err(e) => {
                    let message = e.to_string();
                    error!("Plugin {} failed: {}", owned, message);
                    handle.broadcast(SessionNotice::PluginFailed {
                        name: owned.clone(),
                        message: message.clone(),
                    });
                    Err(BridgeError::PluginFailed {
                        name: owned,
                        message,
                    })
                }
            }
        }
        .boxed()
        .shared();

        resolved.insert(name.to_string(), init.clone());
        Ok(init)
    }

    /// Record that `requester` awaits `name`, refusing edges that close a cycle.
    fn begin_wait(&self, requester: &str, name: &str) -> BridgeResult<()> {
        let mut waits = self.waits.lock();
        if let Some(path) = find_path(&waits, name, requester) {
            let cycle = std::iter::once(requester.to_string())
                .chain(path)
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(BridgeError::PluginCycle(cycle));
        }
        waits
            .entry(requester.to_string())
            .or_default()
            .insert(name.to_string());
        Ok(())
    }

    fn end_wait(&self, requester: &str, name: &str) {
        let mut waits = self.waits.lock();
        if let Some(targets) = waits.get_mut(requester) {
            targets.remove(name);
            if targets.is_empty() {
                waits.remove(requester);
            }
        }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Path `from -> ... -> to` through the wait graph, if any
fn find_path(
    waits: &HashMap<String, HashSet<String>>,
    from: &str,
    to: &str,
) -> Option<Vec<String>> {
    let mut stack = vec![vec![from.to_string()]];
    let mut seen = HashSet::new();
    while let Some(path) = stack.pop() {
        let last = path.last()?.clone();
        if last == to {
            return Some(path);
        }
        if !seen.insert(last.clone()) {
            continue;
        }
        for next in waits.get(&last).into_iter().flatten() {
            let mut extended = path.clone();
            extended.push(next.clone());
            stack.push(extended);
        }
    }
    None
}
