//! Extension pipeline layered over one backend connection.
//!
//! Client commands enter through [`Pipeline::dispatch_command`], walk the
//! command chain registered for their name, and fall through to the request
//! middleware and finally the raw backend. Backend events walk the event
//! chain and whatever comes out is fanned out to every subscribed session.

pub mod chain;
pub mod plugin;

pub use chain::{HandlerChain, MiddlewareStack, Next, RequestNext};
pub use plugin::{Capability, Plugin, PluginContext, PluginRegistry};

use crate::backend::{BackendConnection, BackendNotice, Requester};
use crate::config::BridgeOptions;
use crate::errors::{BridgeError, BridgeResult};
use crate::modern::ClientEvent;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// What a pipeline tells its subscribed sessions
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    Event(ClientEvent),
    /// Malformed frame from the debuggee
    BackendError(String),
    PluginFailed { name: String, message: String },
    /// An event handler failed; the event was dropped
    HandlerFailed { event: String, message: String },
    /// The backend is gone; always the last notice
    BackendClosed(String),
}

/// Command, event and plugin composition for one backend
pub struct Pipeline {
    me: Weak<Pipeline>,
    backend: Arc<BackendConnection>,
    options: BridgeOptions,
    commands: HandlerChain<Value>,
    events: HandlerChain<Option<ClientEvent>>,
    requests: MiddlewareStack,
    pub(crate) plugins: PluginRegistry,
    listeners: DashMap<Uuid, mpsc::UnboundedSender<SessionNotice>>,
    notices: Mutex<Option<mpsc::UnboundedReceiver<BackendNotice>>>,
    ready_tx: watch::Sender<bool>,
    closed: Mutex<Option<String>>,
}

impl Pipeline {
    pub fn new(
        backend: Arc<BackendConnection>,
        notices: mpsc::UnboundedReceiver<BackendNotice>,
        options: BridgeOptions,
    ) -> Arc<Self> {
        let raw = Arc::clone(&backend);
        let base = RequestNext::new(move |command, args| {
            let raw = Arc::clone(&raw);
            Box::pin(async move { raw.request(&command, args).await })
        });
        let (ready_tx, _) = watch::channel(false);

        Arc::new_cyclic(|me| Pipeline {
            me: me.clone(),
            backend,
            options,
            commands: HandlerChain::new(),
            events: HandlerChain::new(),
            requests: MiddlewareStack::new(base),
            plugins: PluginRegistry::new(),
            listeners: DashMap::new(),
            notices: Mutex::new(Some(notices)),
            ready_tx,
            closed: Mutex::new(None),
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle(self.me.clone())
    }

    pub fn backend(&self) -> &Arc<BackendConnection> {
        &self.backend
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Wrap the command chain for `name`.
    ///
    /// The first handler for a name falls through to a raw backend request
    /// with that name.
    pub fn register_command<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Value, Next<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BridgeResult<Value>> + Send + 'static,
    {
        let handle = self.handle();
        let command = name.to_string();
        self.commands.register(
            name,
            move || {
                Next::new(move |params| {
                    let handle = handle.clone();
                    let command = command.clone();
                    Box::pin(async move { handle.upgrade()?.raw_request(&command, params).await })
                })
            },
            handler,
        );
    }

    /// Wrap the event chain for `name`.
    ///
    /// The first handler for a name falls through to forwarding the event
    /// unchanged.
    pub fn register_event<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Value, Next<Option<ClientEvent>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BridgeResult<Option<ClientEvent>>> + Send + 'static,
    {
        let method = name.to_string();
        self.events.register(
            name,
            move || {
                Next::new(move |params| {
                    let method = method.clone();
                    Box::pin(async move { Ok(passthrough(&method, params)) })
                })
            },
            handler,
        );
    }

    /// Wrap every raw request, below all command chains
    pub fn wrap_requests<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Value, RequestNext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BridgeResult<Value>> + Send + 'static,
    {
        self.requests.wrap(handler);
    }

    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.plugins.register(plugin);
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.list_plugins()
    }

    /// Memoized capability of the named plugin, initializing it on first use
    pub async fn plugin<T: Any + Send + Sync>(&self, name: &str) -> BridgeResult<Arc<T>> {
        let me = self.handle().upgrade()?;
        let capability = self.plugins.acquire(&me, name, None).await?;
        plugin::downcast(name, capability)
    }

    /// Initialize every registered plugin, then start processing backend
    /// notices. Only the first call has an effect.
    pub fn start(&self) {
        let Some(notices) = self.notices.lock().take() else {
            return;
        };
        let Some(pipeline) = self.me.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            pipeline.init_plugins().await;
            pipeline.ready_tx.send_replace(true);
            info!("Pipeline for {} ready", pipeline.backend.address());
            pipeline.run_notices(notices).await;
        });
    }

    async fn init_plugins(self: &Arc<Self>) {
        for name in self.plugins.list_plugins() {
            if let Err(e) = self.plugins.acquire(self, &name, None).await {
                debug!("Plugin {} unavailable: {}", name, e);
            }
        }
    }

    /// Resolves once every plugin initializer has settled
    pub async fn ready(&self) {
        let mut ready_rx = self.ready_tx.subscribe();
        let _ = ready_rx.wait_for(|ready| *ready).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    async fn run_notices(&self, mut notices: mpsc::UnboundedReceiver<BackendNotice>) {
        while let Some(notice) = notices.recv().await {
            match notice {
                BackendNotice::Event(event) => {
                    let name = event.event.clone();
                    if let Err(e) = self.emit_event(&name, event.body).await {
                        warn!("Event handler for {} failed: {}", name, e);
                        self.broadcast(SessionNotice::HandlerFailed {
                            event: name,
                            message: e.to_string(),
                        });
                    }
                }
                BackendNotice::Unhandled(message) => {
                    debug!("Unhandled message from {}: {:?}", self.backend.address(), message);
                }
                BackendNotice::ProtocolError(reason) => {
                    self.broadcast(SessionNotice::BackendError(reason));
                }
                BackendNotice::Closed(reason) => {
                    info!("Backend {} closed: {}", self.backend.address(), reason);
                    *self.closed.lock() = Some(reason.clone());
                    self.broadcast(SessionNotice::BackendClosed(reason));
                    self.listeners.clear();
                    break;
                }
            }
        }
    }

    /// Route a client command once the pipeline is ready.
    pub async fn dispatch_command(&self, method: &str, params: Value) -> BridgeResult<Value> {
        self.ready().await;
        self.request(method, params).await
    }

    /// Route a command through its chain, or straight to the middleware.
    pub async fn request(&self, command: &str, args: Value) -> BridgeResult<Value> {
        match self.commands.get(command) {
            Some(layer) => layer.call(args).await,
            None => self.raw_request(command, args).await,
        }
    }

    /// Skip the command chains; still passes through request middleware.
    pub async fn raw_request(&self, command: &str, args: Value) -> BridgeResult<Value> {
        self.requests.top().call(command.to_string(), args).await
    }

    /// Run `name` through its event chain and broadcast the result.
    pub async fn emit_event(&self, name: &str, params: Value) -> BridgeResult<()> {
        let translated = match self.events.get(name) {
            Some(layer) => layer.call(params).await?,
            None => passthrough(name, params),
        };
        if let Some(event) = translated {
            self.broadcast(SessionNotice::Event(event));
        }
        Ok(())
    }

    /// Subscribe a session to this pipeline's notices
    pub fn subscribe(&self, session: Uuid) -> mpsc::UnboundedReceiver<SessionNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(reason) = self.closed.lock().clone() {
            let _ = tx.send(SessionNotice::BackendClosed(reason));
        } else {
            self.listeners.insert(session, tx);
        }
        rx
    }

    pub fn unsubscribe(&self, session: Uuid) {
        self.listeners.remove(&session);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn broadcast(&self, notice: SessionNotice) {
        self.listeners
            .retain(|_, listener| listener.send(notice.clone()).is_ok());
    }
}

#[async_trait]
impl Requester for Pipeline {
    async fn request(&self, command: &str, args: Value) -> BridgeResult<Value> {
        Pipeline::request(self, command, args).await
    }
}

/// Unknown events keep their name when it looks like `Domain.event`;
/// bare legacy names have no client-side meaning and are dropped.
fn passthrough(name: &str, params: Value) -> Option<ClientEvent> {
    if name.contains('.') {
        Some(ClientEvent::new(name, params))
    } else {
        trace!("Dropping untranslated legacy event {}", name);
        None
    }
}

/// Weak reference held by handlers and capabilities, so they never keep
/// their own pipeline alive.
#[derive(Clone)]
pub struct PipelineHandle(Weak<Pipeline>);

impl PipelineHandle {
    pub fn upgrade(&self) -> BridgeResult<Arc<Pipeline>> {
        self.0.upgrade().ok_or(BridgeError::ConnectionClosed)
    }

    pub async fn emit_event(&self, name: &str, params: Value) -> BridgeResult<()> {
        self.upgrade()?.emit_event(name, params).await
    }

    pub fn broadcast(&self, notice: SessionNotice) {
        if let Some(pipeline) = self.0.upgrade() {
            pipeline.broadcast(notice);
        }
    }

    pub fn running(&self) -> bool {
        self.0
            .upgrade()
            .map(|p| p.backend.running())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Requester for PipelineHandle {
    async fn request(&self, command: &str, args: Value) -> BridgeResult<Value> {
        self.upgrade()?.request(command, args).await
    }
}
