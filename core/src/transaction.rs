//! Non-interleaved multi-request sequences.
//!
//! Installed as request middleware. Ordinary requests wait behind the
//! current transaction; requests made by a transaction travel under a
//! side-channel command name and skip that wait.

use crate::backend::Requester;
use crate::errors::{BridgeError, BridgeResult};
use crate::pipeline::{Capability, PipelineHandle, Plugin, PluginContext, RequestNext};
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Side-channel command carrying `{command, arguments}` of a transaction request
pub const TRANSACTION_COMMAND: &str = "NodeInspector.Transaction";

type Gate = Shared<BoxFuture<'static, ()>>;

fn open_gate() -> Gate {
    futures::future::ready(()).boxed().shared()
}

/// Gate that opens when the returned sender fires or is dropped
fn pending_gate() -> (oneshot::Sender<()>, Gate) {
    let (tx, rx) = oneshot::channel::<()>();
    (tx, rx.map(|_| ()).boxed().shared())
}

struct TxState {
    /// Opens when the newest transaction has finished
    current: Gate,
    /// Ordinary requests in flight, keyed so each removes itself once settled
    pending: HashMap<u64, Gate>,
    next_key: u64,
}

pub struct TransactionCoordinator {
    handle: PipelineHandle,
    state: Mutex<TxState>,
}

impl TransactionCoordinator {
    pub fn new(handle: PipelineHandle) -> Self {
        TransactionCoordinator {
            handle,
            state: Mutex::new(TxState {
                current: open_gate(),
                pending: HashMap::new(),
                next_key: 0,
            }),
        }
    }

    /// Request middleware: unwraps side-channel requests, gates the rest.
    pub fn route(
        self: &Arc<Self>,
        command: String,
        args: Value,
        next: RequestNext,
    ) -> BoxFuture<'static, BridgeResult<Value>> {
        if command == TRANSACTION_COMMAND {
            return async move {
                let inner = args
                    .get("command")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        BridgeError::InvalidParams("transaction request without command".to_string())
                    })?
                    .to_string();
                let arguments = args.get("arguments").cloned().unwrap_or(Value::Null);
                next.call(inner, arguments).await
            }
            .boxed();
        }

        let (done, settled) = pending_gate();
        let (key, gate) = {
            let mut state = self.state.lock();
            let key = state.next_key;
            state.next_key += 1;
            state.pending.insert(key, settled);
            (key, state.current.clone())
        };

        let settled = Settled {
            coordinator: Arc::clone(self),
            key,
            done: Some(done),
        };
        async move {
            let _settled = settled;
            gate.await;
            next.call(command, args).await
        }
        .boxed()
    }

    /// Ordinary requests not yet settled
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Run `f` with a requester whose requests do not interleave with any
    /// other transaction or with ordinary requests queued before this call.
    ///
    /// `f` must issue its requests through the requester it is given;
    /// ordinary pipeline requests made from inside `f` wait for `f` itself.
    pub async fn transaction<F, Fut, T>(&self, f: F) -> BridgeResult<T>
    where
        F: FnOnce(TransactionRequester) -> Fut,
        Fut: Future<Output = BridgeResult<T>>,
    {
        let (done, finished) = pending_gate();
        let (previous, queued) = {
            let mut state = self.state.lock();
            let previous = std::mem::replace(&mut state.current, finished);
            let queued: Vec<Gate> = state.pending.values().cloned().collect();
            (previous, queued)
        };

        debug!("Transaction waiting on {} queued request(s)", queued.len());
        previous.await;
        join_all(queued).await;

        let result = f(TransactionRequester {
            handle: self.handle.clone(),
        })
        .await;
        let _ = done.send(());
        result
    }
}

/// Forgets an ordinary request and opens its gate when the request
/// finishes or is dropped
struct Settled {
    coordinator: Arc<TransactionCoordinator>,
    key: u64,
    done: Option<oneshot::Sender<()>>,
}

impl Drop for Settled {
    fn drop(&mut self) {
        self.coordinator.state.lock().pending.remove(&self.key);
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

/// Requester handed to a transaction body
#[derive(Clone)]
pub struct TransactionRequester {
    handle: PipelineHandle,
}

#[async_trait]
impl Requester for TransactionRequester {
    async fn request(&self, command: &str, args: Value) -> BridgeResult<Value> {
        self.handle
            .request(
                TRANSACTION_COMMAND,
                json!({"command": command, "arguments": args}),
            )
            .await
    }
}

/// Installs the coordinator below every command chain
pub struct TransactionPlugin;

#[async_trait]
impl Plugin for TransactionPlugin {
    fn name(&self) -> &str {
        crate::agents::TRANSACTION
    }

    async fn init(&self, cx: PluginContext) -> BridgeResult<Capability> {
        let coordinator = Arc::new(TransactionCoordinator::new(cx.handle()));
        let router = Arc::clone(&coordinator);
        cx.pipeline()
            .wrap_requests(move |command, args, next| router.route(command, args, next));
        Ok(coordinator)
    }
}
