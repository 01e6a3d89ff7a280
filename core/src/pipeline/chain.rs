//! Override chains for commands, events and raw requests.
//!
//! Registering a handler never replaces the previous one for the same name:
//! the new layer receives a [`Next`] that calls the older layer, or the
//! fallback when it is the first layer registered under that name.

use crate::errors::BridgeResult;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Continuation into the next-older layer of a chain
pub struct Next<T>(Arc<dyn Fn(Value) -> BoxFuture<'static, BridgeResult<T>> + Send + Sync>);

impl<T> Clone for Next<T> {
    fn clone(&self) -> Self {
        Next(Arc::clone(&self.0))
    }
}

impl<T: Send + 'static> Next<T> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Value) -> BoxFuture<'static, BridgeResult<T>> + Send + Sync + 'static,
    {
        Next(Arc::new(f))
    }

    pub fn call(&self, params: Value) -> BoxFuture<'static, BridgeResult<T>> {
        (self.0)(params)
    }
}

/// Named chains of `(params, next)` handlers
pub struct HandlerChain<T> {
    layers: RwLock<HashMap<String, Next<T>>>,
}

impl<T: Send + 'static> HandlerChain<T> {
    pub fn new() -> Self {
        HandlerChain {
            layers: RwLock::new(HashMap::new()),
        }
    }

    /// Wrap the chain for `name`; `fallback` is used only when the chain is empty.
    pub fn register<F, Fut>(&self, name: &str, fallback: impl FnOnce() -> Next<T>, handler: F)
    where
        F: Fn(Value, Next<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BridgeResult<T>> + Send + 'static,
    {
        let mut layers = self.layers.write();
        let next = match layers.get(name) {
            Some(previous) => previous.clone(),
            None => fallback(),
        };
        let layer = Next::new(move |params| Box::pin(handler(params, next.clone())));
        layers.insert(name.to_string(), layer);
    }

    /// Newest layer for `name`
    pub fn get(&self, name: &str) -> Option<Next<T>> {
        self.layers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layers.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.layers.read().keys().cloned().collect()
    }
}

impl<T: Send + 'static> Default for HandlerChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Continuation into the next-older request middleware
#[derive(Clone)]
pub struct RequestNext(
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, BridgeResult<Value>> + Send + Sync>,
);

impl RequestNext {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(String, Value) -> BoxFuture<'static, BridgeResult<Value>> + Send + Sync + 'static,
    {
        RequestNext(Arc::new(f))
    }

    pub fn call(&self, command: String, args: Value) -> BoxFuture<'static, BridgeResult<Value>> {
        (self.0)(command, args)
    }
}

/// Middleware wrapped around every raw request, whatever its name
pub struct MiddlewareStack {
    top: RwLock<RequestNext>,
}

impl MiddlewareStack {
    pub fn new(base: RequestNext) -> Self {
        MiddlewareStack {
            top: RwLock::new(base),
        }
    }

    pub fn wrap<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Value, RequestNext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BridgeResult<Value>> + Send + 'static,
    {
        let mut top = self.top.write();
        let next = top.clone();
        *top = RequestNext::new(move |command, args| Box::pin(handler(command, args, next.clone())));
    }

    pub fn top(&self) -> RequestNext {
        self.top.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BridgeError;
    use serde_json::json;

    fn echo_fallback(name: &'static str) -> impl FnOnce() -> Next<Value> {
        move || Next::new(move |params| Box::pin(async move { Ok(json!({"raw": name, "params": params})) }))
    }

    #[tokio::test]
    async fn test_empty_chain_has_no_layer() {
        let chain: HandlerChain<Value> = HandlerChain::new();
        assert!(chain.get("Debugger.enable").is_none());
        assert!(!chain.contains("Debugger.enable"));
    }

    #[tokio::test]
    async fn test_first_layer_delegates_to_fallback() {
        let chain = HandlerChain::new();
        chain.register("Runtime.evaluate", echo_fallback("Runtime.evaluate"), |params, next: Next<Value>| async move {
            next.call(params).await
        });

        let result = chain.get("Runtime.evaluate").unwrap().call(json!({"x": 1})).await.unwrap();
        assert_eq!(result, json!({"raw": "Runtime.evaluate", "params": {"x": 1}}));
    }

    #[tokio::test]
    async fn test_newest_layer_wraps_older() {
        let chain = HandlerChain::new();
        chain.register("A.b", echo_fallback("A.b"), |_params, _next: Next<Value>| async move {
            Ok(json!(["stub"]))
        });
        chain.register("A.b", echo_fallback("A.b"), |params, next: Next<Value>| async move {
            let mut inner = next.call(params).await?;
            if let Some(list) = inner.as_array_mut() {
                list.push(json!("wrapper"));
            }
            Ok(inner)
        });

        let result = chain.get("A.b").unwrap().call(Value::Null).await.unwrap();
        assert_eq!(result, json!(["stub", "wrapper"]));
    }

    #[tokio::test]
    async fn test_short_circuit_skips_older_layers() {
        let chain = HandlerChain::new();
        chain.register("A.b", echo_fallback("A.b"), |_params, _next: Next<Value>| async move {
            Err(BridgeError::Handler("older layer must not run".to_string()))
        });
        chain.register("A.b", echo_fallback("A.b"), |_params, _next: Next<Value>| async move {
            Ok(json!(false))
        });

        let result = chain.get("A.b").unwrap().call(Value::Null).await.unwrap();
        assert_eq!(result, json!(false));
    }

    #[tokio::test]
    async fn test_middleware_sees_every_command() {
        let stack = MiddlewareStack::new(RequestNext::new(|command, _args| {
            Box::pin(async move { Ok(json!(command)) })
        }));
        stack.wrap(|command, args, next| async move {
            let inner = next.call(command, args).await?;
            Ok(json!(format!("wrapped:{}", inner.as_str().unwrap_or_default())))
        });

        let result = stack.top().call("scripts".to_string(), Value::Null).await.unwrap();
        assert_eq!(result, json!("wrapped:scripts"));
    }
}
