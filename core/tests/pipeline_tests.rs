//! Extension pipeline tests: plugin memoization, failure and cycle
//! handling, command layering and transaction exclusion.

use async_trait::async_trait;
use inspector_bridge_core::agents::TRANSACTION;
use inspector_bridge_core::pipeline::{Capability, Plugin, PluginContext};
use inspector_bridge_core::testing::{self, Reply, Responder};
use inspector_bridge_core::transaction::TransactionPlugin;
use inspector_bridge_core::{
    BridgeError, BridgeOptions, BridgeResult, Pipeline, SessionNotice, TransactionCoordinator,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

fn bare_pipeline<F>(responder: F) -> (Arc<Pipeline>, Responder)
where
    F: Fn(&inspector_bridge_core::LegacyRequest) -> Reply + Send + 'static,
{
    let options = BridgeOptions::default();
    let (connection, notices, debuggee) = testing::connect(&options);
    let responder = debuggee.spawn(responder);
    (Pipeline::new(connection, notices, options), responder)
}

fn echo(request: &inspector_bridge_core::LegacyRequest) -> Reply {
    Reply::Ok(json!({"command": request.command}))
}

struct Marker(&'static str);

/// Slow initializer that counts its runs
struct Counted {
    name: &'static str,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Plugin for Counted {
    fn name(&self) -> &str {
        self.name
    }

    async fn init(&self, _cx: PluginContext) -> BridgeResult<Capability> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Arc::new(Marker(self.name)))
    }
}

struct Failing {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Plugin for Failing {
    fn name(&self) -> &str {
        "broken"
    }

    async fn init(&self, _cx: PluginContext) -> BridgeResult<Capability> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Err(BridgeError::Handler("boom".to_string()))
    }
}

/// Requires another plugin by name before finishing
struct Dependent {
    name: &'static str,
    needs: &'static str,
}

#[async_trait]
impl Plugin for Dependent {
    fn name(&self) -> &str {
        self.name
    }

    async fn init(&self, cx: PluginContext) -> BridgeResult<Capability> {
        let _: Arc<Marker> = cx.require(self.needs).await?;
        Ok(Arc::new(Marker(self.name)))
    }
}

#[tokio::test]
async fn test_concurrent_plugin_calls_share_one_init() {
    let (pipeline, _debuggee) = bare_pipeline(echo);
    let runs = Arc::new(AtomicUsize::new(0));
    pipeline.register_plugin(Arc::new(Counted {
        name: "x",
        runs: Arc::clone(&runs),
    }));

    let (a, b) = tokio::join!(
        pipeline.plugin::<Marker>("x"),
        pipeline.plugin::<Marker>("x")
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.0, "x");
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let again = pipeline.plugin::<Marker>("x").await.unwrap();
    assert!(Arc::ptr_eq(&a, &again));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_plugin_is_not_retried_and_fails_dependents() {
    let (pipeline, _debuggee) = bare_pipeline(echo);
    let runs = Arc::new(AtomicUsize::new(0));
    pipeline.register_plugin(Arc::new(Failing {
        runs: Arc::clone(&runs),
    }));
    pipeline.register_plugin(Arc::new(Dependent {
        name: "needs-broken",
        needs: "broken",
    }));
    let mut notices = pipeline.subscribe(Uuid::new_v4());

    match pipeline.plugin::<Marker>("broken").await {
        Err(BridgeError::PluginFailed { name, message }) => {
            assert_eq!(name, "broken");
            assert!(message.contains("boom"));
        }
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("broken plugin resolved"),
    }
    assert!(pipeline.plugin::<Marker>("needs-broken").await.is_err());
    assert!(pipeline.plugin::<Marker>("broken").await.is_err());
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let first = notices.recv().await.unwrap();
    assert_eq!(
        first,
        SessionNotice::PluginFailed {
            name: "broken".to_string(),
            message: "Handler error: boom".to_string(),
        }
    );
    match notices.recv().await.unwrap() {
        SessionNotice::PluginFailed { name, .. } => assert_eq!(name, "needs-broken"),
        other => panic!("unexpected notice {:?}", other),
    }
}

#[tokio::test]
async fn test_dependency_cycle_fails_fast() {
    let (pipeline, _debuggee) = bare_pipeline(echo);
    pipeline.register_plugin(Arc::new(Dependent { name: "a", needs: "b" }));
    pipeline.register_plugin(Arc::new(Dependent { name: "b", needs: "a" }));
    pipeline.register_plugin(Arc::new(Dependent { name: "selfish", needs: "selfish" }));

    let cyclic = tokio::time::timeout(Duration::from_secs(2), pipeline.plugin::<Marker>("a"))
        .await
        .expect("cycle must not deadlock");
    assert!(cyclic.is_err());

    let reentrant =
        tokio::time::timeout(Duration::from_secs(2), pipeline.plugin::<Marker>("selfish"))
            .await
            .expect("self dependency must not deadlock");
    match reentrant {
        Err(BridgeError::PluginFailed { message, .. }) => assert!(message.contains("cycle")),
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("self dependency resolved"),
    }
}

#[tokio::test]
async fn test_unknown_plugin() {
    let (pipeline, _debuggee) = bare_pipeline(echo);
    assert!(matches!(
        pipeline.plugin::<Marker>("missing").await,
        Err(BridgeError::PluginNotFound(_))
    ));
}

#[tokio::test]
async fn test_command_layers_wrap_and_fall_through() {
    let (pipeline, debuggee) = bare_pipeline(echo);
    pipeline.start();
    pipeline.ready().await;

    // Oldest layer delegates to the backend under the same name
    pipeline.register_command("suspend", |params, next| async move {
        let mut body = next.call(params).await?;
        body["inner"] = json!(true);
        Ok(body)
    });
    pipeline.register_command("suspend", |params, next| async move {
        let mut body = next.call(params).await?;
        body["outer"] = json!(true);
        Ok(body)
    });
    // Short-circuits without touching the wire
    pipeline.register_command("Console.enable", |_params, _next| async move { Ok(json!(false)) });

    let body = pipeline.dispatch_command("suspend", json!({})).await.unwrap();
    assert_eq!(body, json!({"command": "suspend", "inner": true, "outer": true}));

    let stub = pipeline.dispatch_command("Console.enable", Value::Null).await.unwrap();
    assert_eq!(stub, json!(false));
    assert_eq!(debuggee.commands(), vec!["suspend"]);
}

#[tokio::test]
async fn test_events_pass_through_or_drop() {
    let (pipeline, debuggee) = bare_pipeline(echo);
    pipeline.register_event("break", |params, _next| async move {
        Ok(Some(inspector_bridge_core::ClientEvent::new(
            "Debugger.paused",
            json!({"reason": "other", "raw": params}),
        )))
    });
    let mut notices = pipeline.subscribe(Uuid::new_v4());
    pipeline.start();
    pipeline.ready().await;

    debuggee.event("touch", json!({}));
    debuggee.event("Custom.thing", json!({"n": 1}));
    debuggee.event("break", json!({"sourceLine": 4}));

    match notices.recv().await.unwrap() {
        SessionNotice::Event(event) => {
            assert_eq!(event.method, "Custom.thing");
            assert_eq!(event.params, json!({"n": 1}));
        }
        other => panic!("unexpected notice {:?}", other),
    }
    match notices.recv().await.unwrap() {
        SessionNotice::Event(event) => {
            assert_eq!(event.method, "Debugger.paused");
            assert_eq!(event.params["raw"]["sourceLine"], 4);
        }
        other => panic!("unexpected notice {:?}", other),
    }
}

#[tokio::test]
async fn test_transaction_excludes_ordinary_requests() {
    let (pipeline, debuggee) = bare_pipeline(echo);
    pipeline.register_plugin(Arc::new(TransactionPlugin));
    pipeline.start();
    pipeline.ready().await;

    let coordinator: Arc<TransactionCoordinator> = pipeline.plugin(TRANSACTION).await.unwrap();
    let (started_tx, started_rx) = oneshot::channel();

    let transaction = tokio::spawn(async move {
        coordinator
            .transaction(|requester| async move {
                use inspector_bridge_core::Requester;
                requester.request("first", json!({})).await?;
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(100)).await;
                requester.request("second", json!({})).await
            })
            .await
    });

    started_rx.await.unwrap();
    let ordinary = pipeline.request("ordinary", json!({})).await.unwrap();
    assert_eq!(ordinary["command"], "ordinary");

    let last = transaction.await.unwrap().unwrap();
    assert_eq!(last["command"], "second");
    assert_eq!(debuggee.commands(), vec!["first", "second", "ordinary"]);
}

#[tokio::test]
async fn test_transaction_waits_for_queued_requests() {
    let (pipeline, debuggee) = bare_pipeline(|request| {
        if request.command == "slow" {
            Reply::Silent
        } else {
            echo(request)
        }
    });
    pipeline.register_plugin(Arc::new(TransactionPlugin));
    pipeline.start();
    pipeline.ready().await;

    let coordinator: Arc<TransactionCoordinator> = pipeline.plugin(TRANSACTION).await.unwrap();

    // Queued before the transaction and never answered
    let slow = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.request("slow", json!({})).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let transaction = tokio::spawn(async move {
        coordinator
            .transaction(|requester| async move {
                use inspector_bridge_core::Requester;
                requester.request("inside", json!({})).await
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(debuggee.commands(), vec!["slow"]);
    assert!(!transaction.is_finished());

    slow.abort();
    transaction.abort();
}

#[tokio::test]
async fn test_settled_requests_leave_no_queue_behind() {
    let (pipeline, _debuggee) = bare_pipeline(|request| {
        if request.command == "slow" {
            Reply::Silent
        } else {
            echo(request)
        }
    });
    pipeline.register_plugin(Arc::new(TransactionPlugin));
    pipeline.start();
    pipeline.ready().await;

    let coordinator: Arc<TransactionCoordinator> = pipeline.plugin(TRANSACTION).await.unwrap();

    for n in 0..200 {
        pipeline.request("tick", json!({ "n": n })).await.unwrap();
    }
    assert_eq!(coordinator.pending_len(), 0);

    // A request abandoned mid-flight is forgotten too
    let slow = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.request("slow", json!({})).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(coordinator.pending_len(), 1);
    slow.abort();
    let _ = slow.await;
    assert_eq!(coordinator.pending_len(), 0);

    // And a later transaction does not wait on it
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        coordinator.transaction(|requester| async move {
            use inspector_bridge_core::Requester;
            requester.request("inside", json!({})).await
        }),
    )
    .await
    .expect("transaction waited on an abandoned request")
    .unwrap();
    assert_eq!(result["command"], "inside");
}
