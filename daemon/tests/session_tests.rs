//! Session and registry tests over fake debuggees
//!
//! Sessions are driven through their channels, the same way the websocket
//! transport drives them.

use async_trait::async_trait;
use inspector_bridge_core::testing::{self, Responder};
use inspector_bridge_core::{
    BackendConnection, BackendNotice, BridgeError, BridgeOptions, BridgeResult, DebuggeeAddress,
};
use inspector_bridge_daemon::{
    BackendConnector, FrontendSession, OutboundFrame, SessionEnd, SessionRegistry,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Wires every connect to a fresh fake debuggee with the standard replies
#[derive(Default)]
struct FakeConnector {
    responders: Mutex<Vec<Responder>>,
    connects: AtomicUsize,
    /// Address the connection reports instead of the requested one, as
    /// after name resolution
    resolved: Option<DebuggeeAddress>,
    /// Connects to this host wait until released
    stalled_host: Option<String>,
    release: tokio::sync::Notify,
}

impl FakeConnector {
    fn take_responder(&self) -> Responder {
        self.responders.lock().remove(0)
    }
}

#[async_trait]
impl BackendConnector for FakeConnector {
    async fn connect(
        &self,
        address: &DebuggeeAddress,
        options: &BridgeOptions,
    ) -> BridgeResult<(Arc<BackendConnection>, mpsc::UnboundedReceiver<BackendNotice>)> {
        if self.stalled_host.as_deref() == Some(address.host.as_str()) {
            self.release.notified().await;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let reported = self.resolved.clone().unwrap_or_else(|| address.clone());
        let (connection, notices, debuggee) = testing::connect_to(reported, options);
        self.responders
            .lock()
            .push(debuggee.spawn(testing::standard_reply));
        Ok((connection, notices))
    }
}

struct Refusing;

#[async_trait]
impl BackendConnector for Refusing {
    async fn connect(
        &self,
        address: &DebuggeeAddress,
        _options: &BridgeOptions,
    ) -> BridgeResult<(Arc<BackendConnection>, mpsc::UnboundedReceiver<BackendNotice>)> {
        Err(BridgeError::ConnectionFailed(format!("{}: connection refused", address)))
    }
}

fn options() -> BridgeOptions {
    BridgeOptions {
        close_grace_ms: 50,
        ..BridgeOptions::default()
    }
}

fn address() -> DebuggeeAddress {
    DebuggeeAddress::new("127.0.0.1", 5858)
}

/// Client end of a running session
struct Client {
    inbound: mpsc::UnboundedSender<String>,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    session: tokio::task::JoinHandle<SessionEnd>,
}

impl Client {
    fn send(&self, message: Value) {
        self.inbound.send(message.to_string()).unwrap();
    }

    /// Next frame, decoded; `None` for a close frame
    async fn next(&mut self) -> Option<Value> {
        let frame = tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
            .await
            .expect("session went quiet")
            .expect("session dropped its outbound channel");
        match frame {
            OutboundFrame::Text(text) => Some(serde_json::from_str(&text).unwrap()),
            OutboundFrame::Close => None,
        }
    }

    /// Frames up to and including the reply to `id`
    async fn until_reply(&mut self, id: u64) -> Vec<Value> {
        let mut frames = Vec::new();
        loop {
            let frame = self.next().await.expect("closed before reply");
            let done = frame["id"] == id;
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    async fn quiet(&mut self) -> bool {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.outbound.try_recv().is_err()
    }
}

async fn open_session(registry: &SessionRegistry) -> Client {
    let pipeline = registry.attach(&address()).await.unwrap();
    pipeline.ready().await;

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let session = FrontendSession::new(pipeline, outbound_tx);
    let session = tokio::spawn(session.run(inbound_rx));
    // Let the session subscribe before anything is emitted
    tokio::time::sleep(Duration::from_millis(20)).await;

    Client {
        inbound: inbound_tx,
        outbound: outbound_rx,
        session,
    }
}

#[tokio::test]
async fn test_events_wait_for_domain_enable() {
    let connector = Arc::new(FakeConnector::default());
    let registry = SessionRegistry::new(options(), connector.clone());
    let mut client = open_session(&registry).await;
    let debuggee = connector.take_responder();

    for n in 1..=3 {
        debuggee.event("Profiler.consoleProfileStarted", json!({ "n": n }));
    }
    assert!(client.quiet().await, "events leaked before Profiler.enable");

    client.send(json!({"id": 1, "method": "Profiler.enable"}));
    let frames = client.until_reply(1).await;

    let order: Vec<u64> = frames
        .iter()
        .filter(|f| f["method"] == "Profiler.consoleProfileStarted")
        .map(|f| f["params"]["n"].as_u64().unwrap())
        .collect();
    assert_eq!(order, vec![1, 2, 3]);

    debuggee.event("Profiler.consoleProfileStarted", json!({"n": 4}));
    let live = client.next().await.unwrap();
    assert_eq!(live["params"]["n"], 4);
}

#[tokio::test]
async fn test_void_and_failed_commands_always_reply() {
    let connector = Arc::new(FakeConnector::default());
    let registry = SessionRegistry::new(options(), connector.clone());
    let mut client = open_session(&registry).await;

    client.send(json!({
        "id": 7,
        "method": "Debugger.setSkipAllPauses",
        "params": {"skipped": true}
    }));
    let frames = client.until_reply(7).await;
    assert_eq!(frames.last().unwrap()["result"], json!({}));

    client.send(json!({
        "id": 8,
        "method": "Debugger.setBreakpointByUrl",
        "params": {"urlRegex": "main.*", "lineNumber": 3}
    }));
    let frames = client.until_reply(8).await;
    let error = &frames.last().unwrap()["error"];
    assert!(error["message"].as_str().unwrap().contains("regex"));

    // The failure is also logged, once Console is enabled
    client.send(json!({"id": 9, "method": "Console.enable"}));
    let frames = client.until_reply(9).await;
    let logged: Vec<&Value> = frames
        .iter()
        .filter(|f| f["method"] == "Console.messageAdded")
        .collect();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0]["params"]["message"]["level"], "error");
    assert!(logged[0]["params"]["message"]["text"]
        .as_str()
        .unwrap()
        .contains("Debugger.setBreakpointByUrl"));
}

#[tokio::test]
async fn test_undecodable_message_gets_error_reply() {
    let connector = Arc::new(FakeConnector::default());
    let registry = SessionRegistry::new(options(), connector.clone());
    let mut client = open_session(&registry).await;

    client.inbound.send(r#"{"id": 12, "params": {}}"#.to_string()).unwrap();
    let reply = client.next().await.unwrap();
    assert_eq!(reply["id"], 12);
    assert!(reply.get("error").is_some());

    // No id to answer; only logged
    client.inbound.send("not json".to_string()).unwrap();
    assert!(client.quiet().await);
}

#[tokio::test]
async fn test_script_parsed_announced_once_per_session() {
    let connector = Arc::new(FakeConnector::default());
    let registry = SessionRegistry::new(options(), connector.clone());
    let mut client = open_session(&registry).await;

    client.send(json!({"id": 1, "method": "Debugger.enable"}));
    let mut frames = client.until_reply(1).await;
    client.send(json!({"id": 2, "method": "Debugger.enable"}));
    frames.extend(client.until_reply(2).await);

    let mut ids: Vec<String> = frames
        .iter()
        .filter(|f| f["method"] == "Debugger.scriptParsed")
        .map(|f| f["params"]["scriptId"].as_str().unwrap().to_string())
        .collect();
    assert!(ids.contains(&testing::MAIN_SCRIPT_ID.to_string()));
    let announced = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), announced);
}

#[tokio::test]
async fn test_backend_close_detaches_session_and_clears_registry() {
    let connector = Arc::new(FakeConnector::default());
    let registry = SessionRegistry::new(options(), connector.clone());
    let mut client = open_session(&registry).await;
    assert_eq!(registry.session_count(&address()).await, 1);

    // Dropping the responder ends the fake debuggee
    drop(connector.take_responder());

    let detached = client.next().await.unwrap();
    assert_eq!(detached["method"], "Inspector.detached");
    assert!(client.next().await.is_none());
    assert!(matches!(
        client.session.await.unwrap(),
        SessionEnd::BackendClosed(_)
    ));

    for _ in 0..50 {
        if registry.addresses().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(registry.addresses().await.is_empty());
}

#[tokio::test]
async fn test_sessions_share_backend_until_last_detach() {
    let connector = Arc::new(FakeConnector::default());
    let registry = SessionRegistry::new(options(), connector.clone());

    let first = registry.attach(&address()).await.unwrap();
    let second = registry.attach(&address()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    assert_eq!(registry.session_count(&address()).await, 2);

    registry.detach(&address(), &first).await;
    assert!(!first.backend().is_closed());
    assert_eq!(registry.session_count(&address()).await, 1);

    registry.detach(&address(), &second).await;
    assert!(second.backend().is_closed());
    assert!(registry.addresses().await.is_empty());

    let debuggee = connector.take_responder();
    assert!(debuggee.commands().contains(&"disconnect".to_string()));

    // A fresh attach opens a new backend
    let third = registry.attach(&address()).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_client_disconnect_releases_backend() {
    let connector = Arc::new(FakeConnector::default());
    let registry = Arc::new(SessionRegistry::new(options(), connector.clone()));

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
    let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
    let serving = tokio::spawn({
        let registry = Arc::clone(&registry);
        async move { registry.serve(&address(), inbound_rx, outbound_tx).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.session_count(&address()).await, 1);

    drop(inbound_tx);
    assert_eq!(serving.await.unwrap(), SessionEnd::ClientGone);
    assert!(registry.addresses().await.is_empty());
}

#[tokio::test]
async fn test_connect_failure_is_reported_to_client() {
    let registry = SessionRegistry::new(options(), Arc::new(Refusing));
    let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

    let end = registry.serve(&address(), inbound_rx, outbound_tx).await;
    assert!(matches!(end, SessionEnd::BackendClosed(_)));

    match outbound_rx.recv().await.unwrap() {
        OutboundFrame::Text(text) => {
            let event: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(event["method"], "Inspector.detached");
            assert!(event["params"]["reason"]
                .as_str()
                .unwrap()
                .contains("connection refused"));
        }
        other => panic!("unexpected frame {:?}", other),
    }
    assert_eq!(outbound_rx.recv().await.unwrap(), OutboundFrame::Close);
    assert!(registry.addresses().await.is_empty());
}

#[tokio::test]
async fn test_entries_follow_requested_address() {
    let connector = Arc::new(FakeConnector {
        resolved: Some(DebuggeeAddress::new("10.1.2.3", 5858)),
        ..FakeConnector::default()
    });
    let registry = Arc::new(SessionRegistry::new(options(), connector.clone()));
    let requested = DebuggeeAddress::new("debuggee.local", 5858);

    let first = registry.attach(&requested).await.unwrap();
    let second = registry.attach(&requested).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_ne!(first.backend().address(), &requested);
    assert_eq!(registry.session_count(&requested).await, 2);

    registry.detach(&requested, &first).await;
    assert_eq!(registry.session_count(&requested).await, 1);
    registry.detach(&requested, &second).await;
    assert!(second.backend().is_closed());
    assert!(registry.addresses().await.is_empty());

    // Served sessions release their entry the same way
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
    let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
    let serving = tokio::spawn({
        let registry = Arc::clone(&registry);
        let requested = requested.clone();
        async move { registry.serve(&requested, inbound_rx, outbound_tx).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.session_count(&requested).await, 1);
    drop(inbound_tx);
    assert_eq!(serving.await.unwrap(), SessionEnd::ClientGone);
    assert!(registry.addresses().await.is_empty());
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_slow_connect_does_not_block_other_debuggees() {
    let connector = Arc::new(FakeConnector {
        stalled_host: Some("stalled".to_string()),
        ..FakeConnector::default()
    });
    let registry = Arc::new(SessionRegistry::new(options(), connector.clone()));
    let stalled = DebuggeeAddress::new("stalled", 5858);

    let waiting = tokio::spawn({
        let registry = Arc::clone(&registry);
        let stalled = stalled.clone();
        async move { registry.attach(&stalled).await }
    });
    let joining = tokio::spawn({
        let registry = Arc::clone(&registry);
        let stalled = stalled.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry.attach(&stalled).await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let other = tokio::time::timeout(Duration::from_secs(1), registry.attach(&address()))
        .await
        .expect("attach waited on another debuggee's connect")
        .unwrap();
    assert!(!other.backend().is_closed());
    assert_eq!(registry.session_count(&address()).await, 1);
    assert!(!waiting.is_finished());

    connector.release.notify_one();
    let first = waiting.await.unwrap().unwrap();
    let second = joining.await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.session_count(&stalled).await, 2);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
}
