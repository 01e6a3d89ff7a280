//! Scripted debuggee for tests.
//!
//! [`FakeDebuggee`] is the far end of an in-memory duplex stream. Tests
//! either drive it step by step (read a request, answer it) or hand it a
//! responder function and let it answer on its own.

use crate::backend::{
    BackendConnection, BackendNotice, DebuggeeAddress, LegacyCodec, LegacyEvent, LegacyFrame,
    LegacyMessage, LegacyRequest, LegacyResponse,
};
use crate::agents;
use crate::config::BridgeOptions;
use crate::pipeline::Pipeline;
use crate::scripts::wrap_module;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

pub const HANDSHAKE: &[u8] =
    b"Type: connect\r\nV8-Version: 3.28.71.19\r\nProtocol-Version: 1\r\nEmbedding-Host: node v0.12.7\r\nContent-Length: 0\r\n\r\n";

type Connected = (
    Arc<BackendConnection>,
    mpsc::UnboundedReceiver<BackendNotice>,
    FakeDebuggee,
);

/// Connection wired to a fresh fake debuggee
pub fn connect(options: &BridgeOptions) -> Connected {
    connect_to(DebuggeeAddress::new("fake", 5858), options)
}

/// Like [`connect`], with the connection reporting `address`
pub fn connect_to(address: DebuggeeAddress, options: &BridgeOptions) -> Connected {
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let (connection, notices) = BackendConnection::from_stream(address, ours, options);
    (connection, notices, FakeDebuggee::new(theirs))
}

pub struct FakeDebuggee {
    framed: Framed<DuplexStream, LegacyCodec>,
    seq: u64,
}

impl FakeDebuggee {
    pub fn new(stream: DuplexStream) -> Self {
        FakeDebuggee {
            framed: Framed::new(stream, LegacyCodec::new()),
            seq: 1000,
        }
    }

    pub async fn handshake(&mut self) {
        self.write_raw(HANDSHAKE).await;
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.expect("write to bridge");
        stream.flush().await.expect("flush to bridge");
    }

    /// Next request from the bridge; `None` once the bridge hung up
    pub async fn next_request(&mut self) -> Option<LegacyRequest> {
        while let Some(frame) = self.framed.next().await {
            if let Ok(LegacyFrame::Message(LegacyMessage::Request(request))) = frame {
                return Some(request);
            }
        }
        None
    }

    pub async fn respond(&mut self, request: &LegacyRequest, body: Value) {
        self.send_response(LegacyResponse::ok(request, body)).await;
    }

    pub async fn fail(&mut self, request: &LegacyRequest, message: &str) {
        self.send_response(LegacyResponse::error(request, message)).await;
    }

    pub async fn send_response(&mut self, mut response: LegacyResponse) {
        response.seq = self.next_seq();
        self.send(LegacyMessage::Response(response)).await;
    }

    pub async fn event(&mut self, name: &str, body: Value) {
        let mut event = LegacyEvent::new(name, body);
        event.seq = self.next_seq();
        self.send(LegacyMessage::Event(event)).await;
    }

    pub async fn send(&mut self, message: LegacyMessage) {
        self.framed.send(message).await.expect("send to bridge");
    }

    /// Drop the stream, as a debuggee exiting would
    pub fn hang_up(self) {
        drop(self.framed);
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Answer every request with `responder` from a background task.
    ///
    /// Returns a handle for pushing events and inspecting the request log.
    pub fn spawn<F>(mut self, responder: F) -> Responder
    where
        F: Fn(&LegacyRequest) -> Reply + Send + 'static,
    {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<LegacyMessage>();

        let requests = Arc::clone(&log);
        tokio::spawn(async move {
            self.handshake().await;
            loop {
                tokio::select! {
                    request = self.next_request() => {
                        let Some(request) = request else { break };
                        requests.lock().push(request.clone());
                        match responder(&request) {
                            Reply::Ok(body) => self.respond(&request, body).await,
                            Reply::Running(body, running) => {
                                self.send_response(
                                    LegacyResponse::ok(&request, body).with_running(running),
                                )
                                .await
                            }
                            Reply::Fail(message) => self.fail(&request, &message).await,
                            Reply::Silent => {}
                        }
                    }
                    message = events_rx.recv() => {
                        match message {
                            Some(message) => self.send(message).await,
                            None => break,
                        }
                    }
                }
            }
        });

        Responder { log, events_tx }
    }
}

/// What a spawned fake debuggee answers
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(Value),
    /// Success carrying a `running` flag
    Running(Value, bool),
    Fail(String),
    /// Never answer
    Silent,
}

pub struct Responder {
    log: Arc<Mutex<Vec<LegacyRequest>>>,
    events_tx: mpsc::UnboundedSender<LegacyMessage>,
}

impl Responder {
    pub fn event(&self, name: &str, body: Value) {
        let _ = self
            .events_tx
            .send(LegacyMessage::Event(LegacyEvent::new(name, body)));
    }

    pub fn requests(&self) -> Vec<LegacyRequest> {
        self.log.lock().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().iter().map(|r| r.command.clone()).collect()
    }

    /// Requests with the given command name, in wire order
    pub fn requests_for(&self, command: &str) -> Vec<LegacyRequest> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.command == command)
            .cloned()
            .collect()
    }
}

/// Environment query answer for a paused debuggee
pub fn environment_reply() -> Reply {
    Reply::Running(
        json!({
            "type": "string",
            "value": r#"{"pid":4242,"cwd":"/srv/app","filename":"/srv/app/main.js","nodeVersion":"v0.12.7"}"#
        }),
        false,
    )
}

/// Id of the user script in [`script_list`]
pub const MAIN_SCRIPT_ID: u64 = 41;
pub const MAIN_SCRIPT_PATH: &str = "/srv/app/main.js";
pub const MAIN_SCRIPT_BODY: &str = "console.log('hello');";

/// Body of a legacy `scripts` response: one user script, one internal
pub fn script_list() -> Value {
    json!([
        {
            "id": MAIN_SCRIPT_ID,
            "name": MAIN_SCRIPT_PATH,
            "lineOffset": 0,
            "columnOffset": 0,
            "lineCount": 3,
            "source": wrap_module(MAIN_SCRIPT_BODY),
        },
        {
            "id": 7,
            "name": "events.js",
            "lineOffset": 0,
            "columnOffset": 0,
            "lineCount": 300,
            "source": "// events",
        }
    ])
}

/// Body of a legacy `backtrace` response with a single frame in the main script
pub fn backtrace_body() -> Value {
    json!({
        "fromFrame": 0,
        "toFrame": 1,
        "totalFrames": 1,
        "frames": [{
            "index": 0,
            "func": {"ref": 1, "name": "main", "scriptId": MAIN_SCRIPT_ID},
            "receiver": {"ref": 2, "type": "object", "className": "Object", "text": "#<Object>"},
            "line": 1,
            "column": 2,
            "scopes": [{"type": 1, "index": 0}, {"type": 0, "index": 1}],
        }],
    })
}

/// Answers the requests the default agents make, as a paused debuggee would
pub fn standard_reply(request: &LegacyRequest) -> Reply {
    let args = request.arguments.clone().unwrap_or(Value::Null);
    match request.command.as_str() {
        "evaluate" => environment_reply(),
        "scripts" => {
            let all = script_list();
            match args.get("filter").and_then(Value::as_u64) {
                Some(id) => Reply::Ok(Value::Array(
                    all.as_array()
                        .into_iter()
                        .flatten()
                        .filter(|s| s["id"] == id)
                        .cloned()
                        .collect(),
                )),
                None => Reply::Ok(all),
            }
        }
        "backtrace" => Reply::Ok(backtrace_body()),
        "setbreakpoint" => Reply::Ok(json!({
            "breakpoint": 3,
            "actual_locations": [{
                "script_id": MAIN_SCRIPT_ID,
                "line": args.get("line").cloned().unwrap_or(json!(0)),
                "column": 0,
            }],
        })),
        "listbreakpoints" => Reply::Ok(json!({"breakpoints": [{"number": 3}, {"number": 4}]})),
        "changelive" => Reply::Ok(json!({"result": {"stack_modified": false}})),
        "continue" => Reply::Running(json!({}), true),
        _ => Reply::Ok(json!({})),
    }
}

/// Ready pipeline with the default agents over a spawned fake debuggee
pub async fn bridge<F>(options: BridgeOptions, responder: F) -> (Arc<Pipeline>, Responder)
where
    F: Fn(&LegacyRequest) -> Reply + Send + 'static,
{
    let (connection, notices, debuggee) = connect(&options);
    let responder = debuggee.spawn(responder);
    let pipeline = Pipeline::new(connection, notices, options);
    agents::install_defaults(&pipeline);
    pipeline.start();
    pipeline.ready().await;
    (pipeline, responder)
}
