//! One client's view of a shared pipeline.
//!
//! A session reads client text messages, dispatches them as commands through
//! the pipeline and writes replies. Events the pipeline broadcasts are held
//! per domain until the client sends that domain's `enable`.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use inspector_bridge_core::agents::notify::{console_message, LogLevel};
use inspector_bridge_core::{
    BridgeError, BridgeResult, ClientCommand, ClientEvent, Domain, ModernCodec, Pipeline,
    ServerMessage, SessionNotice,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a session hands to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// Why a session stopped
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    /// Inbound stream ended or the transport went away
    ClientGone,
    /// Backend closed; the client was told and the close frame queued
    BackendClosed(String),
}

/// Per-domain event hold.
///
/// Domains start disarmed. Events for a disarmed domain queue up and are
/// released in arrival order when the domain is armed.
#[derive(Debug, Default)]
pub struct DomainGate {
    armed: HashSet<Domain>,
    held: HashMap<Domain, VecDeque<ClientEvent>>,
}

impl DomainGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass `event` through if its domain is armed, otherwise hold it
    pub fn offer(&mut self, event: ClientEvent) -> Option<ClientEvent> {
        let domain = event.domain();
        if self.armed.contains(&domain) {
            Some(event)
        } else {
            self.held.entry(domain).or_default().push_back(event);
            None
        }
    }

    /// Arm `domain` and return whatever was held for it
    pub fn arm(&mut self, domain: Domain) -> Vec<ClientEvent> {
        let released = self
            .held
            .remove(&domain)
            .map(Vec::from)
            .unwrap_or_default();
        self.armed.insert(domain);
        released
    }

    pub fn is_armed(&self, domain: &Domain) -> bool {
        self.armed.contains(domain)
    }

    pub fn held_count(&self) -> usize {
        self.held.values().map(VecDeque::len).sum()
    }
}

type Call = BoxFuture<'static, (u64, String, BridgeResult<Value>)>;
type InFlight = FuturesUnordered<Call>;

pub struct FrontendSession {
    id: Uuid,
    pipeline: Arc<Pipeline>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    gate: DomainGate,
    announced_scripts: HashSet<String>,
}

impl FrontendSession {
    pub fn new(pipeline: Arc<Pipeline>, outbound: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        FrontendSession {
            id: Uuid::new_v4(),
            pipeline,
            outbound,
            gate: DomainGate::new(),
            announced_scripts: HashSet::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Serve the client until either side goes away.
    ///
    /// Commands run concurrently; each reply is written when its command
    /// settles.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<String>) -> SessionEnd {
        let mut notices = self.pipeline.subscribe(self.id);
        let mut in_flight = InFlight::new();
        info!("Session {} attached to {}", self.id, self.pipeline.backend().address());

        let end = loop {
            // Events a command emitted reach the client before its reply
            tokio::select! {
                biased;
                notice = notices.recv() => {
                    match notice {
                        Some(SessionNotice::BackendClosed(reason)) => {
                            self.detach(&reason);
                            break SessionEnd::BackendClosed(reason);
                        }
                        Some(notice) => self.on_notice(notice),
                        None => {
                            let reason = "backend closed".to_string();
                            self.detach(&reason);
                            break SessionEnd::BackendClosed(reason);
                        }
                    }
                }
                message = inbound.recv() => {
                    match message {
                        Some(text) => {
                            if let Some(call) = self.on_message(&text) {
                                in_flight.push(call);
                            }
                        }
                        None => break SessionEnd::ClientGone,
                    }
                }
                Some((id, method, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    self.on_reply(id, &method, result);
                }
            }
            if self.outbound.is_closed() {
                break SessionEnd::ClientGone;
            }
        };

        self.pipeline.unsubscribe(self.id);
        debug!(
            "Session {} ended with {} held events discarded",
            self.id,
            self.gate.held_count()
        );
        end
    }

    fn on_message(&mut self, text: &str) -> Option<Call> {
        let command: ClientCommand = match ModernCodec::decode(text) {
            Ok(command) => command,
            Err(e) => {
                warn!("Session {} sent an undecodable message: {}", self.id, e);
                match ModernCodec::recover_id(text) {
                    Some(id) => self.send(&ServerMessage::reply(id, Err(e))),
                    None => self.log(LogLevel::Error, &e.to_string()),
                }
                return None;
            }
        };

        if let Some(domain) = command.enabled_domain() {
            for event in self.gate.arm(domain) {
                self.send(&ServerMessage::Event(event));
            }
        }

        let pipeline = Arc::clone(&self.pipeline);
        Some(Box::pin(async move {
            let result = pipeline
                .dispatch_command(&command.method, command.params)
                .await;
            (command.id, command.method, result)
        }))
    }

    fn on_reply(&mut self, id: u64, method: &str, result: BridgeResult<Value>) {
        if let Err(e) = &result {
            debug!("Command {} ({}) failed: {}", id, method, e);
            let text = format!("{} failed: {}", method, e);
            self.send(&ServerMessage::reply(id, result));
            self.log(LogLevel::Error, &text);
        } else {
            self.send(&ServerMessage::reply(id, result));
        }
    }

    fn on_notice(&mut self, notice: SessionNotice) {
        match notice {
            SessionNotice::Event(event) => self.deliver(event),
            SessionNotice::BackendError(reason) => {
                self.log(LogLevel::Error, &format!("Debugger protocol error: {}", reason));
            }
            SessionNotice::PluginFailed { name, message } => {
                self.log(
                    LogLevel::Error,
                    &format!("Agent {} failed to start: {}", name, message),
                );
            }
            SessionNotice::HandlerFailed { event, message } => {
                self.log(
                    LogLevel::Error,
                    &format!("Handling {} failed: {}", event, message),
                );
            }
            SessionNotice::BackendClosed(reason) => self.detach(&reason),
        }
    }

    fn deliver(&mut self, event: ClientEvent) {
        if event.method == "Debugger.scriptParsed" {
            let script_id = match &event.params["scriptId"] {
                Value::String(id) => id.clone(),
                other => other.to_string(),
            };
            if !self.announced_scripts.insert(script_id) {
                return;
            }
        }
        if let Some(event) = self.gate.offer(event) {
            self.send(&ServerMessage::Event(event));
        }
    }

    fn log(&mut self, level: LogLevel, text: &str) {
        self.deliver(ClientEvent::new(
            "Console.messageAdded",
            console_message(level, text),
        ));
    }

    /// Tell the client the backend is gone and close the transport
    fn detach(&mut self, reason: &str) {
        info!("Session {} detached: {}", self.id, reason);
        self.send(&ServerMessage::Event(detached_event(reason)));
        let _ = self.outbound.send(OutboundFrame::Close);
    }

    fn send(&self, message: &ServerMessage) {
        match ModernCodec::encode(message) {
            Ok(text) => {
                let _ = self.outbound.send(OutboundFrame::Text(text));
            }
            Err(e) => warn!("Dropping unencodable message for session {}: {}", self.id, e),
        }
    }
}

/// `Inspector.detached`; delivered regardless of which domains are armed
pub fn detached_event(reason: &str) -> ClientEvent {
    ClientEvent::new("Inspector.detached", json!({"reason": reason}))
}

/// Frames a session writes when it cannot attach at all
pub fn refusal(error: &BridgeError) -> Vec<OutboundFrame> {
    let event = ServerMessage::Event(detached_event(&error.to_string()));
    let mut frames = Vec::new();
    if let Ok(text) = ModernCodec::encode(&event) {
        frames.push(OutboundFrame::Text(text));
    }
    frames.push(OutboundFrame::Close);
    frames
}
