//! Connection to one debuggee over the legacy protocol.

use super::codec::{LegacyCodec, LegacyFrame};
use super::message::{LegacyEvent, LegacyMessage, LegacyRequest, LegacyResponse};
use super::Requester;
use crate::config::BridgeOptions;
use crate::errors::{BridgeError, BridgeResult};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Host and port of a debuggee's debug listener
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DebuggeeAddress {
    pub host: String,
    pub port: u16,
}

impl DebuggeeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        DebuggeeAddress {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for DebuggeeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Lifecycle of a backend connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Stream is open, handshake not seen yet
    Connected,
    /// First frame received; requests flow
    Ready,
    Closed,
}

/// Raw traffic surfaced to whoever drives the pipeline
#[derive(Debug, Clone)]
pub enum BackendNotice {
    Event(LegacyEvent),
    /// A frame no pending request claimed
    Unhandled(LegacyMessage),
    /// A malformed frame; the stream is still usable
    ProtocolError(String),
    /// The connection is gone; always the last notice
    Closed(String),
}

enum WriterCommand {
    Frame(LegacyRequest),
    Shutdown,
}

type PendingMap = HashMap<u64, oneshot::Sender<BridgeResult<Value>>>;

struct RequestTable {
    next_seq: u64,
    pending: PendingMap,
    closed: bool,
}

/// Connection to a debuggee.
///
/// Requests are correlated by sequence number, so responses may arrive in
/// any order. Frames queued before the handshake are flushed in call order
/// once the connection is ready.
pub struct BackendConnection {
    address: DebuggeeAddress,
    table: Mutex<RequestTable>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    notice_tx: mpsc::UnboundedSender<BackendNotice>,
    state_tx: watch::Sender<ConnectionState>,
    running: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    close_grace: Duration,
}

impl BackendConnection {
    /// Connect to a debuggee over TCP.
    pub async fn connect(
        address: DebuggeeAddress,
        options: &BridgeOptions,
    ) -> BridgeResult<(Arc<Self>, mpsc::UnboundedReceiver<BackendNotice>)> {
        info!("Connecting to debuggee at {}", address);

        let stream = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(|e| BridgeError::ConnectionFailed(format!("{}: {}", address, e)))?;

        Ok(Self::from_stream(address, stream, options))
    }

    /// Drive an already-open byte stream.
    ///
    /// Must be called inside a tokio runtime; spawns the read and write loops.
    pub fn from_stream<S>(
        address: DebuggeeAddress,
        stream: S,
        options: &BridgeOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<BackendNotice>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, mut frames) = Framed::new(stream, LegacyCodec::new()).split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Connected);

        let connection = Arc::new(Self {
            address,
            table: Mutex::new(RequestTable {
                next_seq: 1,
                pending: HashMap::new(),
                closed: false,
            }),
            writer_tx,
            notice_tx,
            state_tx,
            running: AtomicBool::new(true),
            reader: Mutex::new(None),
            close_grace: options.close_grace(),
        });

        // Write loop
        let conn = Arc::clone(&connection);
        tokio::spawn(async move {
            conn.write_loop(sink, writer_rx).await;
        });

        // Read loop
        let exit = ReaderExit(Arc::clone(&connection));
        let reader = tokio::spawn(async move {
            let conn = &exit.0;
            while let Some(result) = frames.next().await {
                match result {
                    Ok(frame) => conn.handle_frame(frame),
                    Err(e) => {
                        error!("Read error from {}: {}", conn.address, e);
                        conn.teardown(format!("read error: {}", e));
                        return;
                    }
                }
            }
            info!("Debuggee {} closed the connection", conn.address);
            conn.teardown("debuggee closed the connection".to_string());
        });
        *connection.reader.lock() = Some(reader);

        (connection, notice_rx)
    }

    async fn write_loop<W>(
        self: Arc<Self>,
        mut sink: W,
        mut writer_rx: mpsc::UnboundedReceiver<WriterCommand>,
    ) where
        W: futures::Sink<LegacyMessage, Error = std::io::Error> + Unpin,
    {
        let mut state_rx = self.state_tx.subscribe();
        let state = state_rx
            .wait_for(|s| *s != ConnectionState::Connected)
            .await
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed);
        if state == ConnectionState::Closed {
            return;
        }

        while let Some(command) = writer_rx.recv().await {
            match command {
                WriterCommand::Frame(request) => {
                    debug!("-> {} #{} {}", self.address, request.seq, request.command);
                    if let Err(e) = sink.send(LegacyMessage::Request(request)).await {
                        error!("Write error to {}: {}", self.address, e);
                        self.teardown(format!("write error: {}", e));
                        break;
                    }
                }
                WriterCommand::Shutdown => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    }

    fn handle_frame(&self, frame: LegacyFrame) {
        self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Ready;
                true
            } else {
                false
            }
        });

        match frame {
            LegacyFrame::Handshake(headers) => {
                let version = headers.get("V8-Version").unwrap_or("unknown");
                info!("Handshake from {} (runtime {})", self.address, version);
            }
            LegacyFrame::Malformed(reason) => {
                warn!("Malformed frame from {}: {}", self.address, reason);
                let _ = self.notice_tx.send(BackendNotice::ProtocolError(reason));
            }
            LegacyFrame::Message(message) => {
                if let Some(running) = message.running() {
                    self.running.store(running, Ordering::SeqCst);
                }
                match message {
                    LegacyMessage::Response(response) => self.settle(response),
                    LegacyMessage::Event(event) => {
                        if event.is_pause() {
                            self.running.store(false, Ordering::SeqCst);
                        }
                        let _ = self.notice_tx.send(BackendNotice::Event(event));
                    }
                    other => {
                        debug!("Unhandled message from {}: {:?}", self.address, other);
                        let _ = self.notice_tx.send(BackendNotice::Unhandled(other));
                    }
                }
            }
        }
    }

    fn settle(&self, response: LegacyResponse) {
        let sender = self.table.lock().pending.remove(&response.request_seq);
        let Some(sender) = sender else {
            debug!(
                "Unhandled response from {} for #{}",
                self.address, response.request_seq
            );
            let _ = self
                .notice_tx
                .send(BackendNotice::Unhandled(LegacyMessage::Response(response)));
            return;
        };

        let result = if response.success {
            Ok(response.into_body())
        } else {
            Err(BridgeError::command(response.message.clone(), response.body))
        };
        let _ = sender.send(result);
    }

    /// Reject everything pending and move to `Closed`. Idempotent.
    fn teardown(&self, reason: String) {
        let drained = {
            let mut table = self.table.lock();
            if table.closed {
                return;
            }
            table.closed = true;
            std::mem::take(&mut table.pending)
        };

        if !drained.is_empty() {
            warn!(
                "Rejecting {} pending request(s) to {}: {}",
                drained.len(),
                self.address,
                reason
            );
        }
        for (_, sender) in drained {
            let _ = sender.send(Err(BridgeError::ConnectionClosed));
        }

        self.state_tx.send_replace(ConnectionState::Closed);
        let _ = self.writer_tx.send(WriterCommand::Shutdown);
        let _ = self.notice_tx.send(BackendNotice::Closed(reason));
    }

    /// Send a request and wait for its response body.
    ///
    /// Object arguments get `maxStringLength: -1` unless they set it, so
    /// string results are not truncated by the debuggee.
    pub async fn request(&self, command: &str, args: Value) -> BridgeResult<Value> {
        let receiver = {
            let mut table = self.table.lock();
            if table.closed {
                return Err(BridgeError::ConnectionClosed);
            }

            let seq = table.next_seq;
            table.next_seq += 1;

            let request = LegacyRequest {
                seq,
                command: command.to_string(),
                arguments: with_unbounded_strings(args),
            };
            let (tx, rx) = oneshot::channel();
            table.pending.insert(seq, tx);

            if self.writer_tx.send(WriterCommand::Frame(request)).is_err() {
                table.pending.remove(&seq);
                return Err(BridgeError::ConnectionClosed);
            }
            rx
        };

        receiver.await.map_err(|_| BridgeError::ConnectionClosed)?
    }

    /// Politely disconnect, then close the stream. Never fails.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        info!("Closing connection to {}", self.address);

        if tokio::time::timeout(self.close_grace, self.request("disconnect", Value::Null))
            .await
            .is_err()
        {
            debug!("Polite disconnect from {} timed out", self.address);
        }

        self.teardown("closed by bridge".to_string());
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    pub fn address(&self) -> &DebuggeeAddress {
        &self.address
    }

    /// Last known running flag
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.table.lock().pending.len()
    }

    /// Resolves once the first frame has arrived.
    pub async fn ready(&self) -> BridgeResult<()> {
        let mut state_rx = self.state_tx.subscribe();
        let state = state_rx
            .wait_for(|s| *s != ConnectionState::Connected)
            .await
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed);
        if state == ConnectionState::Ready {
            Ok(())
        } else {
            Err(BridgeError::ConnectionClosed)
        }
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut state_rx = self.state_tx.subscribe();
        let _ = state_rx
            .wait_for(|s| *s == ConnectionState::Closed)
            .await;
    }
}

/// Tears the connection down however the read loop ends, panics and
/// aborts included
struct ReaderExit(Arc<BackendConnection>);

impl Drop for ReaderExit {
    fn drop(&mut self) {
        self.0.teardown("read loop stopped".to_string());
    }
}

#[async_trait]
impl Requester for BackendConnection {
    async fn request(&self, command: &str, args: Value) -> BridgeResult<Value> {
        BackendConnection::request(self, command, args).await
    }
}

fn with_unbounded_strings(args: Value) -> Option<Value> {
    match args {
        Value::Null => None,
        Value::Object(mut map) => {
            map.entry("maxStringLength").or_insert(Value::from(-1));
            Some(Value::Object(map))
        }
        other => Some(other),
    }
}
