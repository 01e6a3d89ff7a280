/// Websocket front door: accepts clients and hands each one to the registry
use crate::config::DaemonConfig;
use crate::errors::{DaemonError, DaemonResult};
use crate::registry::{BackendConnector, SessionRegistry, TcpConnector};
use crate::session::OutboundFrame;
use futures::{SinkExt, StreamExt};
use inspector_bridge_core::DebuggeeAddress;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

/// Debuggee named by a websocket URL query.
///
/// Accepts `?host=H&port=P` or `?ws=H:P`, percent-encoded or not. IPv6
/// hosts may be bracketed. Anything missing falls back to `default`.
pub fn debuggee_from_query(query: Option<&str>, default: &DebuggeeAddress) -> DebuggeeAddress {
    let mut address = default.clone();
    let Some(query) = query else {
        return address;
    };

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "host" if !value.is_empty() => address.host = bare_host(&value),
            "port" => {
                if let Ok(port) = value.parse() {
                    address.port = port;
                }
            }
            "ws" => {
                // A bare IPv6 host has colons but no port
                let split = match value.rsplit_once(':') {
                    Some((host, _)) if host.contains(':') && !host.ends_with(']') => None,
                    other => other,
                };
                if let Some((host, port)) = split {
                    if !host.is_empty() {
                        address.host = bare_host(host);
                    }
                    if let Ok(port) = port.parse() {
                        address.port = port;
                    }
                } else if !value.is_empty() {
                    address.host = bare_host(&value);
                }
            }
            _ => {}
        }
    }
    address
}

fn bare_host(host: &str) -> String {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_string()
}

pub struct BridgeServer {
    config: DaemonConfig,
    registry: Arc<SessionRegistry>,
}

impl BridgeServer {
    pub fn new(config: DaemonConfig) -> DaemonResult<Self> {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    pub fn with_connector(
        config: DaemonConfig,
        connector: Arc<dyn BackendConnector>,
    ) -> DaemonResult<Self> {
        config.validate()?;
        let registry = Arc::new(SessionRegistry::new(config.bridge.clone(), connector));
        Ok(BridgeServer { config, registry })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bind the configured address and serve until the task is dropped
    pub async fn run(&self) -> DaemonResult<()> {
        let listener = TcpListener::bind(self.config.server.bind_addr())
            .await
            .map_err(|e| {
                DaemonError::ServerError(format!(
                    "Failed to bind {}: {}",
                    self.config.server.bind_addr(),
                    e
                ))
            })?;
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener
    pub async fn serve(&self, listener: TcpListener) -> DaemonResult<()> {
        info!("Bridge listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            let registry = Arc::clone(&self.registry);
            let default = self.config.debuggee.address();
            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, peer, registry, default).await {
                    warn!("Client {} ended with error: {}", peer, e);
                }
            });
        }
    }

    /// Close every backend connection
    pub async fn shutdown(&self) {
        info!("Closing all backend connections");
        self.registry.close_all().await;
    }
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<SessionRegistry>,
    default: DebuggeeAddress,
) -> DaemonResult<()> {
    let mut query = None;
    let callback = |request: &Request, response: Response| {
        query = request.uri().query().map(str::to_string);
        Ok::<_, ErrorResponse>(response)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let address = debuggee_from_query(query.as_deref(), &default);
    info!("Client {} connected for debuggee {}", peer, address);

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let message = match frame {
                OutboundFrame::Text(text) => WsMessage::Text(text),
                OutboundFrame::Close => {
                    let _ = ws_sink.send(WsMessage::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = ws_sink.send(message).await {
                error!("Failed to write to client: {}", e);
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = ws_stream.next().await {
            match message {
                Ok(WsMessage::Text(text)) => {
                    if inbound_tx.send(text).is_err() {
                        break;
                    }
                }
                Ok(WsMessage::Close(_)) => {
                    debug!("Client {} closed the websocket", peer);
                    break;
                }
                // tungstenite answers pings on its own
                Ok(_) => {}
                Err(e) => {
                    warn!("Websocket error from {}: {}", peer, e);
                    break;
                }
            }
        }
    });

    let end = registry.serve(&address, inbound_rx, outbound_tx).await;
    debug!("Session for {} ended: {:?}", peer, end);

    reader.abort();
    let _ = writer.await;
    info!("Client {} disconnected", peer);
    Ok(())
}
