//! Shared backends keyed by debuggee address.
//!
//! Every client naming the same debuggee shares one connection and one
//! pipeline. Entries are keyed by the address the client asked for, which
//! may differ from what the connection reports. An entry is reference
//! counted by attached sessions and dropped when its stream closes or the
//! last session leaves.

use crate::errors::{DaemonError, DaemonResult};
use crate::session::{refusal, FrontendSession, OutboundFrame, SessionEnd};
use async_trait::async_trait;
use inspector_bridge_core::{
    agents, BackendConnection, BackendNotice, BridgeError, BridgeOptions, BridgeResult,
    DebuggeeAddress, Pipeline,
};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Opens the byte stream to a debuggee
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(
        &self,
        address: &DebuggeeAddress,
        options: &BridgeOptions,
    ) -> BridgeResult<(Arc<BackendConnection>, mpsc::UnboundedReceiver<BackendNotice>)>;
}

/// Plain TCP to the debug port
pub struct TcpConnector;

#[async_trait]
impl BackendConnector for TcpConnector {
    async fn connect(
        &self,
        address: &DebuggeeAddress,
        options: &BridgeOptions,
    ) -> BridgeResult<(Arc<BackendConnection>, mpsc::UnboundedReceiver<BackendNotice>)> {
        BackendConnection::connect(address.clone(), options).await
    }
}

struct Entry {
    pipeline: Arc<Pipeline>,
    sessions: usize,
}

/// One debuggee's entry; locked across its connect so concurrent attaches
/// to the same address share one backend
type Slot = Arc<Mutex<Option<Entry>>>;

/// Slots by the address clients asked for. Never held across an await.
type Slots = Arc<SyncMutex<HashMap<DebuggeeAddress, Slot>>>;

pub struct SessionRegistry {
    options: BridgeOptions,
    connector: Arc<dyn BackendConnector>,
    slots: Slots,
}

impl SessionRegistry {
    pub fn new(options: BridgeOptions, connector: Arc<dyn BackendConnector>) -> Self {
        SessionRegistry {
            options,
            connector,
            slots: Arc::new(SyncMutex::new(HashMap::new())),
        }
    }

    fn slot(&self, address: &DebuggeeAddress) -> Slot {
        Arc::clone(self.slots.lock().entry(address.clone()).or_default())
    }

    fn current(&self, address: &DebuggeeAddress) -> Option<Slot> {
        self.slots.lock().get(address).cloned()
    }

    /// Forget `slot` if it is still the one registered for `address`.
    /// Call with the slot's lock held and its entry taken.
    fn release(slots: &Slots, address: &DebuggeeAddress, slot: &Slot) {
        let mut slots = slots.lock();
        if slots.get(address).map_or(false, |s| Arc::ptr_eq(s, slot)) {
            slots.remove(address);
        }
    }

    /// Pipeline for `address`, connecting on first use.
    ///
    /// Counts one attached session; pair with [`SessionRegistry::detach`]
    /// using the same address. A slow connect only holds up attaches to
    /// the same address.
    pub async fn attach(&self, address: &DebuggeeAddress) -> DaemonResult<Arc<Pipeline>> {
        loop {
            let slot = self.slot(address);
            let mut entry = slot.lock().await;

            // Released while we waited; start over with a fresh slot
            if !self.current(address).map_or(false, |s| Arc::ptr_eq(&s, &slot)) {
                continue;
            }

            if let Some(live) = entry.as_mut() {
                if !live.pipeline.backend().is_closed() {
                    live.sessions += 1;
                    debug!("Session joined {} ({} attached)", address, live.sessions);
                    return Ok(Arc::clone(&live.pipeline));
                }
                *entry = None;
            }

            let (connection, notices) = match self.connector.connect(address, &self.options).await {
                Ok(connected) => connected,
                Err(e) => {
                    Self::release(&self.slots, address, &slot);
                    return Err(e.into());
                }
            };
            let pipeline = Pipeline::new(connection, notices, self.options.clone());
            agents::install_defaults(&pipeline);
            pipeline.start();

            *entry = Some(Entry {
                pipeline: Arc::clone(&pipeline),
                sessions: 1,
            });
            self.watch(address.clone(), Arc::clone(&slot), Arc::clone(&pipeline));
            info!("Attached new backend {}", address);
            return Ok(pipeline);
        }
    }

    /// Remove the entry once its stream closes, whoever closed it
    fn watch(&self, address: DebuggeeAddress, slot: Slot, pipeline: Arc<Pipeline>) {
        let slots = Arc::clone(&self.slots);
        let backend = Arc::clone(pipeline.backend());
        let pipeline = Arc::downgrade(&pipeline);
        tokio::spawn(async move {
            backend.closed().await;
            let mut entry = slot.lock().await;
            let same = entry
                .as_ref()
                .zip(pipeline.upgrade())
                .map_or(false, |(entry, p)| Arc::ptr_eq(&entry.pipeline, &p));
            if same {
                *entry = None;
                Self::release(&slots, &address, &slot);
                info!("Backend {} closed; removed from registry", address);
            }
        });
    }

    /// Drop one session that attached to `address`; the last one closes
    /// the backend
    pub async fn detach(&self, address: &DebuggeeAddress, pipeline: &Arc<Pipeline>) {
        let Some(slot) = self.current(address) else {
            return;
        };
        let closing = {
            let mut entry = slot.lock().await;
            match entry.as_mut() {
                Some(live) if Arc::ptr_eq(&live.pipeline, pipeline) => {
                    live.sessions = live.sessions.saturating_sub(1);
                    debug!("Session left {} ({} attached)", address, live.sessions);
                    if live.sessions == 0 {
                        Self::release(&self.slots, address, &slot);
                        entry.take()
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(entry) = closing {
            info!("Last session left {}; closing backend", address);
            entry.pipeline.backend().close().await;
        }
    }

    /// Attach, serve the client, detach.
    ///
    /// Connect failures are reported to the client as a detach followed by
    /// a close frame.
    pub async fn serve(
        &self,
        address: &DebuggeeAddress,
        inbound: mpsc::UnboundedReceiver<String>,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) -> SessionEnd {
        let pipeline = match self.attach(address).await {
            Ok(pipeline) => pipeline,
            Err(e) => {
                warn!("Cannot attach to {}: {}", address, e);
                let reason = match e {
                    DaemonError::Bridge(e) => e,
                    other => BridgeError::ConnectionFailed(other.to_string()),
                };
                for frame in refusal(&reason) {
                    let _ = outbound.send(frame);
                }
                return SessionEnd::BackendClosed(reason.to_string());
            }
        };

        let end = FrontendSession::new(Arc::clone(&pipeline), outbound)
            .run(inbound)
            .await;
        self.detach(address, &pipeline).await;
        end
    }

    /// Addresses with a live entry
    pub async fn addresses(&self) -> Vec<DebuggeeAddress> {
        let slots: Vec<(DebuggeeAddress, Slot)> = self
            .slots
            .lock()
            .iter()
            .map(|(address, slot)| (address.clone(), Arc::clone(slot)))
            .collect();
        let mut live = Vec::new();
        for (address, slot) in slots {
            if slot.lock().await.is_some() {
                live.push(address);
            }
        }
        live
    }

    /// Attached session count for `address`
    pub async fn session_count(&self, address: &DebuggeeAddress) -> usize {
        match self.current(address) {
            Some(slot) => slot.lock().await.as_ref().map_or(0, |entry| entry.sessions),
            None => 0,
        }
    }

    /// Close every backend, as on shutdown
    pub async fn close_all(&self) {
        let drained: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            let entry = slot.lock().await.take();
            if let Some(entry) = entry {
                entry.pipeline.backend().close().await;
            }
        }
    }
}
