//! Broker event loop.
//!
//! A single task owns the service registry, the group table and every
//! connection's handshake state. Sessions and timers talk to it only through
//! [`BrokerEvent`]s, and each event is handled to completion before the next.

pub mod handshake;
pub mod router;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::BrokerConfig;
use crate::errors::ServerError;
use crate::ids::ConnectionId;
use crate::metrics::{
    SERVICES_ONLINE, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::protocol::{self, Frame};
use crate::registry::{ServiceInfo, ServiceRegistry};
use crate::websocket::connection::ClientConnection;
use crate::websocket::groups::GroupManager;

use handshake::{Handshake, HandshakeStep};
use router::{EventRouter, Route};

/// Capacity of the broker's inbound event queue.
const EVENT_QUEUE_SIZE: usize = 1024;

/// Inputs to the broker loop.
#[derive(Debug)]
pub enum BrokerEvent {
    /// A WebSocket was accepted.
    Connected(Arc<ClientConnection>),
    /// A decoded frame arrived on a connection.
    Frame {
        /// Originating connection.
        conn_id: ConnectionId,
        /// The frame.
        frame: Frame,
    },
    /// A frame could not be decoded or the transport reported an error.
    TransportError {
        /// Affected connection.
        conn_id: ConnectionId,
        /// Description of the failure.
        error: String,
    },
    /// A connection's handshake timer fired.
    HandshakeTimeout {
        /// Affected connection.
        conn_id: ConnectionId,
    },
    /// The connection is gone.
    Disconnected {
        /// Closed connection.
        conn_id: ConnectionId,
    },
    /// Request a registry snapshot.
    Snapshot {
        /// Where to send it.
        reply: oneshot::Sender<BTreeMap<String, ServiceInfo>>,
    },
    /// Request live counters.
    Stats {
        /// Where to send them.
        reply: oneshot::Sender<BrokerStats>,
    },
}

/// Live broker counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Open connections.
    pub connections: usize,
    /// Connections past the handshake.
    pub online: usize,
    /// Registry entries.
    pub services: usize,
}

/// Cloneable sender side of the broker loop.
#[derive(Clone, Debug)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerEvent>,
}

impl BrokerHandle {
    /// Queue an event for the broker.
    pub async fn send(&self, event: BrokerEvent) -> Result<(), ServerError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ServerError::BrokerUnavailable)
    }

    /// Snapshot of every registered service keyed by id.
    pub async fn snapshot(&self) -> Result<BTreeMap<String, ServiceInfo>, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerEvent::Snapshot { reply }).await?;
        rx.await.map_err(|_| ServerError::BrokerUnavailable)
    }

    /// Current connection and service counts.
    pub async fn stats(&self) -> Result<BrokerStats, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(BrokerEvent::Stats { reply }).await?;
        rx.await.map_err(|_| ServerError::BrokerUnavailable)
    }
}

/// Per-connection state owned by the loop.
struct ConnectionSlot {
    conn: Arc<ClientConnection>,
    handshake: Handshake,
    /// Set once the handshake reaches online; gates application events.
    routing: bool,
}

/// The broker event loop.
pub struct Broker {
    config: BrokerConfig,
    tx: mpsc::Sender<BrokerEvent>,
    rx: mpsc::Receiver<BrokerEvent>,
    registry: ServiceRegistry,
    groups: GroupManager,
    slots: HashMap<ConnectionId, ConnectionSlot>,
}

impl Broker {
    /// Create a broker and the handle used to feed it.
    pub fn new(config: BrokerConfig) -> (Self, BrokerHandle) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let handle = BrokerHandle { tx: tx.clone() };
        let broker = Self {
            config,
            tx,
            rx,
            registry: ServiceRegistry::new(),
            groups: GroupManager::new(),
            slots: HashMap::new(),
        };
        (broker, handle)
    }

    /// Process events until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            handshake_timeout = ?self.config.handshake_timeout,
            "broker started"
        );
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }
        for slot in self.slots.values_mut() {
            slot.handshake.close();
            slot.conn.disconnect();
        }
        info!(connections = self.slots.len(), "broker stopped");
    }

    /// Handle a single event to completion.
    pub fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected(conn) => self.on_connected(conn),
            BrokerEvent::Frame { conn_id, frame } => self.on_frame(&conn_id, frame),
            BrokerEvent::TransportError { conn_id, error } => {
                let label = self
                    .slots
                    .get(&conn_id)
                    .map_or_else(|| conn_id.to_string(), |slot| slot.conn.label());
                warn!(%conn_id, service_id = %label, "connection error: {error}");
            }
            BrokerEvent::HandshakeTimeout { conn_id } => {
                if let Some(slot) = self.slots.get_mut(&conn_id) {
                    let _ = slot.handshake.on_timeout(&slot.conn);
                }
            }
            BrokerEvent::Disconnected { conn_id } => self.on_disconnected(&conn_id),
            BrokerEvent::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            BrokerEvent::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connections: self.slots.len(),
            online: self.slots.values().filter(|s| s.routing).count(),
            services: self.registry.len(),
        }
    }

    /// Read-only view of the registry.
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    fn on_connected(&mut self, conn: Arc<ClientConnection>) {
        let timer = self.arm_handshake_timer(conn.id.clone());
        info!(conn_id = %conn.id, addr = ?conn.remote_addr, "connected");
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

        self.groups.add(Arc::clone(&conn));
        trace!(conn_id = %conn.id, "=> {}", protocol::SHAKE_WHO);
        let _ = conn.emit(&Frame::bare(protocol::SHAKE_WHO));

        let slot = ConnectionSlot {
            conn: Arc::clone(&conn),
            handshake: Handshake::start(timer),
            routing: false,
        };
        if let Some(mut stale) = self.slots.insert(conn.id.clone(), slot) {
            warn!(conn_id = %conn.id, "connection id reused, closing previous slot");
            stale.handshake.close();
        }
    }

    fn on_frame(&mut self, conn_id: &ConnectionId, frame: Frame) {
        let Some(slot) = self.slots.get_mut(conn_id) else {
            debug!(%conn_id, event = %frame.event, "frame for unknown connection");
            return;
        };

        if protocol::is_handshake_event(&frame.event) {
            let step = match frame.event.as_str() {
                protocol::SHAKE_I_AM => {
                    slot.handshake
                        .on_i_am(&frame.data, &slot.conn, &mut self.registry)
                }
                protocol::SHAKE_READY => {
                    slot.handshake
                        .on_ready(&frame.data, &slot.conn, &mut self.groups)
                }
                other => {
                    debug!(%conn_id, event = other, "ignoring handshake event from client");
                    HandshakeStep::Ignored
                }
            };
            if let HandshakeStep::Online(service_id) = step {
                slot.routing = true;
                gauge!(SERVICES_ONLINE).increment(1.0);
                info!(%conn_id, %service_id, "service online");
            }
            return;
        }

        if !slot.routing {
            debug!(%conn_id, event = %frame.event, "dropping event from connection that is not online");
            return;
        }
        let Some(route) = Route::from_event(&frame.event) else {
            debug!(%conn_id, event = %frame.event, "no route for event");
            return;
        };
        let _ = EventRouter::new(&mut self.registry, &self.groups).route(route, &frame.data, &slot.conn);
    }

    fn on_disconnected(&mut self, conn_id: &ConnectionId) {
        let Some(mut slot) = self.slots.remove(conn_id) else {
            return;
        };
        slot.handshake.close();
        let _ = self.groups.remove(conn_id);

        if let Some(service_id) = slot.conn.service_id() {
            let owned = self
                .registry
                .get(&service_id)
                .is_some_and(|svc| svc.connection() == Some(conn_id));
            if owned {
                let _ = self.registry.remove(&service_id);
            }
        }
        if slot.routing {
            gauge!(SERVICES_ONLINE).decrement(1.0);
        }

        info!(
            %conn_id,
            drops = slot.conn.drop_count(),
            "disconnected {}",
            slot.conn.label()
        );
        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(slot.conn.age().as_secs_f64());
    }

    /// Spawn the timeout task for a new connection. Cancelling the returned
    /// token disarms it.
    fn arm_handshake_timer(&self, conn_id: ConnectionId) -> CancellationToken {
        let token = CancellationToken::new();
        let guard = token.clone();
        let tx = self.tx.clone();
        let timeout = self.config.handshake_timeout;
        let _ = tokio::spawn(async move {
            tokio::select! {
                () = guard.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    let _ = tx.send(BrokerEvent::HandshakeTimeout { conn_id }).await;
                }
            }
        });
        token
    }
}
