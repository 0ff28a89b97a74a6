//! One peer socket as the broker sees it: an outbound queue, a close
//! signal and liveness bookkeeping for the heartbeat.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::ids::{ConnectionId, ServiceId};
use crate::metrics::WS_SEND_DROPS_TOTAL;
use crate::protocol::Frame;

/// Broker-side view of a connected peer.
#[derive(Debug)]
pub struct ClientConnection {
    /// Server-assigned id, stable for the socket's lifetime.
    pub id: ConnectionId,
    /// Peer address, when the transport exposes one.
    pub remote_addr: Option<SocketAddr>,
    /// Service issued on this connection (set at `shake_id`).
    service_id: Mutex<Option<ServiceId>>,
    /// Queue drained by the session writer.
    tx: mpsc::Sender<Arc<String>>,
    /// Cancelled when the server decides to drop the client.
    close: CancellationToken,
    connected_at: Instant,
    /// Any inbound traffic since the writer's last ping tick.
    seen_since_ping: AtomicBool,
    last_activity: Mutex<Instant>,
    /// Frames discarded because the queue was full or closed.
    dropped: AtomicU64,
}

impl ClientConnection {
    /// `tx` feeds the session writer for this socket.
    pub fn new(
        id: ConnectionId,
        remote_addr: Option<SocketAddr>,
        tx: mpsc::Sender<Arc<String>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            remote_addr,
            service_id: Mutex::new(None),
            tx,
            close: CancellationToken::new(),
            connected_at: now,
            seen_since_ping: AtomicBool::new(true),
            last_activity: Mutex::new(now),
            dropped: AtomicU64::new(0),
        }
    }

    /// Tag the connection with the service issued on it.
    pub fn tag_service(&self, service_id: ServiceId) {
        *self.service_id.lock() = Some(service_id);
    }

    /// The service issued on this connection, if any.
    pub fn service_id(&self) -> Option<ServiceId> {
        self.service_id.lock().clone()
    }

    /// Label used in logs: the service id, or the peer address before one exists.
    pub fn label(&self) -> String {
        match (self.service_id(), self.remote_addr) {
            (Some(id), _) => id.to_string(),
            (None, Some(addr)) => format!("(no id){addr}"),
            (None, None) => format!("(no id){}", self.id),
        }
    }

    /// Queue pre-encoded text without waiting.
    ///
    /// A full or closed queue drops the frame and counts it; the broker loop
    /// never blocks on a slow peer.
    pub fn send(&self, text: Arc<String>) -> bool {
        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(_) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!(WS_SEND_DROPS_TOTAL).increment(1);
                false
            }
        }
    }

    /// Serialize a frame and send it to the client.
    pub fn emit(&self, frame: &Frame) -> bool {
        match frame.to_json() {
            Ok(text) => self.send(Arc::new(text)),
            Err(e) => {
                warn!(conn_id = %self.id, event = %frame.event, error = %e, "failed to serialize frame");
                false
            }
        }
    }

    /// Build and send a frame in one step.
    pub fn emit_event(&self, event: &str, data: Value) -> bool {
        self.emit(&Frame::new(event, data))
    }

    /// Ask the session to close the socket once queued frames are flushed.
    pub fn disconnect(&self) {
        self.close.cancel();
    }

    /// Whether a disconnect was requested.
    pub fn is_closing(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Token the session watches for server-initiated close.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    /// Frames dropped on this connection so far.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Record inbound traffic of any kind, pongs included.
    pub fn touch(&self) {
        self.seen_since_ping.store(true, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound traffic.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Consume the activity flag at a ping tick.
    pub fn take_seen(&self) -> bool {
        self.seen_since_ping.swap(false, Ordering::Relaxed)
    }

    /// Peer considered gone: silent since the last tick and idle past `limit`.
    pub fn is_unresponsive(&self, limit: Duration) -> bool {
        !self.take_seen() && self.idle_for() > limit
    }

    /// Time since the socket was accepted.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
