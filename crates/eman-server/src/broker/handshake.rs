//! Per-connection handshake state machine.
//!
//! ```text
//! Init --shake_i_am--> AwaitingReady --shake_ready--> Online
//!   \__________________________\____ error / timeout --> Failed
//! ```

use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::errors::BrokerError;
use crate::ids::ServiceId;
use crate::metrics::{HANDSHAKE_DURATION_SECONDS, HANDSHAKES_COMPLETED_TOTAL, HANDSHAKES_FAILED_TOTAL};
use crate::protocol::{self, value_as_name};
use crate::registry::ServiceRegistry;
use crate::validation::present;
use crate::websocket::connection::ClientConnection;
use crate::websocket::groups::GroupManager;

/// Where a connection is in the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// `shake_who` sent, waiting for `shake_i_am`.
    Init,
    /// Id issued, waiting for `shake_ready`.
    AwaitingReady {
        /// Id issued on this connection.
        service_id: ServiceId,
    },
    /// Admitted; routing is enabled.
    Online {
        /// The connection's service id.
        service_id: ServiceId,
    },
    /// Rejected; the connection is closing.
    Failed,
    /// The peer disconnected.
    Closed,
}

/// Result of feeding one input to the state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeStep {
    /// The input did not apply to the current state.
    Ignored,
    /// `shake_id` was sent.
    IdIssued(ServiceId),
    /// `shake_online` was sent.
    Online(ServiceId),
    /// `shake_error` was sent and the connection asked to close.
    Rejected(BrokerError),
}

/// Handshake state plus its timeout timer.
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    timer: Option<CancellationToken>,
    started: Instant,
}

impl Handshake {
    /// Start a handshake guarded by `timer`.
    pub fn start(timer: CancellationToken) -> Self {
        Self {
            state: HandshakeState::Init,
            timer: Some(timer),
            started: Instant::now(),
        }
    }

    /// Current state.
    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Whether the connection was admitted.
    pub fn is_online(&self) -> bool {
        matches!(self.state, HandshakeState::Online { .. })
    }

    /// Whether the timeout timer has not been cancelled yet.
    pub fn timer_armed(&self) -> bool {
        self.timer.is_some()
    }

    fn in_progress(&self) -> bool {
        matches!(
            self.state,
            HandshakeState::Init | HandshakeState::AwaitingReady { .. }
        )
    }

    /// Cancel the timeout timer, if still armed.
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// Handle `shake_i_am {name, key}`.
    pub fn on_i_am(
        &mut self,
        payload: &Value,
        conn: &ClientConnection,
        registry: &mut ServiceRegistry,
    ) -> HandshakeStep {
        trace!(conn_id = %conn.id, "<= {} {payload}", protocol::SHAKE_I_AM);
        if self.state != HandshakeState::Init {
            debug!(conn_id = %conn.id, state = ?self.state, "ignoring shake_i_am");
            return HandshakeStep::Ignored;
        }

        // Any truthy name is accepted; non-strings use their JSON text.
        let Some(name) = present(payload, "name").map(value_as_name) else {
            return self.reject(conn, BrokerError::InvalidName);
        };
        if present(payload, "key").is_none() {
            return self.reject(conn, BrokerError::InvalidSecretKey);
        }

        let service_id = ServiceId::generate(&name);
        if let Err(e) = registry
            .create(service_id.clone(), &name)
            .bind_connection(conn.id.clone())
        {
            return self.reject(conn, e.into());
        }
        conn.tag_service(service_id.clone());

        trace!(conn_id = %conn.id, "=> {} {service_id}", protocol::SHAKE_ID);
        let _ = conn.emit_event(protocol::SHAKE_ID, json!({ "id": service_id }));
        self.state = HandshakeState::AwaitingReady {
            service_id: service_id.clone(),
        };
        HandshakeStep::IdIssued(service_id)
    }

    /// Handle `shake_ready {id}`.
    pub fn on_ready(
        &mut self,
        payload: &Value,
        conn: &ClientConnection,
        groups: &mut GroupManager,
    ) -> HandshakeStep {
        trace!(conn_id = %conn.id, "<= {} {payload}", protocol::SHAKE_READY);
        if !self.in_progress() {
            debug!(conn_id = %conn.id, state = ?self.state, "ignoring shake_ready");
            return HandshakeStep::Ignored;
        }
        self.cancel_timer();

        let Some(id) = present(payload, "id") else {
            return self.reject(conn, BrokerError::NoId);
        };
        let issued = match &self.state {
            HandshakeState::AwaitingReady { service_id } => Some(service_id.clone()),
            _ => None,
        };
        let claimed = value_as_name(id);
        let Some(service_id) = issued.filter(|sid| sid.as_str() == claimed) else {
            return self.reject(conn, BrokerError::InvalidId);
        };

        groups.join(&conn.id, protocol::REQUEST_FLOW_GROUP);
        groups.join(&conn.id, service_id.as_str());

        trace!(conn_id = %conn.id, "=> {}", protocol::SHAKE_ONLINE);
        let _ = conn.emit(&protocol::Frame::bare(protocol::SHAKE_ONLINE));
        self.state = HandshakeState::Online {
            service_id: service_id.clone(),
        };

        let elapsed = self.started.elapsed();
        counter!(HANDSHAKES_COMPLETED_TOTAL).increment(1);
        histogram!(HANDSHAKE_DURATION_SECONDS).record(elapsed.as_secs_f64());
        debug!(conn_id = %conn.id, %service_id, ?elapsed, "handshake complete");
        HandshakeStep::Online(service_id)
    }

    /// Handle the timer firing. No-op once the handshake left its
    /// in-progress states or the timer was cancelled.
    pub fn on_timeout(&mut self, conn: &ClientConnection) -> HandshakeStep {
        if !self.in_progress() || !self.timer_armed() {
            trace!(conn_id = %conn.id, state = ?self.state, "stale handshake timeout");
            return HandshakeStep::Ignored;
        }
        self.reject(conn, BrokerError::RequestTimeout)
    }

    /// Mark the connection closed and release the timer.
    pub fn close(&mut self) {
        self.cancel_timer();
        self.state = HandshakeState::Closed;
    }

    fn reject(&mut self, conn: &ClientConnection, err: BrokerError) -> HandshakeStep {
        self.cancel_timer();
        error!(conn_id = %conn.id, addr = ?conn.remote_addr, code = %err.code(), "handshake failed: {err}");
        counter!(HANDSHAKES_FAILED_TOTAL, "code" => err.code()).increment(1);
        trace!(conn_id = %conn.id, "=> {}", protocol::SHAKE_ERROR);
        let _ = conn.emit_event(protocol::SHAKE_ERROR, err.to_payload());
        conn.disconnect();
        self.state = HandshakeState::Failed;
        HandshakeStep::Rejected(err)
    }
}
