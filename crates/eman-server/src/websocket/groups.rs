//! Named broadcast groups over connected clients.
//!
//! Every connection sits in an implicit group named by its own id. Online
//! services also join `request_flow` and a group named by their service id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use super::connection::ClientConnection;
use crate::ids::ConnectionId;
use crate::protocol::Frame;

/// Connection index plus group membership.
#[derive(Default)]
pub struct GroupManager {
    connections: HashMap<ConnectionId, Arc<ClientConnection>>,
    groups: HashMap<String, HashSet<ConnectionId>>,
}

impl GroupManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection and place it in its own group.
    pub fn add(&mut self, connection: Arc<ClientConnection>) {
        let id = connection.id.clone();
        self.join(&id, id.as_str());
        let _ = self.connections.insert(id, connection);
    }

    /// Forget a connection and drop it from every group.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.groups.retain(|_, members| {
            let _ = members.remove(id);
            !members.is_empty()
        });
        self.connections.remove(id)
    }

    /// Look up a tracked connection.
    pub fn get(&self, id: &ConnectionId) -> Option<&Arc<ClientConnection>> {
        self.connections.get(id)
    }

    /// Add a connection to a named group.
    pub fn join(&mut self, id: &ConnectionId, group: &str) {
        let _ = self
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(id.clone());
    }

    /// Send a frame to every member of `group`. Returns the number of
    /// connections the frame was queued for.
    pub fn emit_to_group(&self, group: &str, frame: &Frame) -> usize {
        let Some(members) = self.groups.get(group) else {
            debug!(group, event = %frame.event, "emit to empty group");
            return 0;
        };
        let json = match frame.to_json() {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(group, event = %frame.event, error = %e, "failed to serialize frame");
                return 0;
            }
        };
        let mut delivered = 0;
        for conn in members.iter().filter_map(|id| self.connections.get(id)) {
            if conn.send(Arc::clone(&json)) {
                delivered += 1;
            } else {
                warn!(conn_id = %conn.id, group, "failed to send frame to client");
            }
        }
        debug!(group, event = %frame.event, recipients = delivered, "emit to group");
        delivered
    }

    /// Members currently in `group`.
    pub fn group_size(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, HashSet::len)
    }

    /// Whether `id` belongs to `group`.
    pub fn is_member(&self, id: &ConnectionId, group: &str) -> bool {
        self.groups.get(group).is_some_and(|m| m.contains(id))
    }

    /// Number of tracked connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_connection(id: &str) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = ClientConnection::new(ConnectionId::from_raw(id), None, tx);
        (Arc::new(conn), rx)
    }

    #[test]
    fn add_joins_own_group() {
        let mut gm = GroupManager::new();
        let (conn, _rx) = make_connection("c1");
        gm.add(conn);
        let id = ConnectionId::from_raw("c1");
        assert_eq!(gm.connection_count(), 1);
        assert!(gm.is_member(&id, "c1"));
        assert_eq!(gm.get(&id).map(|c| c.id.as_str()), Some("c1"));
        assert!(gm.get(&ConnectionId::from_raw("c2")).is_none());
    }

    #[test]
    fn remove_leaves_all_groups() {
        let mut gm = GroupManager::new();
        let (conn, _rx) = make_connection("c1");
        let id = conn.id.clone();
        gm.add(conn);
        gm.join(&id, "request_flow");
        gm.join(&id, "billing.1.2");

        assert!(gm.remove(&id).is_some());
        assert_eq!(gm.group_size("request_flow"), 0);
        assert_eq!(gm.group_size("billing.1.2"), 0);
        assert_eq!(gm.group_size("c1"), 0);
        assert!(gm.remove(&id).is_none());
    }

    #[tokio::test]
    async fn emit_to_group_reaches_members_only() {
        let mut gm = GroupManager::new();
        let (a, mut rx_a) = make_connection("a");
        let (b, mut rx_b) = make_connection("b");
        let a_id = a.id.clone();
        gm.add(a);
        gm.add(b);
        gm.join(&a_id, "request_flow");

        let sent = gm.emit_to_group("request_flow", &Frame::bare("ping"));
        assert_eq!(sent, 1);
        let msg = rx_a.recv().await.unwrap();
        assert!(msg.contains("\"ping\""));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn emit_to_unknown_group_is_noop() {
        let gm = GroupManager::new();
        assert_eq!(gm.emit_to_group("nobody", &Frame::bare("x")), 0);
    }

    #[tokio::test]
    async fn closed_member_is_skipped() {
        let mut gm = GroupManager::new();
        let (a, rx_a) = make_connection("a");
        let (b, mut rx_b) = make_connection("b");
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        gm.add(a);
        gm.add(b);
        gm.join(&a_id, "g");
        gm.join(&b_id, "g");
        drop(rx_a);

        assert_eq!(gm.emit_to_group("g", &Frame::bare("x")), 1);
        assert!(rx_b.recv().await.is_some());
    }
}
