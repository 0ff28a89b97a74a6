//! Request/response routing for online connections.

use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::BrokerError;
use crate::ids::ServiceId;
use crate::metrics::{REQUESTS_ROUTED_TOTAL, RESPONSES_ROUTED_TOTAL, ROUTING_ERRORS_TOTAL};
use crate::protocol::{self, Frame, value_as_name};
use crate::registry::{Service, ServiceRegistry};
use crate::validation::RequiredFields;
use crate::websocket::connection::ClientConnection;
use crate::websocket::groups::GroupManager;

/// Application events an online connection may send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// `api:request`
    Request,
    /// `api:response`
    Response,
    /// `_service:api:request:subscribe`
    Subscribe,
    /// `_service:api:request:unsubscribe`
    Unsubscribe,
}

impl Route {
    /// Resolve an inbound event name.
    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            protocol::API_REQUEST => Some(Self::Request),
            protocol::API_RESPONSE => Some(Self::Response),
            protocol::SERVICE_SUBSCRIBE => Some(Self::Subscribe),
            protocol::SERVICE_UNSUBSCRIBE => Some(Self::Unsubscribe),
            _ => None,
        }
    }

    /// Wire event name for this route.
    pub fn event(self) -> &'static str {
        match self {
            Self::Request => protocol::API_REQUEST,
            Self::Response => protocol::API_RESPONSE,
            Self::Subscribe => protocol::SERVICE_SUBSCRIBE,
            Self::Unsubscribe => protocol::SERVICE_UNSUBSCRIBE,
        }
    }
}

/// What happened to a routed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Request fanned out to `request_flow` under `event`.
    Broadcast {
        /// Event name taken from the payload's `name`.
        event: String,
        /// Connections the frame was queued for.
        recipients: usize,
    },
    /// Response accepted; delivered only if `sender_id` names a live service.
    Delivered {
        /// Requester service id from the payload.
        sender_id: String,
        /// Connections the frame was queued for.
        recipients: usize,
    },
    /// Event name added to the service's interests.
    Subscribed(String),
    /// Event name withdrawn; `removed` is false when it was absent.
    Unsubscribed {
        /// Event name.
        name: String,
        /// Whether the name was present.
        removed: bool,
    },
    /// The origin had no registry entry.
    Ignored,
    /// Validation failed and the origin was sent an error event.
    Rejected(BrokerError),
}

/// Routes application events between online connections.
pub struct EventRouter<'a> {
    registry: &'a mut ServiceRegistry,
    groups: &'a GroupManager,
}

impl<'a> EventRouter<'a> {
    /// Borrow the broker state needed to route one event.
    pub fn new(registry: &'a mut ServiceRegistry, groups: &'a GroupManager) -> Self {
        Self { registry, groups }
    }

    /// Route one event from `origin`. Failures are reported to the origin only.
    pub fn route(&mut self, route: Route, payload: &Value, origin: &ClientConnection) -> RouteOutcome {
        let result = match route {
            Route::Request => self.request(payload),
            Route::Response => self.response(payload),
            Route::Subscribe => self.subscribe(payload, origin),
            Route::Unsubscribe => self.unsubscribe(payload, origin),
        };
        match result {
            Ok(outcome) => outcome,
            Err(err) => {
                let reply = err.reply_event(route.event());
                warn!(
                    conn_id = %origin.id,
                    service_id = %origin.label(),
                    event = route.event(),
                    code = %err.code(),
                    "rejected: {err}"
                );
                counter!(ROUTING_ERRORS_TOTAL, "event" => route.event(), "code" => err.code())
                    .increment(1);
                let _ = origin.emit_event(reply, err.to_payload());
                RouteOutcome::Rejected(err)
            }
        }
    }

    fn request(&self, payload: &Value) -> Result<RouteOutcome, BrokerError> {
        RequiredFields::REQUEST.check(payload)?;
        let event = value_as_name(&payload["name"]);
        let recipients = self
            .groups
            .emit_to_group(protocol::REQUEST_FLOW_GROUP, &Frame::new(event.as_str(), payload.clone()));
        counter!(REQUESTS_ROUTED_TOTAL).increment(1);
        debug!(%event, recipients, "request broadcast");
        Ok(RouteOutcome::Broadcast { event, recipients })
    }

    fn response(&self, payload: &Value) -> Result<RouteOutcome, BrokerError> {
        RequiredFields::RESPONSE.check(payload)?;
        let sender_id = value_as_name(&payload["sender_id"]);
        // Only a registered service's own socket can receive a response;
        // group names such as `request_flow` never resolve here.
        let requester = self
            .registry
            .get(&ServiceId::from_raw(sender_id.as_str()))
            .and_then(Service::connection)
            .and_then(|conn_id| self.groups.get(conn_id));
        let recipients = match requester {
            Some(conn) => usize::from(conn.emit(&Frame::new(protocol::API_RESPONSE, payload.clone()))),
            None => {
                debug!(%sender_id, "response has no live requester");
                0
            }
        };
        counter!(RESPONSES_ROUTED_TOTAL).increment(1);
        Ok(RouteOutcome::Delivered { sender_id, recipients })
    }

    fn service_of(&mut self, origin: &ClientConnection) -> Option<&mut Service> {
        let id = origin.service_id()?;
        self.registry.get_mut(&id)
    }

    fn subscribe(&mut self, payload: &Value, origin: &ClientConnection) -> Result<RouteOutcome, BrokerError> {
        RequiredFields::SUBSCRIPTION.check(payload).map_err(|_| BrokerError::InvalidServiceData {
            event: protocol::SERVICE_SUBSCRIBE,
        })?;
        let name = value_as_name(&payload["name"]);
        let Some(service) = self.service_of(origin) else {
            warn!(conn_id = %origin.id, "subscribe from connection without a service");
            return Ok(RouteOutcome::Ignored);
        };
        service.subscribe(&name)?;
        debug!(service_id = %service.id(), %name, "subscribed");
        Ok(RouteOutcome::Subscribed(name))
    }

    fn unsubscribe(&mut self, payload: &Value, origin: &ClientConnection) -> Result<RouteOutcome, BrokerError> {
        RequiredFields::SUBSCRIPTION.check(payload).map_err(|_| BrokerError::InvalidServiceData {
            event: protocol::SERVICE_UNSUBSCRIBE,
        })?;
        let name = value_as_name(&payload["name"]);
        let Some(service) = self.service_of(origin) else {
            warn!(conn_id = %origin.id, "unsubscribe from connection without a service");
            return Ok(RouteOutcome::Ignored);
        };
        let removed = service.unsubscribe(&name);
        debug!(service_id = %service.id(), %name, removed, "unsubscribed");
        Ok(RouteOutcome::Unsubscribed { name, removed })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::ids::ConnectionId;

    struct Peer {
        conn: Arc<ClientConnection>,
        rx: mpsc::Receiver<Arc<String>>,
    }

    impl Peer {
        fn frames(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(text) = self.rx.try_recv() {
                out.push(serde_json::from_str(&text).unwrap());
            }
            out
        }
    }

    /// Register an online peer with the given service id.
    fn online(id: &str, registry: &mut ServiceRegistry, groups: &mut GroupManager) -> Peer {
        let (tx, rx) = mpsc::channel(32);
        let conn = Arc::new(ClientConnection::new(ConnectionId::from_raw(format!("conn_{id}")), None, tx));
        let service_id = ServiceId::from_raw(id);
        let name = id.split('.').next().unwrap_or(id);
        registry
            .create(service_id.clone(), name)
            .bind_connection(conn.id.clone())
            .unwrap();
        conn.tag_service(service_id);
        groups.add(Arc::clone(&conn));
        groups.join(&conn.id, protocol::REQUEST_FLOW_GROUP);
        groups.join(&conn.id, id);
        Peer { conn, rx }
    }

    #[test]
    fn route_resolution() {
        assert_eq!(Route::from_event("api:request"), Some(Route::Request));
        assert_eq!(Route::from_event("api:response"), Some(Route::Response));
        assert_eq!(Route::from_event(protocol::SERVICE_SUBSCRIBE), Some(Route::Subscribe));
        assert_eq!(Route::from_event("shake_ready"), None);
        assert_eq!(Route::Unsubscribe.event(), protocol::SERVICE_UNSUBSCRIBE);
    }

    #[test]
    fn request_broadcasts_to_everyone_including_sender() {
        let (mut registry, mut groups) = (ServiceRegistry::new(), GroupManager::new());
        let mut a = online("a.1.1", &mut registry, &mut groups);
        let mut b = online("b.2.2", &mut registry, &mut groups);

        let payload = json!({"name": "billing.get", "request_id": "r1", "sender_id": "a.1.1", "x": 1});
        let outcome = EventRouter::new(&mut registry, &groups).route(Route::Request, &payload, &a.conn);
        assert_eq!(
            outcome,
            RouteOutcome::Broadcast { event: "billing.get".into(), recipients: 2 }
        );

        for peer in [&mut a, &mut b] {
            let frames = peer.frames();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["event"], "billing.get");
            assert_eq!(frames[0]["data"], payload);
        }
    }

    #[test]
    fn invalid_request_only_reaches_submitter() {
        let (mut registry, mut groups) = (ServiceRegistry::new(), GroupManager::new());
        let mut a = online("a.1.1", &mut registry, &mut groups);
        let mut b = online("b.2.2", &mut registry, &mut groups);

        let payload = json!({"name": "billing.get", "request_id": "r1"});
        let outcome = EventRouter::new(&mut registry, &groups).route(Route::Request, &payload, &a.conn);
        assert!(matches!(outcome, RouteOutcome::Rejected(BrokerError::NoRequiredFields { .. })));

        let frames = a.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "api:request:error");
        assert_eq!(frames[0]["data"]["error"]["code"], "no_required_fields");
        assert_eq!(frames[0]["data"]["error"]["status"], 400);
        assert_eq!(frames[0]["data"]["error"]["missing"], json!(["sender_id"]));
        assert!(b.frames().is_empty());
        assert!(!a.conn.is_closing());
    }

    #[test]
    fn response_goes_to_requester_not_responder() {
        let (mut registry, mut groups) = (ServiceRegistry::new(), GroupManager::new());
        let mut requester = online("a.1.1", &mut registry, &mut groups);
        let mut responder = online("b.2.2", &mut registry, &mut groups);

        let payload = json!({
            "name": "billing.get",
            "request_id": "r1",
            "sender_id": "a.1.1",
            "recipient_id": "b.2.2",
            "result": {"total": 3}
        });
        let outcome =
            EventRouter::new(&mut registry, &groups).route(Route::Response, &payload, &responder.conn);
        assert_eq!(
            outcome,
            RouteOutcome::Delivered { sender_id: "a.1.1".into(), recipients: 1 }
        );

        let frames = requester.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "api:response");
        assert_eq!(frames[0]["data"], payload);
        assert!(responder.frames().is_empty());
    }

    #[test]
    fn response_to_broadcast_group_name_reaches_nobody() {
        let (mut registry, mut groups) = (ServiceRegistry::new(), GroupManager::new());
        let mut a = online("a.1.1", &mut registry, &mut groups);
        let mut b = online("b.2.2", &mut registry, &mut groups);

        for sender_id in [protocol::REQUEST_FLOW_GROUP, "conn_a.1.1", "c.3.3"] {
            let payload = json!({
                "name": "billing.get",
                "request_id": "r1",
                "sender_id": sender_id,
                "recipient_id": "b.2.2"
            });
            let outcome =
                EventRouter::new(&mut registry, &groups).route(Route::Response, &payload, &b.conn);
            assert_eq!(
                outcome,
                RouteOutcome::Delivered { sender_id: sender_id.into(), recipients: 0 },
                "{sender_id}"
            );
        }
        assert!(a.frames().is_empty());
        assert!(b.frames().is_empty());
    }

    #[test]
    fn response_skips_requester_that_left() {
        let (mut registry, mut groups) = (ServiceRegistry::new(), GroupManager::new());
        let requester = online("a.1.1", &mut registry, &mut groups);
        let mut responder = online("b.2.2", &mut registry, &mut groups);
        let _ = groups.remove(&requester.conn.id);

        let payload = json!({"name": "x", "request_id": "r", "sender_id": "a.1.1", "recipient_id": "b.2.2"});
        let outcome =
            EventRouter::new(&mut registry, &groups).route(Route::Response, &payload, &responder.conn);
        assert_eq!(outcome, RouteOutcome::Delivered { sender_id: "a.1.1".into(), recipients: 0 });
        assert!(responder.frames().is_empty());
    }

    #[test]
    fn invalid_response_replies_with_response_error() {
        let (mut registry, mut groups) = (ServiceRegistry::new(), GroupManager::new());
        let mut b = online("b.2.2", &mut registry, &mut groups);
        let payload = json!({"name": "x", "request_id": "r", "sender_id": "a.1.1", "recipient_id": ""});
        let _ = EventRouter::new(&mut registry, &groups).route(Route::Response, &payload, &b.conn);
        let frames = b.frames();
        assert_eq!(frames[0]["event"], "api:response:error");
        assert_eq!(frames[0]["data"]["error"]["missing"], json!(["recipient_id"]));
    }

    #[test]
    fn subscribe_and_unsubscribe_update_service() {
        let (mut registry, mut groups) = (ServiceRegistry::new(), GroupManager::new());
        let a = online("a.1.1", &mut registry, &mut groups);
        let id = ServiceId::from_raw("a.1.1");

        let outcome = EventRouter::new(&mut registry, &groups)
            .route(Route::Subscribe, &json!({"name": "billing.get"}), &a.conn);
        assert_eq!(outcome, RouteOutcome::Subscribed("billing.get".into()));
        assert!(registry.get(&id).unwrap().is_subscribed("billing.get"));

        let outcome = EventRouter::new(&mut registry, &groups)
            .route(Route::Unsubscribe, &json!({"name": "billing.get"}), &a.conn);
        assert_eq!(
            outcome,
            RouteOutcome::Unsubscribed { name: "billing.get".into(), removed: true }
        );
        assert!(registry.get(&id).unwrap().subscribed_events().is_empty());
    }

    #[test]
    fn duplicate_subscribe_reports_conflict() {
        let (mut registry, mut groups) = (ServiceRegistry::new(), GroupManager::new());
        let mut a = online("a.1.1", &mut registry, &mut groups);
        let payload = json!({"name": "billing.get"});
        let _ = EventRouter::new(&mut registry, &groups).route(Route::Subscribe, &payload, &a.conn);
        let outcome = EventRouter::new(&mut registry, &groups).route(Route::Subscribe, &payload, &a.conn);
        assert!(matches!(outcome, RouteOutcome::Rejected(BrokerError::AlreadySubscribed { .. })));

        let frames = a.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "_service:error");
        assert_eq!(frames[0]["data"]["error"]["code"], "already_subscribed");
        assert_eq!(frames[0]["data"]["error"]["status"], 409);
    }

    #[test]
    fn subscribe_without_name_is_invalid_data() {
        let (mut registry, mut groups) = (ServiceRegistry::new(), GroupManager::new());
        let mut a = online("a.1.1", &mut registry, &mut groups);
        let _ = EventRouter::new(&mut registry, &groups).route(Route::Unsubscribe, &json!({}), &a.conn);
        let frames = a.frames();
        assert_eq!(frames[0]["event"], "_service:error");
        assert_eq!(
            frames[0]["data"]["error"]["code"],
            "invalid_data_on_service:api:request:unsubscribe"
        );
        assert_eq!(frames[0]["data"]["error"]["status"], 400);
        assert!(!a.conn.is_closing());
    }
}
