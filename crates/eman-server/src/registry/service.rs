//! A single registered service.

use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;
use crate::ids::{ConnectionId, ServiceId};

/// Public view of a service, as served by `GET /services`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Broker-issued id.
    pub id: ServiceId,
    /// Declared name.
    pub name: String,
    /// Event names the service declared interest in.
    pub subscribed_events: Vec<String>,
}

/// One connected remote process.
///
/// Bound to exactly one connection for its whole life.
#[derive(Clone, Debug)]
pub struct Service {
    id: ServiceId,
    name: String,
    subscribed_events: Vec<String>,
    connection: Option<ConnectionId>,
}

impl Service {
    /// Create an unbound service.
    pub fn new(id: ServiceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            subscribed_events: Vec::new(),
            connection: None,
        }
    }

    /// Broker-issued id.
    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    /// Name declared in `shake_i_am`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared interests, in subscription order.
    pub fn subscribed_events(&self) -> &[String] {
        &self.subscribed_events
    }

    /// The connection this service lives on, once bound.
    pub fn connection(&self) -> Option<&ConnectionId> {
        self.connection.as_ref()
    }

    /// Bind the owning connection. Can only happen once.
    pub fn bind_connection(&mut self, connection: ConnectionId) -> Result<(), ServiceError> {
        if self.connection.is_some() {
            return Err(ServiceError::AlreadyBound {
                service_id: self.id.clone(),
            });
        }
        self.connection = Some(connection);
        Ok(())
    }

    /// Record interest in `event`.
    pub fn subscribe(&mut self, event: &str) -> Result<(), ServiceError> {
        if self.is_subscribed(event) {
            return Err(ServiceError::AlreadySubscribed {
                service_id: self.id.clone(),
                name: event.to_string(),
            });
        }
        self.subscribed_events.push(event.to_string());
        Ok(())
    }

    /// Withdraw interest in `event`. Returns whether it was present.
    pub fn unsubscribe(&mut self, event: &str) -> bool {
        let before = self.subscribed_events.len();
        self.subscribed_events.retain(|e| e != event);
        self.subscribed_events.len() != before
    }

    /// Whether `event` is among the declared interests.
    pub fn is_subscribed(&self, event: &str) -> bool {
        self.subscribed_events.iter().any(|e| e == event)
    }

    /// Detached copy of the public fields.
    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            subscribed_events: self.subscribed_events.clone(),
        }
    }
}
