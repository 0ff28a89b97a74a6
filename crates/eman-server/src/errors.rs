//! Error types for the broker.
//!
//! [`BrokerError`] is the protocol taxonomy surfaced to peers as
//! `{"error": {"message", "code", "status"}}`. [`ServiceError`] covers
//! registry bookkeeping and [`ServerError`] the process plumbing.

use serde_json::{Value, json};
use thiserror::Error;

use crate::ids::ServiceId;
use crate::protocol;

/// Errors reported to a connected peer.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// `shake_i_am` without a usable `name`.
    #[error("Invalid Name")]
    InvalidName,
    /// `shake_i_am` without a `key`.
    #[error("Invalid Secret key")]
    InvalidSecretKey,
    /// `shake_ready` without an `id`.
    #[error("no Service Id")]
    NoId,
    /// `shake_ready` with an id that was not issued to this connection.
    #[error("Invalid Service Id")]
    InvalidId,
    /// The handshake did not complete before the deadline.
    #[error("Handshake Request Timeout")]
    RequestTimeout,
    /// A routed message lacked required fields.
    #[error("No required fields {}", .missing.join(", "))]
    NoRequiredFields {
        /// Names of the absent or empty fields.
        missing: Vec<&'static str>,
    },
    /// A subscription message lacked its `name`.
    #[error("No \"name\" in event data on '{event}'")]
    InvalidServiceData {
        /// The subscription event that was malformed.
        event: &'static str,
    },
    /// The service already declared interest in this event.
    #[error("service {service_id} already listen event {name}")]
    AlreadySubscribed {
        /// Subscribing service.
        service_id: ServiceId,
        /// Event name.
        name: String,
    },
}

impl BrokerError {
    /// Machine-readable error code.
    pub fn code(&self) -> String {
        match self {
            Self::InvalidName => "invalid_name".into(),
            Self::InvalidSecretKey => "invalid_secret_key".into(),
            Self::NoId => "no_id".into(),
            Self::InvalidId => "invalid_id".into(),
            Self::RequestTimeout => "request_timeout".into(),
            Self::NoRequiredFields { .. } => "no_required_fields".into(),
            // "_service:api:request:subscribe" -> "invalid_data_on_service:api:request:subscribe"
            Self::InvalidServiceData { event } => format!("invalid_data_on{event}"),
            Self::AlreadySubscribed { .. } => "already_subscribed".into(),
        }
    }

    /// HTTP-style status.
    pub fn status(&self) -> u16 {
        match self {
            Self::RequestTimeout => 408,
            Self::AlreadySubscribed { .. } => 409,
            _ => 400,
        }
    }

    /// Whether the error ends the connection.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvalidName
                | Self::InvalidSecretKey
                | Self::NoId
                | Self::InvalidId
                | Self::RequestTimeout
        )
    }

    /// Event name the error is delivered under, given the event that caused it.
    pub fn reply_event(&self, cause: &str) -> &'static str {
        match (self, cause) {
            _ if self.is_terminal() => protocol::SHAKE_ERROR,
            (_, protocol::API_RESPONSE) => protocol::API_RESPONSE_ERROR,
            (_, protocol::API_REQUEST) => protocol::API_REQUEST_ERROR,
            _ => protocol::SERVICE_ERROR,
        }
    }

    /// Wire payload for the error event.
    pub fn to_payload(&self) -> Value {
        let mut error = json!({
            "message": self.to_string(),
            "code": self.code(),
            "status": self.status(),
        });
        if let Self::NoRequiredFields { missing } = self {
            error["missing"] = json!(missing);
        }
        json!({ "error": error })
    }
}

/// Registry bookkeeping failures.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// Event name already present in the subscription list.
    #[error("service {service_id} already listen event {name}")]
    AlreadySubscribed {
        /// Service id.
        service_id: ServiceId,
        /// Event name.
        name: String,
    },
    /// A connection is already bound to the service.
    #[error("service {service_id} is already bound to a connection")]
    AlreadyBound {
        /// Service id.
        service_id: ServiceId,
    },
}

impl From<ServiceError> for BrokerError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::AlreadySubscribed { service_id, name } => {
                Self::AlreadySubscribed { service_id, name }
            }
            ServiceError::AlreadyBound { .. } => Self::InvalidId,
        }
    }
}

/// Errors raised while starting or querying the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding the listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Reading the bound address failed.
    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] std::io::Error),
    /// The broker event loop is no longer running.
    #[error("broker event loop is not running")]
    BrokerUnavailable,
}
