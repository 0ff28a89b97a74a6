//! # eman-server
//!
//! Service broker over WebSocket.
//!
//! - Handshake: `shake_who` → `shake_i_am` → `shake_id` → `shake_ready` → `shake_online`
//! - Service registry keyed by broker-issued ids
//! - Request broadcast to every online service, responses routed back to the requester
//! - HTTP endpoints: identity, service snapshot, health, Prometheus metrics
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod broker;
pub mod config;
pub mod errors;
pub mod health;
pub mod ids;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod validation;
pub mod websocket;

pub use broker::{Broker, BrokerEvent, BrokerHandle, BrokerStats};
pub use config::{BrokerConfig, ServerConfig};
pub use errors::{BrokerError, ServerError, ServiceError};
pub use ids::{ConnectionId, ServiceId};
pub use protocol::Frame;
pub use registry::{Service, ServiceInfo, ServiceRegistry};
pub use server::EmanServer;
