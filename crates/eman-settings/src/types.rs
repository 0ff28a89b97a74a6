//! Settings type definitions.
//!
//! Every type is `#[serde(default)]`, so a partial JSON file only needs to
//! name the values it changes.

use serde::{Deserialize, Serialize};

/// Root settings type for the broker.
///
/// ```json
/// {
///   "server": { "port": 9001 },
///   "handshake": { "timeoutMs": 2000 },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmanSettings {
    /// Network and connection settings.
    pub server: ServerSettings,
    /// Handshake protocol settings.
    pub handshake: HandshakeSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

/// Server network and connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listening port for both HTTP and WebSocket traffic.
    pub port: u16,
    /// Per-connection outbound queue length before messages are dropped.
    pub max_send_queue: usize,
    /// Interval between server pings, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a peer is dropped, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Maximum accepted WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9001,
            max_send_queue: 256,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Handshake protocol settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandshakeSettings {
    /// Deadline for a connection to go from `shake_who` to `shake_online`.
    pub timeout_ms: u64,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
