//! Server configuration.

use std::time::Duration;

use eman_settings::EmanSettings;
use serde::{Deserialize, Serialize};

/// Configuration for the broker server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (`0` auto-assigns).
    pub port: u16,
    /// Per-connection outbound queue length.
    pub max_send_queue: usize,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Drop a peer silent for this many milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Deadline for a connection to come online, in milliseconds.
    pub handshake_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&EmanSettings::default())
    }
}

impl From<&EmanSettings> for ServerConfig {
    fn from(settings: &EmanSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_send_queue: server.max_send_queue,
            heartbeat_interval_ms: server.heartbeat_interval_ms,
            heartbeat_timeout_ms: server.heartbeat_timeout_ms,
            max_message_size: server.max_message_size,
            handshake_timeout_ms: settings.handshake.timeout_ms,
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Ping period for each session writer.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which a peer is dropped.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// The slice of settings the broker event loop needs.
    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }
}

/// Broker event loop settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Deadline from `shake_who` to `shake_online`.
    pub handshake_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        ServerConfig::default().broker()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 9001);
        assert_eq!(cfg.max_send_queue, 256);
        assert_eq!(cfg.handshake_timeout_ms, 2000);
        assert_eq!(cfg.max_message_size, 16 * 1024 * 1024);
    }

    #[test]
    fn from_custom_settings() {
        let mut settings = EmanSettings::default();
        settings.server.port = 7000;
        settings.handshake.timeout_ms = 150;
        let cfg = ServerConfig::from(&settings);
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.broker().handshake_timeout, Duration::from_millis(150));
    }

    #[test]
    fn bind_addr_format() {
        let cfg = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn heartbeat_durations() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn broker_config_default() {
        assert_eq!(BrokerConfig::default().handshake_timeout, Duration::from_secs(2));
    }
}
