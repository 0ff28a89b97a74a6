//! Prometheus exposition for broker activity.
//!
//! Call sites record through the `metrics` facade with the names below; the
//! binary installs the global recorder and `/metrics` renders it.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the process-wide recorder. Fails if one is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("metrics recorder installed");
    Ok(handle)
}

/// Text exposition of everything recorded so far.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Sockets accepted.
pub const WS_CONNECTIONS_TOTAL: &str = "eman_ws_connections_total";
/// Sockets closed.
pub const WS_DISCONNECTIONS_TOTAL: &str = "eman_ws_disconnections_total";
/// Gauge.
pub const WS_CONNECTIONS_ACTIVE: &str = "eman_ws_connections_active";
/// Histogram, seconds from accept to disconnect.
pub const WS_CONNECTION_DURATION_SECONDS: &str = "eman_ws_connection_duration_seconds";
/// Frames discarded on a full or closed send queue.
pub const WS_SEND_DROPS_TOTAL: &str = "eman_ws_send_drops_total";
/// Handshakes that reached online.
pub const HANDSHAKES_COMPLETED_TOTAL: &str = "eman_handshakes_completed_total";
/// Labelled by error `code`.
pub const HANDSHAKES_FAILED_TOTAL: &str = "eman_handshakes_failed_total";
/// Histogram, seconds from `shake_who` to `shake_online`.
pub const HANDSHAKE_DURATION_SECONDS: &str = "eman_handshake_duration_seconds";
/// Gauge of connections past the handshake.
pub const SERVICES_ONLINE: &str = "eman_services_online";
/// Requests broadcast to `request_flow`.
pub const REQUESTS_ROUTED_TOTAL: &str = "eman_requests_routed_total";
/// Responses accepted for delivery.
pub const RESPONSES_ROUTED_TOTAL: &str = "eman_responses_routed_total";
/// Labelled by `event` and `code`.
pub const ROUTING_ERRORS_TOTAL: &str = "eman_routing_errors_total";

#[cfg(test)]
mod tests {
    use metrics::counter;

    use super::*;

    #[test]
    fn recorded_counters_are_rendered() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            counter!(REQUESTS_ROUTED_TOTAL).increment(2);
            counter!(HANDSHAKES_FAILED_TOTAL, "code" => "invalid_name").increment(1);
        });
        let text = render(&handle);
        assert!(text.contains("eman_requests_routed_total 2"), "{text}");
        assert!(text.contains(r#"eman_handshakes_failed_total{code="invalid_name"} 1"#), "{text}");
    }

    #[test]
    fn names_share_prefix() {
        for name in [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            WS_SEND_DROPS_TOTAL,
            HANDSHAKES_COMPLETED_TOTAL,
            HANDSHAKES_FAILED_TOTAL,
            HANDSHAKE_DURATION_SECONDS,
            SERVICES_ONLINE,
            REQUESTS_ROUTED_TOTAL,
            RESPONSES_ROUTED_TOTAL,
            ROUTING_ERRORS_TOTAL,
        ] {
            assert!(name.starts_with("eman_"), "{name}");
            assert!(!name.contains(|c: char| c.is_ascii_uppercase() || c == '-'), "{name}");
        }
    }
}
