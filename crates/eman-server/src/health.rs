//! Liveness report served at `/health`.

use std::time::Instant;

use serde::Serialize;

use crate::broker::BrokerStats;

/// Body of a successful `/health` reply.
///
/// Only produced while the broker loop answers; a dead loop is reported as
/// 503 by the handler instead.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live broker counters, inlined.
    #[serde(flatten)]
    pub stats: BrokerStats,
}

/// Build the report from the start instant and current counters.
pub fn health_check(start_time: Instant, stats: BrokerStats) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_secs: start_time.elapsed().as_secs(),
        stats,
    }
}
