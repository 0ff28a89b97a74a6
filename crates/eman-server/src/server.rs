//! `EmanServer`: Axum HTTP + WebSocket server in front of the broker loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::broker::{Broker, BrokerHandle};
use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::ids::ConnectionId;
use crate::metrics;
use crate::shutdown::{DrainReport, ShutdownCoordinator};
use crate::websocket::session::run_ws_session;

/// WebSocket endpoint path.
pub const COMMUNICATION_PATH: &str = "/communication";

/// Identity reported by `GET /`.
const BROKER_ID: &str = "eman";

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Sender side of the broker loop.
    pub broker: BrokerHandle,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The broker server.
pub struct EmanServer {
    config: Arc<ServerConfig>,
    broker: BrokerHandle,
    broker_task: Option<JoinHandle<()>>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl EmanServer {
    /// Create a server and start its broker loop. Must run inside a Tokio runtime.
    pub fn new(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let (broker, handle) = Broker::new(config.broker());
        let broker_task = tokio::spawn(broker.run(shutdown.token()));
        Self {
            config: Arc::new(config),
            broker: handle,
            broker_task: Some(broker_task),
            shutdown,
            start_time: Instant::now(),
            metrics,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            broker: self.broker.clone(),
            config: Arc::clone(&self.config),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/", get(identity_handler))
            .route(COMMUNICATION_PATH, get(ws_handler))
            .route("/services", get(services_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address and the serving task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

        let app = self.router();
        let token = self.shutdown.token();
        info!(%local_addr, "eman server listening");

        let task = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                error!(error = %e, "server error");
            }
        });
        Ok((local_addr, task))
    }

    /// Stop serving and wait for the broker loop and `serve` task to finish.
    pub async fn stop(mut self, serve: JoinHandle<()>, timeout: Option<Duration>) -> DrainReport {
        let mut tasks = vec![("http", serve)];
        tasks.extend(self.broker_task.take().map(|task| ("broker", task)));
        self.shutdown.drain(tasks, timeout).await
    }

    /// Get the broker handle.
    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

}

/// GET /
async fn identity_handler() -> Json<serde_json::Value> {
    Json(json!({ "result": { "id": BROKER_ID } }))
}

/// GET /communication
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let conn_id = ConnectionId::new();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| {
            run_ws_session(socket, conn_id, Some(remote_addr), state.broker, state.config)
        })
}

/// GET /services
async fn services_handler(State(state): State<AppState>) -> Response {
    match state.broker.snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => unavailable(&e),
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Result<Json<HealthResponse>, Response> {
    let stats = state.broker.stats().await.map_err(|e| unavailable(&e))?;
    Ok(Json(health::health_check(state.start_time, stats)))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

fn unavailable(err: &ServerError) -> Response {
    error!(error = %err, "request failed");
    let body = json!({
        "error": { "message": err.to_string(), "code": "unavailable", "status": 503 }
    });
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}
