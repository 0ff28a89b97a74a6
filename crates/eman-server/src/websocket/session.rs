//! WebSocket session lifecycle: handles a single connected client from
//! upgrade through disconnect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use crate::broker::{BrokerEvent, BrokerHandle};
use crate::config::ServerConfig;
use crate::ids::ConnectionId;
use crate::protocol::Frame;

/// How long the writer gets to flush queued frames after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What one inbound WebSocket message means to the broker.
#[derive(Debug, PartialEq)]
enum Inbound {
    Frame(Frame),
    /// Not UTF-8 or not a frame; reported as a connection error.
    Undecodable(String),
    Close,
    /// Ping/Pong, already handled by the transport.
    Control,
}

fn decode(msg: Message) -> Inbound {
    let text = match msg {
        Message::Text(t) => t.to_string(),
        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
            Ok(s) => s,
            Err(e) => return Inbound::Undecodable(format!("binary frame is not UTF-8: {e}")),
        },
        Message::Close(_) => return Inbound::Close,
        Message::Ping(_) | Message::Pong(_) => return Inbound::Control,
    };
    match Frame::parse(&text) {
        Ok(frame) => Inbound::Frame(frame),
        Err(e) => Inbound::Undecodable(format!("undecodable frame: {e}")),
    }
}

/// Run a WebSocket session for a connected client.
///
/// 1. Announces the connection to the broker (which sends `shake_who`)
/// 2. Forwards decoded inbound frames to the broker
/// 3. Writes queued outbound frames and periodic Ping frames
/// 4. Closes the socket when the broker asks for it
/// 5. Reports the disconnect once the socket is gone
#[instrument(skip_all, fields(conn_id = %conn_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    conn_id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    broker: BrokerHandle,
    config: Arc<ServerConfig>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(config.max_send_queue);
    let connection = Arc::new(ClientConnection::new(conn_id.clone(), remote_addr, send_tx));
    let close = connection.close_token();

    if broker
        .send(BrokerEvent::Connected(Arc::clone(&connection)))
        .await
        .is_err()
    {
        warn!("broker unavailable, refusing connection");
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    }

    // Outbound forwarder with periodic Ping frames.
    let outbound_conn = Arc::clone(&connection);
    let outbound_close = close.clone();
    let heartbeat_interval = config.heartbeat_interval();
    let heartbeat_timeout = config.heartbeat_timeout();
    let mut outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                biased;
                msg = send_rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                () = outbound_close.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                _ = ping_interval.tick() => {
                    if outbound_conn.is_unresponsive(heartbeat_timeout) {
                        warn!("client unresponsive for {heartbeat_timeout:?}, disconnecting");
                        break;
                    }
                    if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        // Stops the reader when the writer gave up first.
        outbound_close.cancel();
    });

    loop {
        let next = tokio::select! {
            () = close.cancelled() => break,
            next = ws_rx.next() => next,
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                let _ = broker
                    .send(BrokerEvent::TransportError {
                        conn_id: conn_id.clone(),
                        error: e.to_string(),
                    })
                    .await;
                break;
            }
            None => break,
        };
        connection.touch();

        let event = match decode(msg) {
            Inbound::Frame(frame) => BrokerEvent::Frame {
                conn_id: conn_id.clone(),
                frame,
            },
            Inbound::Undecodable(error) => BrokerEvent::TransportError {
                conn_id: conn_id.clone(),
                error,
            },
            Inbound::Close => {
                debug!("client sent close frame");
                break;
            }
            Inbound::Control => continue,
        };
        if broker.send(event).await.is_err() {
            warn!("broker unavailable, closing connection");
            break;
        }
    }

    connection.disconnect();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut outbound).await.is_err() {
        outbound.abort();
    }
    info!(age = ?connection.age(), "socket closed");
    let _ = broker.send(BrokerEvent::Disconnected { conn_id }).await;
}
