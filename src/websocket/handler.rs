//! Axum upgrade handler and per-connection read/write tasks (spec §4.E, §6).

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

use super::client::Client;
use super::hub::Hub;
use super::messages::{message_type, FleetEnvelope};

#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    pub tenant_id: String,
    pub user_id: Option<String>,
}

/// Upgrade an HTTP request to a WebSocket connection. The caller must supply
/// `tenant_id`; `user_id` is optional but required to receive per-user
/// broadcasts.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if params.tenant_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "tenant_id is required").into_response();
    }

    let hub = state.hub().clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub, params.tenant_id, params.user_id))
}

async fn handle_socket(socket: WebSocket, hub: Hub, tenant_id: String, user_id: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Message>(hub.config().send_buffer_size);

    let client = hub.register(Client::new(tenant_id.clone(), user_id.clone(), tx.clone()));
    let id = client.id;

    let established = FleetEnvelope::tagged(
        message_type::CONNECTION_ESTABLISHED,
        serde_json::json!({ "connection_id": id.to_string() }),
        Some(tenant_id),
        user_id,
    );
    if let Ok(json) = established.to_json() {
        let _ = tx.try_send(Message::Text(json.into()));
    }

    let cancel = CancellationToken::new();

    let write_cancel = cancel.clone();
    let mut write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = write_cancel.cancelled() => break,
                maybe_message = rx.recv() => {
                    match maybe_message {
                        Some(message) => {
                            if sink.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    let ping_cancel = cancel.clone();
    let ping_client = client.clone();
    let ping_sender = tx.clone();
    let ping_interval = hub.config().ping_interval();
    let pong_deadline = chrono::Duration::from_std(hub.config().pong_deadline()).unwrap_or(chrono::Duration::seconds(60));
    let mut ping_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = ping_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if Utc::now() - ping_client.last_pong_at() > pong_deadline {
                        tracing::debug!(connection_id = %ping_client.id, "websocket client missed pong deadline");
                        break;
                    }
                    if ping_sender.try_send(Message::Ping(Vec::new().into())).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let max_frame = hub.config().max_inbound_frame_bytes;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Pong(_))) => client.touch_pong(),
                    Some(Ok(Message::Text(text))) if text.len() > max_frame => {
                        tracing::debug!(connection_id = %id, size = text.len(), "dropping oversized inbound websocket frame");
                    }
                    Some(Ok(Message::Binary(data))) if data.len() > max_frame => {
                        tracing::debug!(connection_id = %id, size = data.len(), "dropping oversized inbound websocket frame");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = write_task.await;
    ping_task.abort();
    hub.unregister(&id);
}

