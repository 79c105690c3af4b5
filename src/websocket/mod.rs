//! Real-time fan-out hub (spec component E).
//!
//! Connections upgrade from HTTP on the same port as the rest of the admin
//! surface. Each client is tagged with a tenant and optional user, registered
//! with a [`Hub`] for the lifetime of the connection, and reachable via
//! `broadcast_all`/`broadcast_tenant`/`broadcast_user`. A bridge task
//! subscribes to the keyed store's pub/sub channel so a broadcast issued on
//! one node reaches clients connected to any other node.
//!
//! ```rust,ignore
//! use fleet_core::prelude::*;
//!
//! async fn notify(hub: &Hub, cancel: &tokio_util::sync::CancellationToken) {
//!     let envelope = FleetEnvelope::new("alert", serde_json::json!({"msg": "geofence breach"}));
//!     hub.broadcast_tenant("tenant-1", envelope, cancel).await.ok();
//! }
//! ```

mod client;
mod handler;
mod hub;
mod messages;

pub use client::{Client, ConnectionId};
pub use handler::{ws_upgrade, WsConnectParams};
pub use hub::Hub;
pub use messages::{BroadcastScope, FleetEnvelope};

/// Alias kept for callers that think of the hub's tunables as its own config
/// type rather than a section of [`crate::config::Config`].
pub use crate::config::WebSocketHubConfig as HubConfig;

pub use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
