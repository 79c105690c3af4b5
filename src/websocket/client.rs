//! A single hub-registered WebSocket client (spec §3.5).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Unique identifier for a hub-registered connection, synthesized from a
/// fresh UUID (the spec's "tenant, user, monotonic suffix" composition is
/// satisfied by the hub's indexes rather than embedded in the id itself).
#[derive(Clone, Copy, Eq)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq for ConnectionId {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Hash for ConnectionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl From<Uuid> for ConnectionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A client registered with the [`super::hub::Hub`] for the lifetime of its
/// connection. Holds the bounded send buffer the hub writes into; a full
/// buffer means the client is evicted rather than the publisher blocking.
pub struct Client {
    pub id: ConnectionId,
    pub tenant_id: String,
    pub user_id: Option<String>,
    sender: mpsc::Sender<Message>,
    last_pong_at: AtomicI64,
}

impl Client {
    pub fn new(tenant_id: impl Into<String>, user_id: Option<String>, sender: mpsc::Sender<Message>) -> Self {
        Self {
            id: ConnectionId::new(),
            tenant_id: tenant_id.into(),
            user_id,
            sender,
            last_pong_at: AtomicI64::new(Utc::now().timestamp()),
        }
    }

    /// Attempt to deliver a frame without waiting. Returns `false` if the
    /// client's send buffer is full or closed, the signal the hub uses to
    /// evict the client.
    pub fn try_send(&self, message: Message) -> bool {
        self.sender.try_send(message).is_ok()
    }

    pub fn touch_pong(&self) {
        self.last_pong_at.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_pong_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_pong_at.load(Ordering::Relaxed), 0).unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_uniqueness_and_display() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert!(!format!("{a}").is_empty());
    }

    #[tokio::test]
    async fn try_send_fails_once_buffer_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let client = Client::new("tenant-1", Some("user-1".into()), tx);
        assert!(client.try_send(Message::Text("first".into())));
        assert!(!client.try_send(Message::Text("second".into())));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn touch_pong_updates_last_pong_at() {
        let (tx, _rx) = mpsc::channel(4);
        let client = Client::new("tenant-1", None, tx);
        let before = client.last_pong_at();
        client.touch_pong();
        assert!(client.last_pong_at() >= before);
    }
}
