//! Real-time fan-out hub (spec component E / §4.E).
//!
//! A [`Hub`] keeps a process-local client registry indexed by tenant and by
//! `(tenant, user)`. Broadcast helpers deliver locally and publish on the
//! configured pub/sub channel so peer nodes relay the same message; a bridge
//! task (submitted to the same [`BackgroundWorker`] the job engine uses)
//! subscribes to that channel and rebroadcasts locally.
//!
//! Loopback is handled two ways. The originating node tags its publish with
//! its own `node_id`; its own bridge loop recognizes that tag and skips
//! redelivering a message it already delivered synchronously. Every other
//! node claims a short-lived marker in the keyed store before delivering, so
//! two peer nodes racing on the same message only deliver it once each.

use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::{DashMap, DashSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agents::BackgroundWorker;
use crate::config::WebSocketHubConfig;
use crate::error::Result;
use crate::keystore::KeyedStore;

use super::client::{Client, ConnectionId};
use super::messages::{BridgeMessage, BridgeScope, BroadcastScope, FleetEnvelope};

fn dedup_key(message_id: &str) -> String {
    format!("ws:dedup:{message_id}")
}

/// Coordinates client registration, fan-out, and the cross-node pub/sub
/// bridge behind a cheaply-`Clone`able handle.
#[derive(Clone)]
pub struct Hub {
    clients: Arc<DashMap<ConnectionId, Arc<Client>>>,
    by_tenant: Arc<DashMap<String, DashSet<ConnectionId>>>,
    by_tenant_user: Arc<DashMap<(String, String), DashSet<ConnectionId>>>,
    store: Arc<dyn KeyedStore>,
    config: Arc<WebSocketHubConfig>,
    shutdown: CancellationToken,
    node_id: String,
}

impl Hub {
    /// Construct the hub and submit its pub/sub bridge task to `background`.
    /// The bridge runs until `shutdown` is cancelled.
    pub async fn start(
        store: Arc<dyn KeyedStore>,
        config: WebSocketHubConfig,
        background: &BackgroundWorker,
        shutdown: CancellationToken,
    ) -> Self {
        let hub = Self {
            clients: Arc::new(DashMap::new()),
            by_tenant: Arc::new(DashMap::new()),
            by_tenant_user: Arc::new(DashMap::new()),
            store,
            config: Arc::new(config),
            shutdown,
            node_id: Uuid::new_v4().to_string(),
        };

        let bridge_hub = hub.clone();
        background
            .submit("websocket-pubsub-bridge", move || async move { bridge_hub.bridge_loop().await })
            .await;

        hub
    }

    pub fn config(&self) -> &WebSocketHubConfig {
        &self.config
    }

    /// Register a newly-upgraded connection and return a handle to it.
    pub fn register(&self, client: Client) -> Arc<Client> {
        let client = Arc::new(client);
        let id = client.id;
        let tenant_id = client.tenant_id.clone();

        self.clients.insert(id, client.clone());
        self.by_tenant.entry(tenant_id.clone()).or_default().insert(id);
        if let Some(user_id) = client.user_id.clone() {
            self.by_tenant_user.entry((tenant_id, user_id)).or_default().insert(id);
        }

        tracing::debug!(connection_id = %id, "websocket client registered");
        client
    }

    /// Remove a client and clear its index entries. Safe to call more than
    /// once for the same id.
    pub fn unregister(&self, id: &ConnectionId) {
        let Some((_, client)) = self.clients.remove(id) else { return };

        if let Some(mut set) = self.by_tenant.get_mut(&client.tenant_id) {
            set.remove(id);
        }
        if let Some(user_id) = &client.user_id {
            if let Some(mut set) = self.by_tenant_user.get_mut(&(client.tenant_id.clone(), user_id.clone())) {
                set.remove(id);
            }
        }

        tracing::debug!(connection_id = %id, "websocket client unregistered");
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_registered(&self, id: &ConnectionId) -> bool {
        self.clients.contains_key(id)
    }

    pub async fn broadcast_all(&self, envelope: FleetEnvelope, cancel: &CancellationToken) -> Result<usize> {
        self.deliver_and_publish(BroadcastScope::All, envelope, cancel).await
    }

    pub async fn broadcast_tenant(
        &self,
        tenant_id: impl Into<String>,
        envelope: FleetEnvelope,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        self.deliver_and_publish(BroadcastScope::Tenant(tenant_id.into()), envelope, cancel).await
    }

    pub async fn broadcast_user(
        &self,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        envelope: FleetEnvelope,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        self.deliver_and_publish(BroadcastScope::User(tenant_id.into(), user_id.into()), envelope, cancel).await
    }

    /// Deliver locally (evicting clients whose send buffer is full) and
    /// publish for other nodes. Does not touch the shared dedup marker: this
    /// node's own delivery already happened synchronously above, so its
    /// bridge loop must recognize and skip its own echo rather than race
    /// every peer node to claim the marker first.
    async fn deliver_and_publish(
        &self,
        scope: BroadcastScope,
        envelope: FleetEnvelope,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let delivered = self.deliver_local(&scope, &envelope);

        let bridge_message = BridgeMessage {
            message_id: Uuid::new_v4().to_string(),
            origin_node: self.node_id.clone(),
            scope: BridgeScope::from(&scope),
            envelope,
        };
        match serde_json::to_string(&bridge_message) {
            Ok(json) => {
                if let Err(e) = self.store.publish(&self.config.pubsub_channel, &json, cancel).await {
                    tracing::warn!(error = %e, "failed to publish websocket broadcast for cross-node fan-out");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize websocket bridge message"),
        }

        Ok(delivered)
    }

    /// Deliver to the local client set only, evicting any client whose send
    /// buffer is full or closed. Returns the number of clients reached.
    fn deliver_local(&self, scope: &BroadcastScope, envelope: &FleetEnvelope) -> usize {
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize websocket envelope");
                return 0;
            }
        };
        let message = Message::Text(json.into());

        let targets: Vec<ConnectionId> = match scope {
            BroadcastScope::All => self.clients.iter().map(|e| *e.key()).collect(),
            BroadcastScope::Tenant(tenant_id) => self
                .by_tenant
                .get(tenant_id)
                .map(|set| set.iter().map(|e| *e).collect())
                .unwrap_or_default(),
            BroadcastScope::User(tenant_id, user_id) => self
                .by_tenant_user
                .get(&(tenant_id.clone(), user_id.clone()))
                .map(|set| set.iter().map(|e| *e).collect())
                .unwrap_or_default(),
        };

        let mut delivered = 0;
        let mut evict = Vec::new();
        for id in targets {
            let Some(client) = self.clients.get(&id) else { continue };
            if client.try_send(message.clone()) {
                delivered += 1;
            } else {
                evict.push(id);
            }
        }
        for id in evict {
            tracing::debug!(connection_id = %id, "evicting websocket client with full send buffer");
            self.unregister(&id);
        }

        delivered
    }

    /// Subscribes to the cross-node broadcast channel and rebroadcasts
    /// locally, skipping messages this node originated (already delivered
    /// synchronously by `deliver_and_publish`) and messages a peer node has
    /// already claimed.
    async fn bridge_loop(self) -> anyhow::Result<()> {
        let mut subscription = self.store.subscribe(&self.config.pubsub_channel, &self.shutdown).await?;

        while let Some((_channel, payload)) = subscription.recv(&self.shutdown).await {
            let bridge_message: BridgeMessage = match serde_json::from_str(&payload) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode websocket bridge message");
                    continue;
                }
            };

            if bridge_message.origin_node == self.node_id {
                continue;
            }

            let is_new = self
                .store
                .set_nx(&dedup_key(&bridge_message.message_id), "1", Some(self.config.dedup_window()), &self.shutdown)
                .await
                .unwrap_or(false);
            if !is_new {
                continue;
            }

            let scope = match bridge_message.scope {
                BridgeScope::All => BroadcastScope::All,
                BridgeScope::Tenant { tenant_id } => BroadcastScope::Tenant(tenant_id),
                BridgeScope::User { tenant_id, user_id } => BroadcastScope::User(tenant_id, user_id),
            };
            self.deliver_local(&scope, &bridge_message.envelope);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::FakeKeyedStore;
    use tokio::sync::mpsc;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    fn bare_hub() -> Hub {
        bare_hub_with_store(Arc::new(FakeKeyedStore::new()))
    }

    fn bare_hub_with_store(store: Arc<dyn KeyedStore>) -> Hub {
        Hub {
            clients: Arc::new(DashMap::new()),
            by_tenant: Arc::new(DashMap::new()),
            by_tenant_user: Arc::new(DashMap::new()),
            store,
            config: Arc::new(WebSocketHubConfig::default()),
            shutdown: CancellationToken::new(),
            node_id: Uuid::new_v4().to_string(),
        }
    }

    #[tokio::test]
    async fn register_indexes_by_tenant_and_user() {
        let hub = bare_hub();
        let (tx, _rx) = mpsc::channel(4);
        let client = Client::new("tenant-1", Some("user-1".into()), tx);
        let id = client.id;
        hub.register(client);

        assert!(hub.is_registered(&id));
        assert_eq!(hub.client_count(), 1);
    }

    #[tokio::test]
    async fn unregister_clears_indexes() {
        let hub = bare_hub();
        let (tx, _rx) = mpsc::channel(4);
        let client = Client::new("tenant-1", Some("user-1".into()), tx);
        let id = client.id;
        hub.register(client);

        hub.unregister(&id);
        assert!(!hub.is_registered(&id));
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn broadcast_tenant_only_reaches_that_tenants_clients() {
        let hub = bare_hub();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        hub.register(Client::new("tenant-1", None, tx1));
        hub.register(Client::new("tenant-2", None, tx2));

        let cancel = token();
        let envelope = FleetEnvelope::new("alert", serde_json::json!({"msg": "hi"}));
        let delivered = hub.broadcast_tenant("tenant-1", envelope, &cancel).await.unwrap();

        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_send_buffer_evicts_the_client() {
        let hub = bare_hub();
        let (tx, mut rx) = mpsc::channel(1);
        let client = Client::new("tenant-1", None, tx);
        let id = client.id;
        hub.register(client);

        let cancel = token();
        // Fill the buffer so the next broadcast can't be delivered.
        hub.broadcast_all(FleetEnvelope::new("alert", serde_json::json!({})), &cancel).await.unwrap();
        let delivered = hub.broadcast_all(FleetEnvelope::new("alert", serde_json::json!({})), &cancel).await.unwrap();

        assert_eq!(delivered, 0);
        assert!(!hub.is_registered(&id));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn broadcast_user_targets_single_tenant_user_pair() {
        let hub = bare_hub();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        hub.register(Client::new("tenant-1", Some("user-1".into()), tx1));
        hub.register(Client::new("tenant-1", Some("user-2".into()), tx2));

        let cancel = token();
        let delivered = hub
            .broadcast_user("tenant-1", "user-1", FleetEnvelope::new("alert", serde_json::json!({})), &cancel)
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn cross_node_broadcast_reaches_peer_node_clients() {
        let store: Arc<dyn KeyedStore> = Arc::new(FakeKeyedStore::new());
        let hub_a = bare_hub_with_store(store.clone());
        let hub_b = bare_hub_with_store(store.clone());

        let (tx, mut rx) = mpsc::channel(4);
        hub_b.register(Client::new("tenant-1", None, tx));

        let bridge_b = hub_b.clone();
        tokio::spawn(async move {
            let _ = bridge_b.bridge_loop().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let cancel = token();
        let envelope = FleetEnvelope::new("alert", serde_json::json!({"msg": "hi"}));
        let delivered_locally_by_sender =
            hub_a.broadcast_tenant("tenant-1", envelope, &cancel).await.unwrap();
        assert_eq!(delivered_locally_by_sender, 0);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn originating_node_does_not_redeliver_its_own_broadcast() {
        let store: Arc<dyn KeyedStore> = Arc::new(FakeKeyedStore::new());
        let hub = bare_hub_with_store(store.clone());

        let (tx, mut rx) = mpsc::channel(4);
        hub.register(Client::new("tenant-1", None, tx));

        let bridge = hub.clone();
        tokio::spawn(async move {
            let _ = bridge.bridge_loop().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let cancel = token();
        let envelope = FleetEnvelope::new("alert", serde_json::json!({"msg": "hi"}));
        let delivered = hub.broadcast_tenant("tenant-1", envelope, &cancel).await.unwrap();
        assert_eq!(delivered, 1);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
