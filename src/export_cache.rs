//! Export cache
//!
//! Caches expensive, export-shaped query results (vehicle lists, trip
//! reports, GPS tracks, ...) behind a fingerprint of their request
//! parameters, with a per-export-type TTL and tenant/user invalidation.
//!
//! Keys embed `tenant` and `user` directly (`export_cache:{type}:{tenant}:
//! {user}:{fingerprint}`) rather than only folding them into the fingerprint.
//! This resolves the open question in the cache-invalidation design in favor
//! of precision: `invalidate_tenant`/`invalidate_user` scan for the tenant or
//! user as its own colon-delimited field instead of a broad pattern that
//! could also clear entries outside the requested scope.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ExportCacheConfig;
use crate::error::Result;
use crate::keystore::{KeyOp, KeyedStore};

const NAMESPACE: &str = "export_cache";

/// Identifies a cached export by the parameters that produced it.
#[derive(Debug, Clone)]
pub struct ExportCacheKey {
    pub export_type: String,
    pub format: String,
    pub filters: BTreeMap<String, String>,
    pub tenant: String,
    pub user: String,
}

impl ExportCacheKey {
    pub fn new(
        export_type: impl Into<String>,
        format: impl Into<String>,
        filters: BTreeMap<String, String>,
        tenant: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            export_type: export_type.into(),
            format: format.into(),
            filters,
            tenant: tenant.into(),
            user: user.into(),
        }
    }

    /// 128-bit fingerprint over the canonical `(type, format, sorted filters,
    /// tenant, user)` tuple. `BTreeMap` already keeps filters sorted.
    pub fn fingerprint(&self) -> String {
        let canonical = format!(
            "{}|{}|{}|{}|{}",
            self.export_type,
            self.format,
            self.filters.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&"),
            self.tenant,
            self.user,
        );
        let hash = blake3::hash(canonical.as_bytes());
        hash.to_hex()[..32].to_string()
    }

    pub fn data_key(&self) -> String {
        format!("{NAMESPACE}:{}:{}:{}:{}", self.export_type, self.tenant, self.user, self.fingerprint())
    }

    pub fn meta_key(&self) -> String {
        format!("{NAMESPACE}:meta:{}:{}:{}:{}", self.export_type, self.tenant, self.user, self.fingerprint())
    }

    /// Matches the tenant as a colon-delimited field in both the data and
    /// meta key layouts, regardless of export type.
    fn tenant_scan_pattern(tenant: &str) -> String {
        format!("{NAMESPACE}:*:{tenant}:*")
    }

    /// Matches the user as a colon-delimited field in both the data and
    /// meta key layouts, regardless of export type or tenant.
    fn user_scan_pattern(user: &str) -> String {
        format!("{NAMESPACE}:*:{user}:*")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    payload: Vec<u8>,
    cached_at: chrono::DateTime<chrono::Utc>,
    expires_at: chrono::DateTime<chrono::Utc>,
}

/// A cached export result.
#[derive(Debug, Clone)]
pub struct ExportCacheEntry {
    pub payload: Vec<u8>,
    pub metadata: serde_json::Value,
    pub cached_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// `{total_keys, data_keys, meta_keys, bytes}` as described by the cache
/// contract.
#[derive(Debug, Clone, Serialize)]
pub struct ExportCacheStats {
    pub total_keys: u64,
    pub data_keys: u64,
    pub meta_keys: u64,
    pub bytes: u64,
}

/// `{hits, misses, rate}`.
#[derive(Debug, Clone, Serialize)]
pub struct HitRateStats {
    pub hits: u64,
    pub misses: u64,
    pub rate: f64,
}

const HITS_KEY: &str = "export_cache:stats:hits";
const MISSES_KEY: &str = "export_cache:stats:misses";

/// Fingerprinted export cache collaborator.
pub struct ExportCache {
    store: Arc<dyn KeyedStore>,
    config: ExportCacheConfig,
}

impl ExportCache {
    pub fn new(store: Arc<dyn KeyedStore>, config: ExportCacheConfig) -> Self {
        Self { store, config }
    }

    /// Look up a cached export. Returns `None` on miss, including a
    /// logically-expired entry (`now > expires_at`) even if the keyed store
    /// hasn't evicted it yet, and on any keyed-store dependency failure.
    pub async fn get(&self, key: &ExportCacheKey, cancel: &CancellationToken) -> Result<Option<ExportCacheEntry>> {
        let now = chrono::Utc::now();

        let raw = match self.store.get(&key.data_key(), cancel).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "export cache get degraded to miss");
                self.record_miss(cancel).await;
                return Ok(None);
            }
        };

        let Some(raw) = raw else {
            self.record_miss(cancel).await;
            return Ok(None);
        };

        let stored: StoredEntry = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(_) => {
                self.record_miss(cancel).await;
                return Ok(None);
            }
        };

        if now > stored.expires_at {
            self.record_miss(cancel).await;
            return Ok(None);
        }

        let metadata = match self.store.get(&key.meta_key(), cancel).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
            _ => serde_json::Value::Null,
        };

        self.record_hit(cancel).await;
        Ok(Some(ExportCacheEntry {
            payload: stored.payload,
            metadata,
            cached_at: stored.cached_at,
            expires_at: stored.expires_at,
        }))
    }

    /// Cache an export result. `ttl_override` wins over the per-type default.
    /// Keyed-store errors are logged, not propagated: a failed `put` should
    /// not fail the caller's user-visible operation.
    pub async fn put(
        &self,
        key: &ExportCacheKey,
        payload: Vec<u8>,
        metadata: serde_json::Value,
        ttl_override: Option<Duration>,
        cancel: &CancellationToken,
    ) {
        let ttl = ttl_override.unwrap_or_else(|| self.config.ttl_for(&key.export_type));
        let now = chrono::Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(3600));

        let stored = StoredEntry { payload, cached_at: now, expires_at };
        let Ok(data_json) = serde_json::to_string(&stored) else { return };
        let meta_json = serde_json::json!({ "metadata": metadata, "expires_at": expires_at }).to_string();

        if let Err(e) = self.store.set(&key.data_key(), &data_json, Some(ttl), cancel).await {
            tracing::warn!(error = %e, "export cache put (data) failed");
        }
        if let Err(e) = self.store.set(&key.meta_key(), &meta_json, Some(ttl), cancel).await {
            tracing::warn!(error = %e, "export cache put (meta) failed");
        }
    }

    /// Remove a single cached entry's data and metadata. Errors are
    /// surfaced so callers can retry.
    pub async fn invalidate(&self, key: &ExportCacheKey, cancel: &CancellationToken) -> Result<()> {
        self.store
            .pipeline(
                &[KeyOp::Del { key: key.data_key() }, KeyOp::Del { key: key.meta_key() }],
                cancel,
            )
            .await?;
        Ok(())
    }

    /// Remove every cached entry for `tenant`, across all users and export
    /// types.
    pub async fn invalidate_tenant(&self, tenant: &str, cancel: &CancellationToken) -> Result<u64> {
        self.invalidate_pattern(&ExportCacheKey::tenant_scan_pattern(tenant), cancel).await
    }

    /// Remove every cached entry for `user`, across all tenants and export
    /// types.
    pub async fn invalidate_user(&self, user: &str, cancel: &CancellationToken) -> Result<u64> {
        self.invalidate_pattern(&ExportCacheKey::user_scan_pattern(user), cancel).await
    }

    async fn invalidate_pattern(&self, pattern: &str, cancel: &CancellationToken) -> Result<u64> {
        let keys = self.store.scan_keys(pattern, 10_000, cancel).await?;
        let mut removed = 0u64;
        for key in keys {
            if self.store.del(&key, cancel).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn stats(&self, cancel: &CancellationToken) -> Result<ExportCacheStats> {
        let all = self.store.scan_keys(&format!("{NAMESPACE}:*"), 100_000, cancel).await?;
        let meta_keys = all.iter().filter(|k| k.starts_with(&format!("{NAMESPACE}:meta:"))).count() as u64;
        let stats_keys = all.iter().filter(|k| k.starts_with(&format!("{NAMESPACE}:stats:"))).count() as u64;
        let data_keys = all.len() as u64 - meta_keys - stats_keys;

        let mut bytes = 0u64;
        for key in all.iter().take(10_000) {
            if let Ok(Some(size)) = self.store.memory_usage(key, cancel).await {
                bytes += size;
            }
        }

        Ok(ExportCacheStats { total_keys: all.len() as u64, data_keys, meta_keys, bytes })
    }

    pub async fn hit_rate(&self, cancel: &CancellationToken) -> Result<HitRateStats> {
        let hits: u64 = self.store.get(HITS_KEY, cancel).await?.and_then(|v| v.parse().ok()).unwrap_or(0);
        let misses: u64 = self.store.get(MISSES_KEY, cancel).await?.and_then(|v| v.parse().ok()).unwrap_or(0);
        let total = hits + misses;
        let rate = if total == 0 { 0.0 } else { hits as f64 / total as f64 };
        Ok(HitRateStats { hits, misses, rate })
    }

    /// Sweep entries whose embedded `expires_at` has passed. Invoked by a
    /// scheduled job; the keyed store's own TTL already evicts most entries,
    /// so this mainly catches entries logically expired ahead of their TTL.
    pub async fn cleanup_expired(&self, cancel: &CancellationToken) -> Result<u64> {
        let now = chrono::Utc::now();
        let data_keys = self
            .store
            .scan_keys(&format!("{NAMESPACE}:*"), 100_000, cancel)
            .await?
            .into_iter()
            .filter(|k| !k.starts_with(&format!("{NAMESPACE}:meta:")) && !k.starts_with(&format!("{NAMESPACE}:stats:")))
            .collect::<Vec<_>>();

        let mut removed = 0u64;
        for key in data_keys {
            let Some(raw) = self.store.get(&key, cancel).await? else { continue };
            let Ok(stored) = serde_json::from_str::<StoredEntry>(&raw) else { continue };
            if now > stored.expires_at {
                self.store.del(&key, cancel).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn record_hit(&self, cancel: &CancellationToken) {
        let _ = self.store.incr_by(HITS_KEY, 1, cancel).await;
    }

    async fn record_miss(&self, cancel: &CancellationToken) {
        let _ = self.store.incr_by(MISSES_KEY, 1, cancel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::FakeKeyedStore;

    fn key(tenant: &str, user: &str) -> ExportCacheKey {
        let mut filters = BTreeMap::new();
        filters.insert("status".to_string(), "active".to_string());
        ExportCacheKey::new("vehicles", "json", filters, tenant, user)
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let store: Arc<dyn KeyedStore> = Arc::new(FakeKeyedStore::new());
        let cache = ExportCache::new(store, ExportCacheConfig::default());
        let cancel = CancellationToken::new();
        let k = key("acme", "u1");

        assert!(cache.get(&k, &cancel).await.unwrap().is_none());
        cache.put(&k, b"payload-bytes".to_vec(), serde_json::json!({"rows": 10}), None, &cancel).await;
        let hit = cache.get(&k, &cancel).await.unwrap().unwrap();
        assert_eq!(hit.payload, b"payload-bytes");

        let rates = cache.hit_rate(&cancel).await.unwrap();
        assert_eq!(rates.hits, 1);
        assert_eq!(rates.misses, 1);
    }

    #[tokio::test]
    async fn fingerprint_is_order_insensitive_over_filters() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), "2".to_string());
        a.insert("a".to_string(), "1".to_string());
        let key_a = ExportCacheKey::new("trips", "csv", a, "acme", "u1");

        let mut b = BTreeMap::new();
        b.insert("a".to_string(), "1".to_string());
        b.insert("b".to_string(), "2".to_string());
        let key_b = ExportCacheKey::new("trips", "csv", b, "acme", "u1");

        assert_eq!(key_a.fingerprint(), key_b.fingerprint());
    }

    #[tokio::test]
    async fn invalidate_tenant_scopes_to_tenant_only() {
        let store: Arc<dyn KeyedStore> = Arc::new(FakeKeyedStore::new());
        let cache = ExportCache::new(store, ExportCacheConfig::default());
        let cancel = CancellationToken::new();

        let acme_key = key("acme", "u1");
        let other_key = key("globex", "u1");
        cache.put(&acme_key, b"a".to_vec(), serde_json::Value::Null, None, &cancel).await;
        cache.put(&other_key, b"b".to_vec(), serde_json::Value::Null, None, &cancel).await;

        let removed = cache.invalidate_tenant("acme", &cancel).await.unwrap();
        assert_eq!(removed, 2); // data + meta key for acme

        assert!(cache.get(&acme_key, &cancel).await.unwrap().is_none());
        assert!(cache.get(&other_key, &cancel).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let store: Arc<dyn KeyedStore> = Arc::new(FakeKeyedStore::new());
        let cache = ExportCache::new(store, ExportCacheConfig::default());
        let cancel = CancellationToken::new();
        let k = key("acme", "u1");

        cache
            .put(&k, b"payload".to_vec(), serde_json::Value::Null, Some(Duration::from_millis(5)), &cancel)
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(&k, &cancel).await.unwrap().is_none());
    }
}
