//! Keyed-store adapter
//!
//! Every collaborator in this crate (job engine, rate limiter, export cache,
//! real-time hub) talks to a single keyed-store abstraction rather than to
//! `redis` directly. This keeps storage semantics (TTLs, blocking pops, pub/sub)
//! in one place and lets tests swap in [`FakeKeyedStore`] instead of a live
//! Redis instance.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::RedisConfig;
use crate::error::{Error, Result};

/// A single pipelined operation.
#[derive(Debug, Clone)]
pub enum KeyOp {
    Set { key: String, value: String, ttl: Option<Duration> },
    Del { key: String },
    Incr { key: String },
    Expire { key: String, ttl: Duration },
}

/// The result of a single pipelined operation.
#[derive(Debug, Clone)]
pub enum KeyOpResult {
    Ok,
    Int(i64),
    Bool(bool),
}

/// An item popped from a blocking multi-key list pop: the key it came from
/// and the value.
pub type PoppedItem = (String, String);

/// A stream of messages received on a subscribed channel.
pub struct Subscription {
    rx: broadcast::Receiver<(String, String)>,
    channel: String,
}

impl Subscription {
    /// Wait for the next message on this channel, or `None` if the
    /// subscription was cancelled via `cancel`.
    pub async fn recv(&mut self, cancel: &CancellationToken) -> Option<(String, String)> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                msg = self.rx.recv() => match msg {
                    Ok((channel, payload)) if channel == self.channel => return Some((channel, payload)),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}

/// Keyed-store operations shared by the job engine, rate limiter, export
/// cache, and real-time hub.
///
/// Every operation accepts a [`CancellationToken`] so long-running or
/// blocking calls (list pops, subscriptions) can be aborted during shutdown
/// without leaking a task.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<Option<String>>;

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Set only if the key does not already exist ("SETNX"); used for dedup.
    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    async fn del(&self, key: &str, cancel: &CancellationToken) -> Result<bool>;

    async fn incr_by(&self, key: &str, delta: i64, cancel: &CancellationToken) -> Result<i64>;

    async fn expire(&self, key: &str, ttl: Duration, cancel: &CancellationToken) -> Result<bool>;

    async fn ttl(&self, key: &str, cancel: &CancellationToken) -> Result<Option<Duration>>;

    /// Cursor-based key scan. Callers MUST use this (not a blocking `KEYS`)
    /// for anything that could match a large keyspace.
    async fn scan_keys(
        &self,
        pattern: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>>;

    async fn list_push_right(&self, key: &str, value: &str, cancel: &CancellationToken) -> Result<i64>;

    /// Block on the first available element across `keys`, in order, up to
    /// `timeout`. Returns `None` on timeout or cancellation.
    async fn list_pop_left_blocking(
        &self,
        keys: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<PoppedItem>>;

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>>;

    async fn list_remove(&self, key: &str, value: &str, cancel: &CancellationToken) -> Result<i64>;

    async fn list_len(&self, key: &str, cancel: &CancellationToken) -> Result<i64>;

    async fn zadd(&self, key: &str, member: &str, score: f64, cancel: &CancellationToken) -> Result<()>;

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>>;

    async fn zrem(&self, key: &str, member: &str, cancel: &CancellationToken) -> Result<bool>;

    /// Optimistic CAS: only set `new` if the current value equals `expected`
    /// (or the key is absent, if `expected` is `None`). Returns
    /// [`Error::Conflict`] when the precondition fails.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn pipeline(&self, ops: &[KeyOp], cancel: &CancellationToken) -> Result<Vec<KeyOpResult>>;

    async fn publish(&self, channel: &str, message: &str, cancel: &CancellationToken) -> Result<()>;

    /// Subscribe to a channel. The returned [`Subscription`] is independent
    /// per-caller; all subscribers to the same channel see every publish.
    async fn subscribe(&self, channel: &str, cancel: &CancellationToken) -> Result<Subscription>;

    async fn memory_usage(&self, key: &str, cancel: &CancellationToken) -> Result<Option<u64>>;
}

/// Production [`KeyedStore`] backed by a Redis (or Redis-compatible) pool.
pub struct RedisKeyedStore {
    pool: deadpool_redis::Pool,
    url: String,
    subscribers: Arc<Mutex<HashMap<String, broadcast::Sender<(String, String)>>>>,
}

impl RedisKeyedStore {
    pub fn new(pool: deadpool_redis::Pool, config: &RedisConfig) -> Self {
        Self {
            pool,
            url: config.url.clone(),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::Dependency(format!("keyed-store pool exhausted: {e}")))
    }
}

#[async_trait]
impl KeyedStore for RedisKeyedStore {
    async fn get(&self, key: &str, _cancel: &CancellationToken) -> Result<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(|e| Error::Redis(Box::new(e)))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                let _: () = conn
                    .set_ex(key, value, ttl.as_secs().max(1))
                    .await
                    .map_err(|e| Error::Redis(Box::new(e)))?;
            }
            None => {
                let _: () = conn.set(key, value).await.map_err(|e| Error::Redis(Box::new(e)))?;
            }
        }
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Redis(Box::new(e)))?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str, _cancel: &CancellationToken) -> Result<bool> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await.map_err(|e| Error::Redis(Box::new(e)))?;
        Ok(removed > 0)
    }

    async fn incr_by(&self, key: &str, delta: i64, _cancel: &CancellationToken) -> Result<i64> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        conn.incr(key, delta).await.map_err(|e| Error::Redis(Box::new(e)))
    }

    async fn expire(&self, key: &str, ttl: Duration, _cancel: &CancellationToken) -> Result<bool> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        conn.expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(|e| Error::Redis(Box::new(e)))
    }

    async fn ttl(&self, key: &str, _cancel: &CancellationToken) -> Result<Option<Duration>> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let secs: i64 = conn.ttl(key).await.map_err(|e| Error::Redis(Box::new(e)))?;
        Ok(if secs >= 0 { Some(Duration::from_secs(secs as u64)) } else { None })
    }

    async fn scan_keys(
        &self,
        pattern: &str,
        limit: usize,
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::Redis(Box::new(e)))?;

            found.extend(batch);
            cursor = next_cursor;

            if cursor == 0 || found.len() >= limit {
                break;
            }
        }

        found.truncate(limit);
        Ok(found)
    }

    async fn list_push_right(&self, key: &str, value: &str, _cancel: &CancellationToken) -> Result<i64> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        conn.rpush(key, value).await.map_err(|e| Error::Redis(Box::new(e)))
    }

    async fn list_pop_left_blocking(
        &self,
        keys: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<PoppedItem>> {
        let mut conn = self.conn().await?;
        let secs = timeout.as_secs_f64().max(0.1);

        let fut = async {
            let reply: Option<(String, String)> = redis::cmd("BLPOP")
                .arg(keys)
                .arg(secs)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::Redis(Box::new(e)))?;
            Ok::<_, Error>(reply)
        };

        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            result = fut => result,
        }
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        conn.lrange(key, start as isize, stop as isize)
            .await
            .map_err(|e| Error::Redis(Box::new(e)))
    }

    async fn list_remove(&self, key: &str, value: &str, _cancel: &CancellationToken) -> Result<i64> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        conn.lrem(key, 0, value).await.map_err(|e| Error::Redis(Box::new(e)))
    }

    async fn list_len(&self, key: &str, _cancel: &CancellationToken) -> Result<i64> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        conn.llen(key).await.map_err(|e| Error::Redis(Box::new(e)))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64, _cancel: &CancellationToken) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let _: () = conn.zadd(key, member, score).await.map_err(|e| Error::Redis(Box::new(e)))?;
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(min).arg(max);
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit as i64);
        }
        cmd.query_async(&mut conn).await.map_err(|e| Error::Redis(Box::new(e)))
    }

    async fn zrem(&self, key: &str, member: &str, _cancel: &CancellationToken) -> Result<bool> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let removed: i64 = conn.zrem(key, member).await.map_err(|e| Error::Redis(Box::new(e)))?;
        Ok(removed > 0)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let current = self.get(key, cancel).await?;
        if current.as_deref() != expected {
            return Err(Error::Conflict(format!(
                "keyed-store CAS failed for '{key}': expected {expected:?}, found {current:?}"
            )));
        }
        self.set(key, new, ttl, cancel).await
    }

    async fn pipeline(&self, ops: &[KeyOp], cancel: &CancellationToken) -> Result<Vec<KeyOpResult>> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let result = match op {
                KeyOp::Set { key, value, ttl } => {
                    self.set(key, value, *ttl, cancel).await?;
                    KeyOpResult::Ok
                }
                KeyOp::Del { key } => KeyOpResult::Bool(self.del(key, cancel).await?),
                KeyOp::Incr { key } => KeyOpResult::Int(self.incr_by(key, 1, cancel).await?),
                KeyOp::Expire { key, ttl } => KeyOpResult::Bool(self.expire(key, *ttl, cancel).await?),
            };
            results.push(result);
        }
        Ok(results)
    }

    async fn publish(&self, channel: &str, message: &str, _cancel: &CancellationToken) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .publish(channel, message)
            .await
            .map_err(|e| Error::Redis(Box::new(e)))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str, _cancel: &CancellationToken) -> Result<Subscription> {
        let mut subs = self.subscribers.lock().await;
        let sender = subs.entry(channel.to_string()).or_insert_with(|| {
            let (tx, _rx) = broadcast::channel(256);
            let tx_clone = tx.clone();
            let url = self.url.clone();
            let channel_owned = channel.to_string();
            tokio::spawn(async move {
                if let Err(e) = run_redis_pubsub_bridge(url, channel_owned, tx_clone).await {
                    tracing::warn!(error = %e, "keyed-store pub/sub bridge task ended");
                }
            });
            tx
        });

        Ok(Subscription { rx: sender.subscribe(), channel: channel.to_string() })
    }

    async fn memory_usage(&self, key: &str, _cancel: &CancellationToken) -> Result<Option<u64>> {
        let mut conn = self.conn().await?;
        redis::cmd("MEMORY")
            .arg("USAGE")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Redis(Box::new(e)))
    }
}

/// Runs for the lifetime of the process: maintains a dedicated Redis pub/sub
/// connection for `channel` and forwards every message into `tx`.
async fn run_redis_pubsub_bridge(
    url: String,
    channel: String,
    tx: broadcast::Sender<(String, String)>,
) -> Result<()> {
    use futures::StreamExt;

    let client = redis::Client::open(url).map_err(|e| Error::Redis(Box::new(e)))?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| Error::Redis(Box::new(e)))?;
    pubsub
        .subscribe(&channel)
        .await
        .map_err(|e| Error::Redis(Box::new(e)))?;

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(_) => continue,
        };
        let _ = tx.send((channel.clone(), payload));
    }
    Ok(())
}

/// In-memory [`KeyedStore`] used by tests. Not shared across processes.
#[derive(Default)]
pub struct FakeKeyedStore {
    strings: DashMap<String, String>,
    expiries: DashMap<String, std::time::Instant>,
    lists: DashMap<String, std::collections::VecDeque<String>>,
    sorted: DashMap<String, Vec<(String, f64)>>,
    channels: Mutex<HashMap<String, broadcast::Sender<(String, String)>>>,
}

impl FakeKeyedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_expired(&self, key: &str) -> bool {
        match self.expiries.get(key) {
            Some(exp) => std::time::Instant::now() >= *exp,
            None => false,
        }
    }

    fn evict_if_expired(&self, key: &str) {
        if self.is_expired(key) {
            self.strings.remove(key);
            self.expiries.remove(key);
        }
    }
}

#[async_trait]
impl KeyedStore for FakeKeyedStore {
    async fn get(&self, key: &str, _cancel: &CancellationToken) -> Result<Option<String>> {
        self.evict_if_expired(key);
        Ok(self.strings.get(key).map(|v| v.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.strings.insert(key.to_string(), value.to_string());
        match ttl {
            Some(ttl) => {
                self.expiries.insert(key.to_string(), std::time::Instant::now() + ttl);
            }
            None => {
                self.expiries.remove(key);
            }
        }
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.evict_if_expired(key);
        if self.strings.contains_key(key) {
            return Ok(false);
        }
        self.set(key, value, ttl, cancel).await?;
        Ok(true)
    }

    async fn del(&self, key: &str, _cancel: &CancellationToken) -> Result<bool> {
        let removed_string = self.strings.remove(key).is_some();
        let removed_list = self.lists.remove(key).is_some();
        let removed_zset = self.sorted.remove(key).is_some();
        self.expiries.remove(key);
        Ok(removed_string || removed_list || removed_zset)
    }

    async fn incr_by(&self, key: &str, delta: i64, _cancel: &CancellationToken) -> Result<i64> {
        self.evict_if_expired(key);
        let mut entry = self.strings.entry(key.to_string()).or_insert_with(|| "0".to_string());
        let current: i64 = entry.parse().unwrap_or(0);
        let updated = current + delta;
        *entry = updated.to_string();
        Ok(updated)
    }

    async fn expire(&self, key: &str, ttl: Duration, _cancel: &CancellationToken) -> Result<bool> {
        if !self.strings.contains_key(key) && !self.lists.contains_key(key) {
            return Ok(false);
        }
        self.expiries.insert(key.to_string(), std::time::Instant::now() + ttl);
        Ok(true)
    }

    async fn ttl(&self, key: &str, _cancel: &CancellationToken) -> Result<Option<Duration>> {
        Ok(self.expiries.get(key).map(|exp| {
            exp.saturating_duration_since(std::time::Instant::now())
        }))
    }

    async fn scan_keys(
        &self,
        pattern: &str,
        limit: usize,
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let regex_pattern = format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"));
        let re = regex::Regex::new(&regex_pattern).map_err(|e| Error::Internal(e.to_string()))?;
        Ok(self
            .strings
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| re.is_match(k) && !self.is_expired(k))
            .take(limit)
            .collect())
    }

    async fn list_push_right(&self, key: &str, value: &str, _cancel: &CancellationToken) -> Result<i64> {
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push_back(value.to_string());
        Ok(list.len() as i64)
    }

    async fn list_pop_left_blocking(
        &self,
        keys: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<PoppedItem>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for key in keys {
                if let Some(mut list) = self.lists.get_mut(key) {
                    if let Some(value) = list.pop_front() {
                        return Ok(Some((key.clone(), value)));
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
                _ = tokio::time::sleep(Duration::from_millis(20)) => continue,
            }
        }
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let Some(list) = self.lists.get(key) else { return Ok(Vec::new()) };
        let len = list.len() as isize;
        let norm = |i: isize| -> isize { if i < 0 { (len + i).max(0) } else { i.min(len) } };
        let start = norm(start);
        let stop = (norm(stop) + 1).min(len);
        if start >= stop {
            return Ok(Vec::new());
        }
        Ok(list.iter().skip(start as usize).take((stop - start) as usize).cloned().collect())
    }

    async fn list_remove(&self, key: &str, value: &str, _cancel: &CancellationToken) -> Result<i64> {
        let Some(mut list) = self.lists.get_mut(key) else { return Ok(0) };
        let before = list.len();
        list.retain(|v| v != value);
        Ok((before - list.len()) as i64)
    }

    async fn list_len(&self, key: &str, _cancel: &CancellationToken) -> Result<i64> {
        Ok(self.lists.get(key).map(|l| l.len() as i64).unwrap_or(0))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64, _cancel: &CancellationToken) -> Result<()> {
        let mut set = self.sorted.entry(key.to_string()).or_default();
        set.retain(|(m, _)| m != member);
        set.push((member.to_string(), score));
        set.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let Some(set) = self.sorted.get(key) else { return Ok(Vec::new()) };
        let mut out: Vec<String> = set
            .iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .map(|(m, _)| m.clone())
            .collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn zrem(&self, key: &str, member: &str, _cancel: &CancellationToken) -> Result<bool> {
        let Some(mut set) = self.sorted.get_mut(key) else { return Ok(false) };
        let before = set.len();
        set.retain(|(m, _)| m != member);
        Ok(set.len() != before)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let current = self.get(key, cancel).await?;
        if current.as_deref() != expected {
            return Err(Error::Conflict(format!(
                "keyed-store CAS failed for '{key}': expected {expected:?}, found {current:?}"
            )));
        }
        self.set(key, new, ttl, cancel).await
    }

    async fn pipeline(&self, ops: &[KeyOp], cancel: &CancellationToken) -> Result<Vec<KeyOpResult>> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let result = match op {
                KeyOp::Set { key, value, ttl } => {
                    self.set(key, value, *ttl, cancel).await?;
                    KeyOpResult::Ok
                }
                KeyOp::Del { key } => KeyOpResult::Bool(self.del(key, cancel).await?),
                KeyOp::Incr { key } => KeyOpResult::Int(self.incr_by(key, 1, cancel).await?),
                KeyOp::Expire { key, ttl } => KeyOpResult::Bool(self.expire(key, *ttl, cancel).await?),
            };
            results.push(result);
        }
        Ok(results)
    }

    async fn publish(&self, channel: &str, message: &str, _cancel: &CancellationToken) -> Result<()> {
        let mut channels = self.channels.lock().await;
        let sender = channels.entry(channel.to_string()).or_insert_with(|| broadcast::channel(256).0);
        let _ = sender.send((channel.to_string(), message.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str, _cancel: &CancellationToken) -> Result<Subscription> {
        let mut channels = self.channels.lock().await;
        let sender = channels.entry(channel.to_string()).or_insert_with(|| broadcast::channel(256).0);
        Ok(Subscription { rx: sender.subscribe(), channel: channel.to_string() })
    }

    async fn memory_usage(&self, key: &str, _cancel: &CancellationToken) -> Result<Option<u64>> {
        Ok(self.strings.get(key).map(|v| v.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = FakeKeyedStore::new();
        let c = token();
        store.set("foo", "bar", None, &c).await.unwrap();
        assert_eq!(store.get("foo", &c).await.unwrap(), Some("bar".to_string()));
    }

    #[tokio::test]
    async fn set_nx_dedup() {
        let store = FakeKeyedStore::new();
        let c = token();
        assert!(store.set_nx("dedup:x", "1", None, &c).await.unwrap());
        assert!(!store.set_nx("dedup:x", "1", None, &c).await.unwrap());
    }

    #[tokio::test]
    async fn ttl_expiry() {
        let store = FakeKeyedStore::new();
        let c = token();
        store.set("k", "v", Some(Duration::from_millis(10)), &c).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k", &c).await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_push_and_pop() {
        let store = FakeKeyedStore::new();
        let c = token();
        store.list_push_right("queue:high", "job1", &c).await.unwrap();
        let popped = store
            .list_pop_left_blocking(&["queue:high".to_string()], Duration::from_millis(50), &c)
            .await
            .unwrap();
        assert_eq!(popped, Some(("queue:high".to_string(), "job1".to_string())));
    }

    #[tokio::test]
    async fn compare_and_swap_conflict() {
        let store = FakeKeyedStore::new();
        let c = token();
        store.set("lease:1", "owner-a", None, &c).await.unwrap();
        let result = store.compare_and_swap("lease:1", Some("owner-b"), "owner-c", None, &c).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn publish_subscribe() {
        let store = FakeKeyedStore::new();
        let c = token();
        let mut sub = store.subscribe("chan:1", &c).await.unwrap();
        store.publish("chan:1", "hello", &c).await.unwrap();
        let (channel, payload) = sub.recv(&c).await.unwrap();
        assert_eq!(channel, "chan:1");
        assert_eq!(payload, "hello");
    }

    #[tokio::test]
    async fn sorted_set_range_by_score() {
        let store = FakeKeyedStore::new();
        let c = token();
        store.zadd("aging:normal", "job1", 100.0, &c).await.unwrap();
        store.zadd("aging:normal", "job2", 200.0, &c).await.unwrap();
        let members = store.zrange_by_score("aging:normal", 0.0, 150.0, None, &c).await.unwrap();
        assert_eq!(members, vec!["job1".to_string()]);
    }
}
