//! Rate limit manager
//!
//! Holds a registry of endpoint rules keyed by `(method, path_pattern)` and
//! applies one of three limiting strategies per matched rule: fixed window,
//! sliding window, or token bucket. All bucket state lives in the keyed
//! store so limits are shared across every node serving a tenant.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::{RateLimitRule, RateLimitRulesConfig};
use crate::error::{Error, Result};
use crate::keystore::KeyedStore;

/// Who a rate-limit bucket is scoped to. Determines the keyed-store key
/// prefix: `rate_limit:ip:{id}`, `rate_limit:user:{id}`, or
/// `rate_limit:company:{id}`.
#[derive(Debug, Clone)]
pub enum RateLimitScope {
    Ip(String),
    User(String),
    Tenant(String),
}

impl RateLimitScope {
    fn key_prefix(&self) -> String {
        match self {
            RateLimitScope::Ip(id) => format!("rate_limit:ip:{id}"),
            RateLimitScope::User(id) => format!("rate_limit:user:{id}"),
            RateLimitScope::Tenant(id) => format!("rate_limit:company:{id}"),
        }
    }
}

/// Outcome of a rate-limit check. Callers project this onto the
/// `X-RateLimit-*` / `Retry-After` headers.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub retry_after_ms: u64,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: i64,
}

impl RateLimitDecision {
    fn allow(limit: u32, remaining: u32, reset_at: i64) -> Self {
        Self { allowed: true, retry_after_ms: 0, limit, remaining, reset_at }
    }

    fn deny(limit: u32, retry_after_ms: u64, reset_at: i64) -> Self {
        Self { allowed: false, retry_after_ms, limit, remaining: 0, reset_at }
    }
}

/// Endpoint rule registry plus the three limiting strategies.
///
/// Matching picks the most specific rule for `(method, path)`: exact method +
/// exact path, then exact method + wildcard path, then wildcard method +
/// exact path, then wildcard method + wildcard path. Unmatched requests are
/// not limited.
pub struct RateLimitRegistry {
    rules: Vec<RateLimitRule>,
    fail_open: bool,
    store: Arc<dyn KeyedStore>,
}

impl RateLimitRegistry {
    pub fn new(config: &RateLimitRulesConfig, store: Arc<dyn KeyedStore>) -> Self {
        Self { rules: config.rules.clone(), fail_open: config.fail_open, store }
    }

    /// Find the most specific matching rule for `method`/`path`.
    pub fn match_rule(&self, method: &str, path: &str) -> Option<&RateLimitRule> {
        self.rules
            .iter()
            .filter_map(|rule| specificity(rule, method, path).map(|score| (score, rule)))
            .max_by_key(|(score, _)| *score)
            .map(|(_, rule)| rule)
    }

    /// Check and consume one unit of the bucket identified by `rule` +
    /// `scope`. On a keyed-store dependency failure the decision degrades
    /// to fail-open (allow) or fail-closed (deny) per configuration.
    pub async fn check(
        &self,
        rule: &RateLimitRule,
        scope: &RateLimitScope,
        now: chrono::DateTime<chrono::Utc>,
        cancel: &CancellationToken,
    ) -> Result<RateLimitDecision> {
        let result = match rule.strategy.as_str() {
            "fixed_window" => self.check_fixed_window(rule, scope, now, cancel).await,
            "sliding_window" => self.check_sliding_window(rule, scope, now, cancel).await,
            "token_bucket" => self.check_token_bucket(rule, scope, now, cancel).await,
            other => Err(Error::Validation(format!("unknown rate limit strategy: {other}"))),
        };

        match result {
            Ok(decision) => Ok(decision),
            Err(e) if e.is_dependency_failure() => {
                tracing::warn!(error = %e, fail_open = self.fail_open, "rate limit check degraded");
                if self.fail_open {
                    Ok(RateLimitDecision::allow(rule.limit, rule.limit, now.timestamp()))
                } else {
                    Ok(RateLimitDecision::deny(rule.limit, rule.window_secs * 1000, now.timestamp()))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn check_fixed_window(
        &self,
        rule: &RateLimitRule,
        scope: &RateLimitScope,
        now: chrono::DateTime<chrono::Utc>,
        cancel: &CancellationToken,
    ) -> Result<RateLimitDecision> {
        let window = rule.window_secs.max(1);
        let bucket = now.timestamp() as u64 / window;
        let key = format!("{}:fixed:{bucket}", scope.key_prefix());

        let count = self.store.incr_by(&key, 1, cancel).await?;
        if count == 1 {
            self.store.expire(&key, Duration::from_secs(window), cancel).await?;
        }

        let reset_at = ((bucket + 1) * window) as i64;
        if count as u32 <= rule.limit {
            Ok(RateLimitDecision::allow(rule.limit, rule.limit.saturating_sub(count as u32), reset_at))
        } else {
            let retry_after_ms = ((reset_at - now.timestamp()).max(0) as u64) * 1000;
            Ok(RateLimitDecision::deny(rule.limit, retry_after_ms, reset_at))
        }
    }

    async fn check_sliding_window(
        &self,
        rule: &RateLimitRule,
        scope: &RateLimitScope,
        now: chrono::DateTime<chrono::Utc>,
        cancel: &CancellationToken,
    ) -> Result<RateLimitDecision> {
        let window = rule.window_secs.max(1);
        let key = format!("{}:sliding", scope.key_prefix());
        let now_ms = now.timestamp_millis();
        let window_start = now_ms - (window as i64 * 1000);

        let stale = self
            .store
            .zrange_by_score(&key, 0.0, window_start as f64, None, cancel)
            .await?;
        for member in &stale {
            self.store.zrem(&key, member, cancel).await?;
        }

        let member = format!("{now_ms}-{}", rand::rng().random::<u32>());
        self.store.zadd(&key, &member, now_ms as f64, cancel).await?;
        self.store.expire(&key, Duration::from_secs(window), cancel).await?;

        let current = self
            .store
            .zrange_by_score(&key, window_start as f64, now_ms as f64, None, cancel)
            .await?;
        let count = current.len() as u32;
        let reset_at = now.timestamp() + window as i64;

        if count <= rule.limit {
            Ok(RateLimitDecision::allow(rule.limit, rule.limit.saturating_sub(count), reset_at))
        } else {
            self.store.zrem(&key, &member, cancel).await.ok();
            Ok(RateLimitDecision::deny(rule.limit, window * 1000 / rule.limit.max(1) as u64, reset_at))
        }
    }

    async fn check_token_bucket(
        &self,
        rule: &RateLimitRule,
        scope: &RateLimitScope,
        now: chrono::DateTime<chrono::Utc>,
        cancel: &CancellationToken,
    ) -> Result<RateLimitDecision> {
        let burst = rule.burst.unwrap_or(rule.limit) as f64;
        let refill_rate = rule
            .refill_rate_per_sec
            .unwrap_or_else(|| rule.limit as f64 / rule.window_secs.max(1) as f64);
        let key = format!("{}:bucket", scope.key_prefix());
        let now_ms = now.timestamp_millis();

        for _ in 0..3 {
            let current = self.store.get(&key, cancel).await?;
            let (stored_tokens, last_refill_ms) = match &current {
                Some(raw) => parse_bucket_state(raw).unwrap_or((burst, now_ms)),
                None => (burst, now_ms),
            };

            let elapsed_secs = (now_ms - last_refill_ms).max(0) as f64 / 1000.0;
            let tokens = (stored_tokens + elapsed_secs * refill_rate).min(burst);

            if tokens >= 1.0 {
                let new_tokens = tokens - 1.0;
                let new_state = format!("{new_tokens}:{now_ms}");
                match self
                    .store
                    .compare_and_swap(&key, current.as_deref(), &new_state, Some(Duration::from_secs(3600)), cancel)
                    .await
                {
                    Ok(()) => {
                        let reset_at = now.timestamp() + ((burst - new_tokens) / refill_rate.max(0.001)) as i64;
                        return Ok(RateLimitDecision::allow(rule.limit, new_tokens as u32, reset_at));
                    }
                    Err(Error::Conflict(_)) => continue,
                    Err(e) => return Err(e),
                }
            } else {
                let retry_after_ms = ((1.0 - tokens) / refill_rate.max(0.001) * 1000.0) as u64;
                return Ok(RateLimitDecision::deny(rule.limit, retry_after_ms, now.timestamp() + 1));
            }
        }

        Err(Error::Conflict(format!("rate limit bucket '{key}' contended after 3 retries")))
    }
}

fn parse_bucket_state(raw: &str) -> Option<(f64, i64)> {
    let (tokens, last_refill) = raw.split_once(':')?;
    Some((tokens.parse().ok()?, last_refill.parse().ok()?))
}

/// Specificity score for a rule matching `(method, path)`, or `None` if it
/// doesn't match at all. Higher scores win.
fn specificity(rule: &RateLimitRule, method: &str, path: &str) -> Option<u8> {
    let method_exact = rule.method != "*";
    if method_exact && rule.method != method {
        return None;
    }

    let path_exact = !rule.path_pattern.contains('*');
    if !pattern_matches(&rule.path_pattern, path) {
        return None;
    }

    Some(match (method_exact, path_exact) {
        (true, true) => 3,
        (true, false) => 2,
        (false, true) => 1,
        (false, false) => 0,
    })
}

/// Single-`*`-wildcard matcher: `*` may appear at most once, acting as a
/// prefix or suffix match.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    match pattern.find('*') {
        None => pattern == path,
        Some(idx) => {
            let (prefix, suffix) = (&pattern[..idx], &pattern[idx + 1..]);
            path.starts_with(prefix) && path.ends_with(suffix) && path.len() >= prefix.len() + suffix.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::FakeKeyedStore;

    fn rules() -> RateLimitRulesConfig {
        RateLimitRulesConfig {
            fail_open: true,
            rules: vec![
                RateLimitRule {
                    method: "POST".into(),
                    path_pattern: "/payments/*".into(),
                    strategy: "fixed_window".into(),
                    limit: 3,
                    window_secs: 60,
                    burst: None,
                    refill_rate_per_sec: None,
                },
                RateLimitRule {
                    method: "*".into(),
                    path_pattern: "/gps/ingest".into(),
                    strategy: "token_bucket".into(),
                    limit: 600,
                    window_secs: 60,
                    burst: Some(10),
                    refill_rate_per_sec: None,
                },
            ],
        }
    }

    #[test]
    fn match_rule_prefers_exact_over_wildcard() {
        let store: Arc<dyn KeyedStore> = Arc::new(FakeKeyedStore::new());
        let registry = RateLimitRegistry::new(&rules(), store);
        let matched = registry.match_rule("POST", "/payments/123").unwrap();
        assert_eq!(matched.path_pattern, "/payments/*");
    }

    #[test]
    fn match_rule_none_for_unregistered_endpoint() {
        let store: Arc<dyn KeyedStore> = Arc::new(FakeKeyedStore::new());
        let registry = RateLimitRegistry::new(&rules(), store);
        assert!(registry.match_rule("GET", "/unrelated").is_none());
    }

    #[tokio::test]
    async fn fixed_window_denies_after_limit() {
        let store: Arc<dyn KeyedStore> = Arc::new(FakeKeyedStore::new());
        let registry = RateLimitRegistry::new(&rules(), store);
        let rule = registry.match_rule("POST", "/payments/1").unwrap().clone();
        let scope = RateLimitScope::Ip("1.2.3.4".into());
        let cancel = CancellationToken::new();
        let now = chrono::Utc::now();

        for _ in 0..3 {
            let decision = registry.check(&rule, &scope, now, &cancel).await.unwrap();
            assert!(decision.allowed);
        }
        let decision = registry.check(&rule, &scope, now, &cancel).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.retry_after_ms > 0);
    }

    #[tokio::test]
    async fn token_bucket_allows_up_to_burst() {
        let store: Arc<dyn KeyedStore> = Arc::new(FakeKeyedStore::new());
        let registry = RateLimitRegistry::new(&rules(), store);
        let rule = registry.match_rule("POST", "/gps/ingest").unwrap().clone();
        let scope = RateLimitScope::Tenant("acme".into());
        let cancel = CancellationToken::new();
        let now = chrono::Utc::now();

        for _ in 0..10 {
            let decision = registry.check(&rule, &scope, now, &cancel).await.unwrap();
            assert!(decision.allowed);
        }
        let decision = registry.check(&rule, &scope, now, &cancel).await.unwrap();
        assert!(!decision.allowed);
    }

    #[test]
    fn wildcard_pattern_matches_prefix() {
        assert!(pattern_matches("/analytics/*", "/analytics/fleet"));
        assert!(!pattern_matches("/analytics/*", "/other"));
        assert!(pattern_matches("/ws", "/ws"));
    }
}
