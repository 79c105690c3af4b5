//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: `FLEETCORE_`)
//! 2. Current working directory: `./config.toml`
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service-level configuration
    pub service: ServiceConfig,

    /// Keyed store (Redis-equivalent) configuration
    pub redis: RedisConfig,

    /// Relational store configuration (optional collaborator)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Background job engine configuration
    #[serde(default)]
    pub jobs: JobEngineConfig,

    /// Rate limit manager configuration
    #[serde(default)]
    pub rate_limit: RateLimitRulesConfig,

    /// Export cache configuration
    #[serde(default)]
    pub export_cache: ExportCacheConfig,

    /// Real-time hub configuration
    #[serde(default)]
    pub websocket: WebSocketHubConfig,

    /// HTTP middleware configuration
    #[serde(default)]
    pub middleware: MiddlewareConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Whether this instance terminates TLS itself (vs. behind a
    /// TLS-terminating proxy); gates whether HSTS is sent
    #[serde(default)]
    pub tls_enabled: bool,
}

/// Keyed store (Redis-equivalent) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL (redis://host:port or cluster URLs)
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing the initial connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Relational store (Postgres) configuration, used only by the optional
/// `AuditSink` implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

/// Background Job Engine configuration (spec §4.D)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEngineConfig {
    /// Number of worker tasks in the pool
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// How often the priority-aging sweep runs, in seconds
    #[serde(default = "default_priority_aging_interval_secs")]
    pub priority_aging_interval_secs: u64,

    /// How long a job must sit pending before it ages up one priority tier,
    /// in seconds
    #[serde(default = "default_priority_aging_threshold_secs")]
    pub priority_aging_threshold_secs: u64,

    /// Default max attempts for a job that doesn't specify its own
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Base backoff delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Jitter fraction applied to computed backoff (0.0-1.0)
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    /// Dedup marker TTL in seconds
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,

    /// Worker lease multiplier applied to a job's expected duration
    #[serde(default = "default_lease_multiplier")]
    pub lease_multiplier: u32,

    /// How often the lease reaper sweeps for expired leases, in seconds
    #[serde(default = "default_lease_reap_interval_secs")]
    pub lease_reap_interval_secs: u64,

    /// Size of the bounded failed-jobs ring buffer
    #[serde(default = "default_failed_jobs_capacity")]
    pub failed_jobs_capacity: usize,

    /// Failure-rate threshold (fraction) over the alerting window that
    /// triggers an alert
    #[serde(default = "default_failure_rate_alert_threshold")]
    pub failure_rate_alert_threshold: f64,

    /// Alerting window in seconds
    #[serde(default = "default_failure_rate_alert_window_secs")]
    pub failure_rate_alert_window_secs: u64,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            priority_aging_interval_secs: default_priority_aging_interval_secs(),
            priority_aging_threshold_secs: default_priority_aging_threshold_secs(),
            default_max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            backoff_jitter: default_backoff_jitter(),
            dedup_window_secs: default_dedup_window_secs(),
            lease_multiplier: default_lease_multiplier(),
            lease_reap_interval_secs: default_lease_reap_interval_secs(),
            failed_jobs_capacity: default_failed_jobs_capacity(),
            failure_rate_alert_threshold: default_failure_rate_alert_threshold(),
            failure_rate_alert_window_secs: default_failure_rate_alert_window_secs(),
        }
    }
}

impl JobEngineConfig {
    /// Priority-aging sweep interval as a `Duration`
    pub fn priority_aging_interval(&self) -> Duration {
        Duration::from_secs(self.priority_aging_interval_secs)
    }

    /// Dedup marker TTL as a `Duration`
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

/// A single endpoint rate-limit rule (spec §4.C)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// HTTP method, or `*` for any
    pub method: String,

    /// Path pattern; a single `*` segment acts as a wildcard
    pub path_pattern: String,

    /// Limiting strategy: `fixed_window`, `sliding_window`, or `token_bucket`
    pub strategy: String,

    /// Requests allowed per window (or steady-state rate for token bucket)
    pub limit: u32,

    /// Window length in seconds (unused for pure token-bucket rate, used as
    /// the refill period there)
    pub window_secs: u64,

    /// Burst allowance (token bucket only); ignored otherwise
    #[serde(default)]
    pub burst: Option<u32>,

    /// Token-bucket refill rate in tokens/second; ignored for the other two
    /// strategies. Defaults to `limit / window_secs` when unset, but the
    /// spec's baked-in defaults (GPS ingest, WebSocket upgrade) need a
    /// steady-state rate decoupled from the window used for reporting.
    #[serde(default)]
    pub refill_rate_per_sec: Option<f64>,
}

/// Rate Limit Manager configuration (spec §4.C)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRulesConfig {
    /// Whether limiting fails open (allow) or closed (deny) when the keyed
    /// store is unreachable
    #[serde(default = "default_true")]
    pub fail_open: bool,

    /// Endpoint registry, most specific pattern wins
    #[serde(default = "default_rate_limit_rules")]
    pub rules: Vec<RateLimitRule>,
}

impl Default for RateLimitRulesConfig {
    fn default() -> Self {
        Self {
            fail_open: true,
            rules: default_rate_limit_rules(),
        }
    }
}

/// Per-export-type TTL override (spec §4.B)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportCacheTypeTtl {
    /// Export type name (`vehicles`, `drivers`, `trips`, ...)
    pub export_type: String,
    /// TTL in seconds
    pub ttl_secs: u64,
}

/// Export Cache configuration (spec §4.B)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportCacheConfig {
    /// Default TTL in seconds for types with no override
    #[serde(default = "default_export_cache_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Per-type TTL overrides
    #[serde(default = "default_export_cache_type_ttls")]
    pub type_ttls: Vec<ExportCacheTypeTtl>,
}

impl Default for ExportCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_export_cache_ttl_secs(),
            type_ttls: default_export_cache_type_ttls(),
        }
    }
}

impl ExportCacheConfig {
    /// TTL for a given export type, falling back to the default
    pub fn ttl_for(&self, export_type: &str) -> Duration {
        self.type_ttls
            .iter()
            .find(|t| t.export_type == export_type)
            .map(|t| Duration::from_secs(t.ttl_secs))
            .unwrap_or_else(|| Duration::from_secs(self.default_ttl_secs))
    }
}

/// Real-Time Hub configuration (spec §4.E)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketHubConfig {
    /// Ping interval in seconds
    #[serde(default = "default_ws_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Pong deadline in seconds; exceeding this disconnects the client
    #[serde(default = "default_ws_pong_deadline_secs")]
    pub pong_deadline_secs: u64,

    /// Per-client outbound send buffer capacity
    #[serde(default = "default_ws_send_buffer")]
    pub send_buffer_size: usize,

    /// Maximum accepted inbound frame size in bytes
    #[serde(default = "default_ws_max_inbound_frame_bytes")]
    pub max_inbound_frame_bytes: usize,

    /// Pub/sub channel used for the cross-node bridge
    #[serde(default = "default_ws_pubsub_channel")]
    pub pubsub_channel: String,

    /// Loopback dedup window in seconds
    #[serde(default = "default_ws_dedup_window_secs")]
    pub dedup_window_secs: u64,
}

impl Default for WebSocketHubConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ws_ping_interval_secs(),
            pong_deadline_secs: default_ws_pong_deadline_secs(),
            send_buffer_size: default_ws_send_buffer(),
            max_inbound_frame_bytes: default_ws_max_inbound_frame_bytes(),
            pubsub_channel: default_ws_pubsub_channel(),
            dedup_window_secs: default_ws_dedup_window_secs(),
        }
    }
}

impl WebSocketHubConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_deadline(&self) -> Duration {
        Duration::from_secs(self.pong_deadline_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

/// Security headers configuration, used by `middleware::security_headers`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityHeadersConfig {
    /// Master switch; when `false` none of these headers are applied
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Send `Strict-Transport-Security` (only applied when TLS is enabled)
    #[serde(default = "default_true")]
    pub hsts: bool,

    /// HSTS max-age in seconds
    #[serde(default = "default_hsts_max_age")]
    pub hsts_max_age_secs: u64,

    /// Append `; includeSubDomains` to the HSTS value
    #[serde(default = "default_true")]
    pub hsts_include_subdomains: bool,

    /// Append `; preload` to the HSTS value
    #[serde(default)]
    pub hsts_preload: bool,

    /// Send `X-Content-Type-Options: nosniff`
    #[serde(default = "default_true")]
    pub x_content_type_options: bool,

    /// `X-Frame-Options` value; empty string skips the header
    #[serde(default = "default_frame_options")]
    pub x_frame_options: String,

    /// Send `X-XSS-Protection: 0`
    #[serde(default = "default_true")]
    pub x_xss_protection: bool,

    /// `Referrer-Policy` value; empty string skips the header
    #[serde(default = "default_referrer_policy")]
    pub referrer_policy: String,

    /// `Permissions-Policy` value; unset skips the header
    #[serde(default)]
    pub permissions_policy: Option<String>,
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hsts: true,
            hsts_max_age_secs: default_hsts_max_age(),
            hsts_include_subdomains: true,
            hsts_preload: false,
            x_content_type_options: true,
            x_frame_options: default_frame_options(),
            x_xss_protection: true,
            referrer_policy: default_referrer_policy(),
            permissions_policy: None,
        }
    }
}

/// HTTP middleware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    /// Request tracking configuration (request IDs, header propagation)
    #[serde(default)]
    pub request_tracking: RequestTrackingConfig,

    /// Security headers configuration
    #[serde(default)]
    pub security_headers: SecurityHeadersConfig,

    /// Request body size limit in MB
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,

    /// Enable panic recovery middleware
    #[serde(default = "default_true")]
    pub catch_panic: bool,

    /// Enable compression
    #[serde(default = "default_true")]
    pub compression: bool,

    /// CORS mode: `permissive` or `strict`
    #[serde(default = "default_cors_mode")]
    pub cors_mode: String,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            request_tracking: RequestTrackingConfig::default(),
            security_headers: SecurityHeadersConfig::default(),
            body_limit_mb: default_body_limit_mb(),
            catch_panic: true,
            compression: true,
            cors_mode: default_cors_mode(),
        }
    }
}

/// Request tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTrackingConfig {
    /// Enable request ID generation
    #[serde(default = "default_true")]
    pub request_id_enabled: bool,

    /// Request ID header name
    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,

    /// Enable header propagation
    #[serde(default = "default_true")]
    pub propagate_headers: bool,

    /// Enable sensitive header masking in logs
    #[serde(default = "default_true")]
    pub mask_sensitive_headers: bool,
}

impl Default for RequestTrackingConfig {
    fn default() -> Self {
        Self {
            request_id_enabled: true,
            request_id_header: default_request_id_header(),
            propagate_headers: true,
            mask_sensitive_headers: true,
        }
    }
}

impl RequestTrackingConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

// --- default value functions ---

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_max_connections() -> u32 {
    50
}

fn default_min_connections() -> u32 {
    5
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_redis_max_connections() -> usize {
    20
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

fn default_body_limit_mb() -> usize {
    10
}

fn default_cors_mode() -> String {
    "permissive".to_string()
}

fn default_request_id_header() -> String {
    "x-request-id".to_string()
}

fn default_hsts_max_age() -> u64 {
    31_536_000
}

fn default_frame_options() -> String {
    "DENY".to_string()
}

fn default_referrer_policy() -> String {
    "strict-origin-when-cross-origin".to_string()
}

fn default_worker_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
}

fn default_priority_aging_interval_secs() -> u64 {
    300
}

fn default_priority_aging_threshold_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_dedup_window_secs() -> u64 {
    900
}

fn default_lease_multiplier() -> u32 {
    2
}

fn default_lease_reap_interval_secs() -> u64 {
    30
}

fn default_failed_jobs_capacity() -> usize {
    1000
}

fn default_failure_rate_alert_threshold() -> f64 {
    0.2
}

fn default_failure_rate_alert_window_secs() -> u64 {
    300
}

fn default_rate_limit_rules() -> Vec<RateLimitRule> {
    vec![
        RateLimitRule {
            method: "POST".into(),
            path_pattern: "/auth/*".into(),
            strategy: "fixed_window".into(),
            limit: 5,
            window_secs: 900,
            burst: None,
            refill_rate_per_sec: None,
        },
        RateLimitRule {
            method: "POST".into(),
            path_pattern: "/gps/ingest".into(),
            strategy: "token_bucket".into(),
            limit: 1000,
            window_secs: 60,
            burst: Some(100),
            refill_rate_per_sec: Some(50.0),
        },
        RateLimitRule {
            method: "GET".into(),
            path_pattern: "/analytics/*".into(),
            strategy: "sliding_window".into(),
            limit: 100,
            window_secs: 60,
            burst: None,
            refill_rate_per_sec: None,
        },
        RateLimitRule {
            method: "POST".into(),
            path_pattern: "/payments/*".into(),
            strategy: "fixed_window".into(),
            limit: 10,
            window_secs: 60,
            burst: None,
            refill_rate_per_sec: None,
        },
        RateLimitRule {
            method: "GET".into(),
            path_pattern: "/ws".into(),
            strategy: "token_bucket".into(),
            limit: 10,
            window_secs: 60,
            burst: Some(5),
            refill_rate_per_sec: Some(2.0),
        },
    ]
}

fn default_export_cache_ttl_secs() -> u64 {
    3600
}

fn default_export_cache_type_ttls() -> Vec<ExportCacheTypeTtl> {
    vec![
        ExportCacheTypeTtl { export_type: "vehicles".into(), ttl_secs: 7200 },
        ExportCacheTypeTtl { export_type: "drivers".into(), ttl_secs: 7200 },
        ExportCacheTypeTtl { export_type: "trips".into(), ttl_secs: 3600 },
        ExportCacheTypeTtl { export_type: "gps_tracks".into(), ttl_secs: 1800 },
        ExportCacheTypeTtl { export_type: "reports".into(), ttl_secs: 14400 },
    ]
}

fn default_ws_ping_interval_secs() -> u64 {
    54
}

fn default_ws_pong_deadline_secs() -> u64 {
    60
}

fn default_ws_send_buffer() -> usize {
    256
}

fn default_ws_max_inbound_frame_bytes() -> usize {
    512
}

fn default_ws_pubsub_channel() -> String {
    "fleet_tracker:websocket".to_string()
}

fn default_ws_dedup_window_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Environment variables (`FLEETCORE_` prefix) override `./config.toml`,
    /// which overrides the built-in defaults.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "fleet-core".to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let mut defaults = Config::default();
        defaults.service.name = service_name.to_string();

        let figment = Figment::new()
            .merge(Serialized::defaults(defaults))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("FLEETCORE_").split("_"));

        Ok(figment.extract()?)
    }

    /// Load configuration from a specific file, bypassing the default
    /// `./config.toml` lookup. Useful for tests and non-standard deployments.
    pub fn load_from(path: &str) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("FLEETCORE_").split("_"));

        Ok(figment.extract()?)
    }

    /// Keyed store connection URL
    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }

    /// Relational store connection URL, if configured
    pub fn database_url(&self) -> Option<&str> {
        self.database.as_ref().map(|db| db.url.as_str())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "fleet-core".to_string(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
                environment: default_environment(),
                tls_enabled: false,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                max_connections: default_redis_max_connections(),
                connection_timeout_secs: default_connection_timeout(),
                max_retries: default_max_retries(),
                retry_delay_secs: default_retry_delay(),
            },
            database: None,
            jobs: JobEngineConfig::default(),
            rate_limit: RateLimitRulesConfig::default(),
            export_cache: ExportCacheConfig::default(),
            websocket: WebSocketHubConfig::default(),
            middleware: MiddlewareConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = Config::default();
        assert_eq!(config.service.port, 8080);
        assert_eq!(config.service.log_level, "info");
        assert_eq!(config.jobs.default_max_attempts, 3);
        assert_eq!(config.jobs.failed_jobs_capacity, 1000);
    }

    #[test]
    fn export_cache_ttl_falls_back_to_default() {
        let config = ExportCacheConfig::default();
        assert_eq!(config.ttl_for("gps_tracks"), Duration::from_secs(1800));
        assert_eq!(config.ttl_for("unknown_type"), Duration::from_secs(3600));
    }

    #[test]
    fn rate_limit_rules_cover_default_endpoints() {
        let config = RateLimitRulesConfig::default();
        assert!(config.rules.iter().any(|r| r.path_pattern == "/gps/ingest"));
        assert!(config.fail_open);
    }
}
