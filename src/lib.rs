//! # fleet-core
//!
//! Core infrastructure for a multi-tenant fleet-operations backend: a background
//! job engine, a real-time WebSocket fan-out hub, a rate limit manager, and an
//! export result cache, all built on a shared keyed-store (Redis) collaborator.
//!
//! ## Components
//!
//! - **Job engine** ([`jobs`]): priority queues, worker pool, retry with jittered
//!   backoff, cron/scheduled jobs, lease-based heartbeats, deduplication.
//! - **Real-time hub** ([`websocket`]): tenant/user-scoped WebSocket fan-out with
//!   cross-node pub/sub bridging.
//! - **Rate limiting** ([`rate_limit`]): per-endpoint fixed-window, sliding-window,
//!   and token-bucket strategies with fail-open semantics.
//! - **Export cache** ([`export_cache`]): fingerprinted caching of expensive export
//!   results with per-type TTLs and tenant/user invalidation.
//!
//! ## Example
//!
//! ```rust,no_run
//! use fleet_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let state = AppState::builder()
//!         .config(config.clone())
//!         .build()
//!         .await?;
//!
//!     let app = Router::new()
//!         .route("/health", get(health))
//!         .route("/ready", get(readiness))
//!         .with_state(state);
//!
//!     Server::new(config).serve(app).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod ids;
pub mod middleware;
pub mod health;
pub mod pool_health;
pub mod responses;
pub mod server;
pub mod service_builder;
pub mod state;
pub mod database;
pub mod cache;
pub mod keystore;
pub mod observability;
pub mod websocket;
pub mod rate_limit;
pub mod export_cache;
pub mod jobs;

/// Internal agent-based components.
///
/// The background worker supervises long-lived sweep tasks (job scheduler,
/// priority aging, lease reaper, pub/sub bridge). Users don't need to
/// interact with this module directly beyond the re-exported types below.
pub mod agents;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        Config, DatabaseConfig, RedisConfig, ServiceConfig, JobEngineConfig, RateLimitRule,
        RateLimitRulesConfig, ExportCacheConfig, WebSocketHubConfig, MiddlewareConfig,
        SecurityHeadersConfig,
    };

    pub use crate::error::{Error, Result};
    pub use crate::health::{health, readiness, pool_metrics};
    pub use crate::ids::{MakeTypedRequestId, RequestId, RequestIdError};
    pub use crate::pool_health::{DatabasePoolHealth, PoolHealthSummary};

    pub use crate::middleware::{
        RequestTrackingConfig,
        PROPAGATE_HEADERS, SENSITIVE_HEADERS,
        request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
        apply_security_headers, rate_limit_middleware,
    };

    pub use crate::audit::{AuditSink, NoopAuditSink, PgAuditSink};
    pub use crate::server::Server;
    pub use crate::service_builder::{Service, ServiceBuilder};
    pub use crate::state::{AppState, AppStateBuilder};

    pub use crate::responses::{
        Accepted, Conflict, Created, FieldError, NoContent, Success, ValidationError,
    };

    pub use crate::observability::init_tracing;

    pub use crate::keystore::{KeyedStore, RedisKeyedStore, FakeKeyedStore};

    pub use crate::websocket::{Hub, HubConfig, ConnectionId, FleetEnvelope, BroadcastScope};

    pub use crate::rate_limit::{RateLimitDecision, RateLimitRegistry};

    pub use crate::export_cache::{ExportCache, ExportCacheKey, ExportCacheStats};

    pub use crate::jobs::{
        Job, JobPriority, JobStatus, JobHandle, JobEngine, JobHandler, ScheduledJobSpec,
    };

    // Background task management (user-facing)
    pub use crate::agents::{BackgroundWorker, TaskStatus};

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Extension, Router,
    };

    pub use serde::{Deserialize, Serialize};

    // Re-export tracing macros and types
    pub use tracing::{debug, error, info, instrument, trace, warn, Level, Span};

    // Re-export tokio for async runtime
    pub use tokio;

    // Re-export async-trait for async trait definitions
    pub use async_trait::async_trait;

    // Re-export error handling utilities
    pub use thiserror::Error;
    pub use anyhow::{self, Context as AnyhowContext};

    // Re-export time utilities
    pub use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};

    // Re-export UUID
    pub use uuid::Uuid;

    // Re-export futures utilities
    pub use futures::{future, stream, Future, Stream, StreamExt, TryFutureExt, TryStreamExt};

    // Re-export HTTP types
    pub use http::{Method, Uri};

    // Re-export acton-reactive prelude for actor system
    pub use acton_reactive::prelude::*;
}
