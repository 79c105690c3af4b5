//! Shared application state: the keyed store, the four core subsystems, and
//! their collaborators, wired together the way [`ServiceBuilder`](crate::service_builder::ServiceBuilder)
//! hands a [`Router`](axum::Router) its handlers.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agents::BackgroundWorker;
use crate::audit::{AuditSink, NoopAuditSink};
use crate::config::Config;
use crate::error::Result;
use crate::export_cache::ExportCache;
use crate::jobs::JobEngine;
use crate::keystore::{KeyedStore, RedisKeyedStore};
use crate::rate_limit::RateLimitRegistry;
use crate::websocket::Hub;

/// Shared state handed to every HTTP handler. Cheap to clone: every field is
/// an `Arc`, a `CancellationToken`, or already internally `Arc`-based.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    store: Arc<dyn KeyedStore>,
    jobs: JobEngine,
    hub: Hub,
    rate_limiter: Arc<RateLimitRegistry>,
    export_cache: Arc<ExportCache>,
    background: BackgroundWorker,
    db_pool: Option<PgPool>,
    audit: Arc<dyn AuditSink>,
    shutdown: CancellationToken,
    /// Keeps the acton-reactive runtime the [`BackgroundWorker`] agent was
    /// spawned from alive for the process lifetime; taken and shut down once
    /// by [`AppState::shutdown_agents`].
    agent_runtime: Arc<Mutex<Option<acton_reactive::prelude::AgentRuntime>>>,
}

impl AppState {
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KeyedStore> {
        &self.store
    }

    pub fn jobs(&self) -> &JobEngine {
        &self.jobs
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimitRegistry> {
        &self.rate_limiter
    }

    pub fn export_cache(&self) -> &Arc<ExportCache> {
        &self.export_cache
    }

    pub fn background(&self) -> &BackgroundWorker {
        &self.background
    }

    pub fn db_pool(&self) -> Option<&PgPool> {
        self.db_pool.as_ref()
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Cancellation handle shared by every background task started on this
    /// state's behalf; cancel it during shutdown to drain them.
    pub fn shutdown_handle(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Cancel every background task and shut down the acton-reactive runtime
    /// they were spawned from. Idempotent: a second call is a no-op.
    pub async fn shutdown_agents(&self) {
        self.shutdown.cancel();
        if let Some(mut runtime) = self.agent_runtime.lock().await.take() {
            if let Err(e) = runtime.shutdown_all().await {
                tracing::error!(error = %e, "agent runtime shutdown error");
            }
        }
    }

    /// Pool/keyed-store health summary for the readiness probe.
    pub async fn pool_health(&self) -> crate::pool_health::PoolHealthSummary {
        let mut summary = crate::pool_health::PoolHealthSummary::new();

        let cancel = CancellationToken::new();
        summary.keyed_store_reachable = self.store.get("health:probe", &cancel).await.is_ok();

        if let Some(pool) = &self.db_pool {
            if let Some(db_config) = &self.config.database {
                summary.database = Some(crate::pool_health::DatabasePoolHealth::from_pool(pool, db_config));
            }
        }

        summary.healthy = summary.is_healthy();
        summary
    }
}

/// Builds an [`AppState`], connecting the keyed store and starting the job
/// engine and real-time hub's background tasks.
pub struct AppStateBuilder {
    config: Option<Config>,
    db_pool: Option<PgPool>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self { config: None, db_pool: None, audit: None }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn db_pool(mut self, pool: PgPool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Connect the keyed store, optionally connect Postgres, and start the
    /// job engine and hub's background tasks. All background tasks share one
    /// `CancellationToken`, returned via [`AppState::shutdown_handle`].
    pub async fn build(self) -> Result<AppState> {
        let config = self.config.unwrap_or_default();
        let shutdown = CancellationToken::new();

        let mut runtime = acton_reactive::prelude::ActonApp::launch();
        let background = BackgroundWorker::spawn(&mut runtime)
            .await
            .map_err(|e| crate::error::Error::Internal(format!("failed to spawn background worker agent: {e}")))?;

        let redis_pool = crate::cache::create_pool(&config.redis).await?;
        let store: Arc<dyn KeyedStore> = Arc::new(RedisKeyedStore::new(redis_pool, &config.redis));

        let db_pool = match self.db_pool {
            Some(pool) => Some(pool),
            None => match &config.database {
                Some(db_config) => match crate::database::create_pool(db_config).await {
                    Ok(pool) => Some(pool),
                    Err(e) => {
                        tracing::warn!(error = %e, "database connection failed; continuing without a relational store");
                        None
                    }
                },
                None => None,
            },
        };

        let audit: Arc<dyn AuditSink> = self.audit.unwrap_or_else(|| Arc::new(NoopAuditSink));

        let jobs = JobEngine::start(store.clone(), config.jobs.clone(), &background, shutdown.clone()).await;
        let hub = Hub::start(store.clone(), config.websocket.clone(), &background, shutdown.clone()).await;
        let rate_limiter = Arc::new(RateLimitRegistry::new(&config.rate_limit, store.clone()));
        let export_cache = Arc::new(ExportCache::new(store.clone(), config.export_cache.clone()));

        Ok(AppState {
            config: Arc::new(config),
            store,
            jobs,
            hub,
            rate_limiter,
            export_cache,
            background,
            db_pool,
            audit,
            shutdown,
            agent_runtime: Arc::new(Mutex::new(Some(runtime))),
        })
    }
}

impl Default for AppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `AppStateBuilder::build` connects to a live Redis (and optionally a
    // live Postgres), so it's exercised by integration tests rather than
    // unit tests here; see `jobs`, `rate_limit`, `export_cache`, and
    // `websocket::hub` for the same collaborators tested against
    // `FakeKeyedStore`.

    #[test]
    fn builder_carries_the_config_it_was_given() {
        let mut config = Config::default();
        config.service.name = "test-service".to_string();
        let builder = AppStateBuilder::new().config(config);
        assert_eq!(builder.config.as_ref().unwrap().service.name, "test-service");
    }
}
