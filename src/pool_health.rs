//! Connection pool health, surfaced by the readiness probe (SPEC_FULL §6.1).

use serde::{Deserialize, Serialize};

/// Database connection pool health metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabasePoolHealth {
    pub size: u32,
    pub idle: usize,
    pub max_size: u32,
    pub min_size: u32,
    pub healthy: bool,
    pub utilization_percent: f32,
}

impl DatabasePoolHealth {
    pub fn from_pool(pool: &sqlx::PgPool, config: &crate::config::DatabaseConfig) -> Self {
        let size = pool.size();
        let idle = pool.num_idle();
        let max_size = config.max_connections;
        let min_size = config.min_connections;

        let utilization_percent = if max_size > 0 { ((size as f32 / max_size as f32) * 100.0).min(100.0) } else { 0.0 };
        let healthy = size < max_size;

        Self { size, idle, max_size, min_size, healthy, utilization_percent }
    }
}

/// Overall collaborator health for the readiness probe. The keyed store is
/// the only hard dependency (every core component talks to it); the database
/// is optional, so its absence never fails readiness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealthSummary {
    pub keyed_store_reachable: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabasePoolHealth>,

    pub healthy: bool,
}

impl PoolHealthSummary {
    pub fn new() -> Self {
        Self { keyed_store_reachable: false, database: None, healthy: true }
    }

    pub fn is_healthy(&self) -> bool {
        let database_healthy = self.database.as_ref().is_none_or(|db| db.healthy);
        self.keyed_store_reachable && database_healthy
    }
}

impl Default for PoolHealthSummary {
    fn default() -> Self {
        Self::new()
    }
}
