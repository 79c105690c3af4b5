//! Relational-store collaborator contract (SPEC_FULL §6.1).
//!
//! The core treats the relational store only as a typed row store: a sink
//! the job engine can optionally write terminal-state transitions and alerts
//! to for later analytics. [`NoopAuditSink`] is the default so the crate
//! remains usable without Postgres configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::JobStatus;

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_job_event(
        &self,
        job_id: Uuid,
        job_type: &str,
        status: JobStatus,
        attempts: u32,
        occurred_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn record_alert(&self, job_type: &str, failure_rate: f64, sample_count: usize, raised_at: DateTime<Utc>) -> Result<()>;
}

/// Default sink; drops every event. Used whenever no database is configured.
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record_job_event(
        &self,
        _job_id: Uuid,
        _job_type: &str,
        _status: JobStatus,
        _attempts: u32,
        _occurred_at: DateTime<Utc>,
    ) -> Result<()> {
        Ok(())
    }

    async fn record_alert(&self, _job_type: &str, _failure_rate: f64, _sample_count: usize, _raised_at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

/// Writes job events and failure-rate alerts to Postgres for out-of-scope
/// fleet analytics consumers. Assumes `job_events`/`job_alerts` tables exist
/// (migrations are the embedding application's responsibility; the core
/// does not own a schema).
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record_job_event(
        &self,
        job_id: Uuid,
        job_type: &str,
        status: JobStatus,
        attempts: u32,
        occurred_at: DateTime<Utc>,
    ) -> Result<()> {
        let status = serde_json::to_string(&status).unwrap_or_else(|_| "unknown".to_string());
        sqlx::query(
            "INSERT INTO job_events (job_id, job_type, status, attempts, occurred_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(job_id)
        .bind(job_type)
        .bind(status)
        .bind(attempts as i32)
        .bind(occurred_at)
        .execute(&self.pool)
        .await
        .map_err(|e| crate::error::Error::Database(Box::new(e)))?;
        Ok(())
    }

    async fn record_alert(&self, job_type: &str, failure_rate: f64, sample_count: usize, raised_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_alerts (job_type, failure_rate, sample_count, raised_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(job_type)
        .bind(failure_rate)
        .bind(sample_count as i32)
        .bind(raised_at)
        .execute(&self.pool)
        .await
        .map_err(|e| crate::error::Error::Database(Box::new(e)))?;
        Ok(())
    }
}
