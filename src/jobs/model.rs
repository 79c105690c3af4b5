//! Job domain types: the materialized job record, priority tiers, the
//! status state machine, scheduled-job definitions, and the handler trait
//! invoked by the worker pool.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;

/// Priority tier. `Ord` follows dequeue precedence: `Critical` drains before
/// `High`, `High` before `Normal`, `Normal` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl JobPriority {
    /// Tiers in dequeue order, highest first. The worker pool polls these in
    /// order on every dequeue attempt so a critical job never waits behind a
    /// backlog of lower-priority ones.
    pub const DESCENDING: [JobPriority; 4] =
        [JobPriority::Critical, JobPriority::High, JobPriority::Normal, JobPriority::Low];

    pub fn queue_key(self) -> &'static str {
        match self {
            JobPriority::Critical => "queue:critical",
            JobPriority::High => "queue:high",
            JobPriority::Normal => "queue:normal",
            JobPriority::Low => "queue:low",
        }
    }

    /// All four queue keys, in dequeue order. Used for the multi-key
    /// blocking pop.
    pub fn queue_keys() -> Vec<String> {
        Self::DESCENDING.iter().map(|p| p.queue_key().to_string()).collect()
    }

    /// One tier up. Aging never promotes a job into `Critical`; that tier is
    /// reserved for callers who asked for it explicitly.
    pub fn aged_up(self) -> Self {
        match self {
            JobPriority::Low => JobPriority::Normal,
            JobPriority::Normal => JobPriority::High,
            JobPriority::High | JobPriority::Critical => JobPriority::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
    Scheduled,
}

impl JobStatus {
    /// Terminal statuses never transition further on their own.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// A unit of asynchronous work. Persisted as `job:{id}` and, while queued,
/// referenced by id from exactly one `queue:{priority}` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub tags: BTreeSet<String>,
    pub dedup_key: Option<String>,
    pub trace_id: String,
    /// Caller's estimate of how long the handler takes, used to size the
    /// worker lease TTL (`lease_multiplier * expected_duration`).
    pub expected_duration_secs: u64,
}

impl Job {
    pub fn data_key(id: Uuid) -> String {
        format!("job:{id}")
    }

    pub fn lease_key(id: Uuid) -> String {
        format!("job:{id}:lease")
    }

    pub fn is_pending_or_retrying(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Retrying)
    }
}

/// Caller-facing request to enqueue a job, built up with the builder
/// methods and handed to [`crate::jobs::JobEngine::enqueue`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub priority: JobPriority,
    pub max_attempts: Option<u32>,
    pub dedup_key: Option<String>,
    pub tags: BTreeSet<String>,
    pub trace_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expected_duration_secs: u64,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value, tenant_id: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            tenant_id: tenant_id.into(),
            user_id: None,
            priority: JobPriority::Normal,
            max_attempts: None,
            dedup_key: None,
            tags: BTreeSet::new(),
            trace_id: None,
            scheduled_at: None,
            expected_duration_secs: 30,
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn dedup_key(mut self, dedup_key: impl Into<String>) -> Self {
        self.dedup_key = Some(dedup_key.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn expected_duration_secs(mut self, secs: u64) -> Self {
        self.expected_duration_secs = secs;
        self
    }
}

/// A recurring job definition, persisted as `scheduled:{id}`. The scheduler
/// tick recomputes `next_fire_at` after every successful enqueue; a
/// deactivated entry (`is_active = false`) never fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJobSpec {
    pub id: Uuid,
    pub name: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub schedule: String,
    pub next_fire_at: DateTime<Utc>,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub priority: JobPriority,
    pub tenant_id: String,
    pub user_id: Option<String>,
}

impl ScheduledJobSpec {
    pub fn data_key(id: Uuid) -> String {
        format!("scheduled:{id}")
    }

    /// Parse `schedule` as a `cron` expression and compute the next fire
    /// time strictly after `after`.
    pub fn compute_next_fire(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        use std::str::FromStr;
        let schedule = cron::Schedule::from_str(&self.schedule)
            .map_err(|e| crate::error::Error::Validation(format!("invalid cron expression '{}': {e}", self.schedule)))?;
        schedule
            .after(&after)
            .next()
            .ok_or_else(|| crate::error::Error::Validation(format!("cron expression '{}' never fires again", self.schedule)))
    }
}

/// Context handed to a [`JobHandler`] for a single dispatch: cancellation
/// tied to the worker's lease and the job's own trace id for log
/// correlation.
pub struct JobContext {
    pub job_id: Uuid,
    pub trace_id: String,
    pub tenant_id: String,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

/// Business logic for one namespaced job type (e.g. `email_notification`).
/// Registered with [`crate::jobs::JobEngine::register_handler`].
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext, payload: &serde_json::Value) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_is_dequeue_precedence() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }

    #[test]
    fn aging_never_reaches_critical() {
        assert_eq!(JobPriority::Low.aged_up(), JobPriority::Normal);
        assert_eq!(JobPriority::Normal.aged_up(), JobPriority::High);
        assert_eq!(JobPriority::High.aged_up(), JobPriority::High);
        assert_eq!(JobPriority::Critical.aged_up(), JobPriority::High);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
    }

    #[test]
    fn scheduled_job_computes_next_fire_from_cron() {
        let spec = ScheduledJobSpec {
            id: Uuid::new_v4(),
            name: "nightly-export".into(),
            job_type: "export_snapshot".into(),
            payload: serde_json::json!({}),
            schedule: "0 0 0 * * *".into(),
            next_fire_at: Utc::now(),
            last_fire_at: None,
            is_active: true,
            priority: JobPriority::Low,
            tenant_id: "acme".into(),
            user_id: None,
        };
        let now = Utc::now();
        let next = spec.compute_next_fire(now).unwrap();
        assert!(next > now);
    }

    #[test]
    fn invalid_cron_expression_is_a_validation_error() {
        let spec = ScheduledJobSpec {
            id: Uuid::new_v4(),
            name: "bad".into(),
            job_type: "x".into(),
            payload: serde_json::json!({}),
            schedule: "not a cron expression".into(),
            next_fire_at: Utc::now(),
            last_fire_at: None,
            is_active: true,
            priority: JobPriority::Low,
            tenant_id: "acme".into(),
            user_id: None,
        };
        assert!(matches!(spec.compute_next_fire(Utc::now()), Err(crate::error::Error::Validation(_))));
    }
}
