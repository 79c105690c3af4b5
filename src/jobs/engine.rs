//! Background job engine: priority queues, retry/backoff, dedup, scheduled
//! and recurring jobs, worker leases, and failure-rate alerting.
//!
//! A single [`JobEngine`] owns no background tasks directly; [`JobEngine::start`]
//! submits the worker pool and the three sweep loops (scheduler tick,
//! priority aging, lease reaper) through a [`BackgroundWorker`], the same
//! supervisor the real-time hub uses for its pub/sub bridge.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agents::BackgroundWorker;
use crate::config::JobEngineConfig;
use crate::error::{Error, Result};
use crate::keystore::KeyedStore;

use super::metrics::{FailureRateAlert, FailureRateTracker, JobMetrics};
use super::model::{Job, JobContext, JobHandler, JobPriority, JobStatus, NewJob, ScheduledJobSpec};

const DUE_JOBS_KEY: &str = "jobs:due";
const FAILED_JOBS_KEY: &str = "failed_jobs";
const SCHEDULED_SCAN_PATTERN: &str = "scheduled:*";
const JOB_SCAN_PATTERN: &str = "job:*";
/// Minimum sample count before a failure rate is trusted enough to alert on.
const FAILURE_RATE_MIN_SAMPLES: usize = 5;

/// A single entry in the bounded `failed_jobs` ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: Uuid,
    pub job_type: String,
    pub error: String,
    pub attempts: u32,
    pub failed_at: chrono::DateTime<Utc>,
}

/// Coordinates the priority queues, worker pool, and sweep tasks behind a
/// cheaply-`Clone`able handle (every field is an `Arc` or a `CancellationToken`).
#[derive(Clone)]
pub struct JobEngine {
    store: Arc<dyn KeyedStore>,
    config: Arc<JobEngineConfig>,
    handlers: Arc<DashMap<String, Arc<dyn JobHandler>>>,
    metrics: Arc<JobMetrics>,
    failure_tracker: Arc<FailureRateTracker>,
    alerts: Arc<Mutex<VecDeque<FailureRateAlert>>>,
    shutdown: CancellationToken,
}

/// A ticket for a job just enqueued. Cloning it is cheap; it just carries the
/// job id alongside a handle back to the engine.
#[derive(Clone)]
pub struct JobHandle {
    id: Uuid,
    engine: JobEngine,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn status(&self, cancel: &CancellationToken) -> Result<JobStatus> {
        self.engine
            .get(self.id, cancel)
            .await?
            .map(|job| job.status)
            .ok_or_else(|| Error::NotFound(format!("job {} not found", self.id)))
    }

    pub async fn job(&self, cancel: &CancellationToken) -> Result<Option<Job>> {
        self.engine.get(self.id, cancel).await
    }

    pub async fn cancel(&self, cancel: &CancellationToken) -> Result<()> {
        self.engine.cancel(self.id, cancel).await
    }
}

impl JobEngine {
    /// Construct the engine and submit its worker pool and sweep loops to
    /// `background`. Each submitted task runs until `shutdown` is cancelled.
    pub async fn start(
        store: Arc<dyn KeyedStore>,
        config: JobEngineConfig,
        background: &BackgroundWorker,
        shutdown: CancellationToken,
    ) -> Self {
        let worker_pool_size = config.worker_pool_size.max(1);
        let engine = Self {
            store,
            config: Arc::new(config),
            handlers: Arc::new(DashMap::new()),
            metrics: Arc::new(JobMetrics::new()),
            failure_tracker: Arc::new(FailureRateTracker::new()),
            alerts: Arc::new(Mutex::new(VecDeque::new())),
            shutdown,
        };

        for index in 0..worker_pool_size {
            let worker_engine = engine.clone();
            let worker_name = format!("job-worker-{index}");
            let task_name = worker_name.clone();
            background.submit(task_name, move || async move { worker_engine.worker_loop(worker_name).await }).await;
        }

        let scheduler_engine = engine.clone();
        background.submit("job-scheduler-tick", move || async move { scheduler_engine.scheduler_loop().await }).await;

        let aging_engine = engine.clone();
        background.submit("job-priority-aging", move || async move { aging_engine.priority_aging_loop().await }).await;

        let reaper_engine = engine.clone();
        background.submit("job-lease-reaper", move || async move { reaper_engine.lease_reaper_loop().await }).await;

        engine
    }

    pub fn register_handler(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    /// Enqueue a job. Fails with [`Error::Conflict`] if `new_job` carries a
    /// `dedup_key` already reserved within the dedup window.
    pub async fn enqueue(&self, new_job: NewJob, cancel: &CancellationToken) -> Result<JobHandle> {
        if let Some(dedup_key) = &new_job.dedup_key {
            let marker = dedup_marker_key(&new_job.job_type, dedup_key);
            let reserved = self.store.set_nx(&marker, "1", Some(self.config.dedup_window()), cancel).await?;
            if !reserved {
                return Err(Error::Conflict(format!(
                    "duplicate job suppressed by dedup key '{dedup_key}' within the dedup window"
                )));
            }
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        let is_future = new_job.scheduled_at.is_some_and(|at| at > now);
        let status = if is_future { JobStatus::Scheduled } else { JobStatus::Pending };

        let job = Job {
            id,
            job_type: new_job.job_type,
            payload: new_job.payload,
            priority: new_job.priority,
            status,
            attempts: 0,
            max_attempts: new_job.max_attempts.unwrap_or(self.config.default_max_attempts),
            last_error: None,
            created_at: now,
            scheduled_at: new_job.scheduled_at,
            started_at: None,
            completed_at: None,
            tenant_id: new_job.tenant_id,
            user_id: new_job.user_id,
            tags: new_job.tags,
            dedup_key: new_job.dedup_key,
            trace_id: new_job.trace_id.unwrap_or_else(|| id.to_string()),
            expected_duration_secs: new_job.expected_duration_secs.max(1),
        };

        self.persist(&job, cancel).await?;

        match (job.status, job.scheduled_at) {
            (JobStatus::Pending, _) => {
                self.store.list_push_right(job.priority.queue_key(), &id.to_string(), cancel).await?;
            }
            (JobStatus::Scheduled, Some(at)) => {
                self.store.zadd(DUE_JOBS_KEY, &id.to_string(), at.timestamp() as f64, cancel).await?;
            }
            _ => {}
        }

        self.metrics.record_enqueued(&job.job_type);
        Ok(JobHandle { id, engine: self.clone() })
    }

    pub async fn get(&self, id: Uuid, cancel: &CancellationToken) -> Result<Option<Job>> {
        self.load(id, cancel).await
    }

    /// Cancel a job that hasn't reached a terminal state. A job already
    /// dequeued by a worker is marked cancelled immediately; the worker
    /// notices at completion and will not overwrite it back to `completed`.
    pub async fn cancel(&self, id: Uuid, cancel: &CancellationToken) -> Result<()> {
        let Some(mut job) = self.load(id, cancel).await? else {
            return Err(Error::NotFound(format!("job {id} not found")));
        };
        if job.status.is_terminal() {
            return Err(Error::Conflict(format!("job {id} is already in a terminal state")));
        }

        let was_queued = matches!(job.status, JobStatus::Pending | JobStatus::Scheduled);
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        self.persist(&job, cancel).await?;

        if was_queued {
            self.store.list_remove(job.priority.queue_key(), &id.to_string(), cancel).await?;
            self.store.zrem(DUE_JOBS_KEY, &id.to_string(), cancel).await?;
        }

        self.metrics.record_cancelled(&job.job_type);
        Ok(())
    }

    /// List jobs in `status`, most recently created first, optionally
    /// filtered to those carrying `tag`, paginated by `offset`/`limit`.
    /// Scans every job record, so callers should keep `limit` modest; this
    /// is an admin operation, not a hot path. The admin "execution history"
    /// surface (spec §6) is this same query restricted to terminal statuses
    /// (`completed`/`failed`) with its own offset into the result set.
    pub async fn list_by_status(
        &self,
        status: JobStatus,
        tag: Option<&str>,
        offset: usize,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Job>> {
        let keys = self.store.scan_keys(JOB_SCAN_PATTERN, 100_000, cancel).await?;
        let mut jobs = Vec::new();
        for key in keys {
            if key.ends_with(":lease") {
                continue;
            }
            let Some(raw) = self.store.get(&key, cancel).await? else { continue };
            let Ok(job) = serde_json::from_str::<Job>(&raw) else { continue };
            if job.status != status {
                continue;
            }
            if let Some(tag) = tag {
                if !job.tags.iter().any(|t| t == tag) {
                    continue;
                }
            }
            jobs.push(job);
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    /// Reset a terminal (`failed` or `cancelled`) job back to `pending` with
    /// its attempt counter cleared, and re-enqueue it at its original
    /// priority.
    pub async fn reset(&self, id: Uuid, cancel: &CancellationToken) -> Result<()> {
        let Some(mut job) = self.load(id, cancel).await? else {
            return Err(Error::NotFound(format!("job {id} not found")));
        };
        if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(Error::Conflict(format!("job {id} is not in a resettable state")));
        }
        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.last_error = None;
        job.completed_at = None;
        self.persist(&job, cancel).await?;
        self.store.list_push_right(job.priority.queue_key(), &id.to_string(), cancel).await?;
        Ok(())
    }

    /// Run the priority-aging sweep immediately instead of waiting for the
    /// next scheduled tick. Returns the number of jobs promoted.
    pub async fn trigger_priority_aging(&self, cancel: &CancellationToken) -> Result<u64> {
        self.priority_aging_sweep(cancel).await
    }

    pub async fn queue_depths(&self, cancel: &CancellationToken) -> Result<Vec<(JobPriority, i64)>> {
        let mut depths = Vec::with_capacity(4);
        for priority in JobPriority::DESCENDING {
            let depth = self.store.list_len(priority.queue_key(), cancel).await?;
            depths.push((priority, depth));
        }
        Ok(depths)
    }

    pub async fn failed_jobs(&self, limit: usize, cancel: &CancellationToken) -> Result<Vec<FailureRecord>> {
        let raw = self.store.list_range(FAILED_JOBS_KEY, 0, limit.saturating_sub(1) as isize, cancel).await?;
        Ok(raw.into_iter().filter_map(|r| serde_json::from_str(&r).ok()).collect())
    }

    pub fn alerts(&self) -> Vec<FailureRateAlert> {
        self.alerts.lock().expect("alerts mutex poisoned").iter().cloned().collect()
    }

    pub fn metrics_text(&self) -> Result<String> {
        self.metrics.render()
    }

    /// Purge completed jobs older than `older_than`. Returns the count removed.
    pub async fn purge_completed(&self, older_than: chrono::Duration, cancel: &CancellationToken) -> Result<u64> {
        self.purge_by_status(JobStatus::Completed, older_than, cancel).await
    }

    /// Purge failed jobs older than `older_than`. Returns the count removed.
    pub async fn purge_failed(&self, older_than: chrono::Duration, cancel: &CancellationToken) -> Result<u64> {
        self.purge_by_status(JobStatus::Failed, older_than, cancel).await
    }

    pub async fn create_scheduled(
        &self,
        name: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        schedule: impl Into<String>,
        priority: JobPriority,
        tenant_id: impl Into<String>,
        user_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let mut spec = ScheduledJobSpec {
            id,
            name: name.into(),
            job_type: job_type.into(),
            payload,
            schedule: schedule.into(),
            next_fire_at: Utc::now(),
            last_fire_at: None,
            is_active: true,
            priority,
            tenant_id: tenant_id.into(),
            user_id,
        };
        spec.next_fire_at = spec.compute_next_fire(Utc::now())?;
        self.persist_scheduled(&spec, cancel).await?;
        Ok(id)
    }

    pub async fn deactivate_scheduled(&self, id: Uuid, cancel: &CancellationToken) -> Result<()> {
        let key = ScheduledJobSpec::data_key(id);
        let Some(raw) = self.store.get(&key, cancel).await? else {
            return Err(Error::NotFound(format!("scheduled job {id} not found")));
        };
        let mut spec: ScheduledJobSpec =
            serde_json::from_str(&raw).map_err(|e| Error::Internal(format!("corrupt scheduled job {id}: {e}")))?;
        spec.is_active = false;
        self.persist_scheduled(&spec, cancel).await
    }

    pub async fn get_scheduled(&self, id: Uuid, cancel: &CancellationToken) -> Result<Option<ScheduledJobSpec>> {
        let key = ScheduledJobSpec::data_key(id);
        let Some(raw) = self.store.get(&key, cancel).await? else { return Ok(None) };
        let spec = serde_json::from_str(&raw).map_err(|e| Error::Internal(format!("corrupt scheduled job {id}: {e}")))?;
        Ok(Some(spec))
    }

    /// Update a scheduled job's payload and/or schedule, recomputing its
    /// next fire time from the new cron expression.
    pub async fn update_scheduled(
        &self,
        id: Uuid,
        payload: Option<serde_json::Value>,
        schedule: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ScheduledJobSpec> {
        let Some(mut spec) = self.get_scheduled(id, cancel).await? else {
            return Err(Error::NotFound(format!("scheduled job {id} not found")));
        };
        if let Some(payload) = payload {
            spec.payload = payload;
        }
        if let Some(schedule) = schedule {
            spec.schedule = schedule;
        }
        spec.next_fire_at = spec.compute_next_fire(Utc::now())?;
        self.persist_scheduled(&spec, cancel).await?;
        Ok(spec)
    }

    pub async fn list_scheduled(&self, cancel: &CancellationToken) -> Result<Vec<ScheduledJobSpec>> {
        let keys = self.store.scan_keys(SCHEDULED_SCAN_PATTERN, 10_000, cancel).await?;
        let mut specs = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(raw) = self.store.get(&key, cancel).await? {
                if let Ok(spec) = serde_json::from_str(&raw) {
                    specs.push(spec);
                }
            }
        }
        Ok(specs)
    }

    async fn load(&self, id: Uuid, cancel: &CancellationToken) -> Result<Option<Job>> {
        let Some(raw) = self.store.get(&Job::data_key(id), cancel).await? else { return Ok(None) };
        let job = serde_json::from_str(&raw).map_err(|e| Error::Internal(format!("corrupt job record {id}: {e}")))?;
        Ok(Some(job))
    }

    async fn persist(&self, job: &Job, cancel: &CancellationToken) -> Result<()> {
        let json = serde_json::to_string(job)
            .map_err(|e| Error::Internal(format!("failed to serialize job {}: {e}", job.id)))?;
        self.store.set(&Job::data_key(job.id), &json, None, cancel).await
    }

    async fn persist_scheduled(&self, spec: &ScheduledJobSpec, cancel: &CancellationToken) -> Result<()> {
        let json = serde_json::to_string(spec)
            .map_err(|e| Error::Internal(format!("failed to serialize scheduled job {}: {e}", spec.id)))?;
        self.store.set(&ScheduledJobSpec::data_key(spec.id), &json, None, cancel).await
    }

    async fn purge_by_status(&self, status: JobStatus, older_than: chrono::Duration, cancel: &CancellationToken) -> Result<u64> {
        let now = Utc::now();
        let keys = self.store.scan_keys(JOB_SCAN_PATTERN, 100_000, cancel).await?;
        let mut purged = 0u64;
        for key in keys {
            if key.ends_with(":lease") {
                continue;
            }
            let Some(raw) = self.store.get(&key, cancel).await? else { continue };
            let Ok(job) = serde_json::from_str::<Job>(&raw) else { continue };
            if job.status != status {
                continue;
            }
            let Some(completed_at) = job.completed_at else { continue };
            if now - completed_at < older_than {
                continue;
            }
            self.store.del(&key, cancel).await?;
            purged += 1;
        }
        Ok(purged)
    }

    async fn record_failure(&self, job: &Job, cancel: &CancellationToken) {
        let record = FailureRecord {
            id: job.id,
            job_type: job.job_type.clone(),
            error: job.last_error.clone().unwrap_or_default(),
            attempts: job.attempts,
            failed_at: Utc::now(),
        };
        let Ok(json) = serde_json::to_string(&record) else { return };
        if self.store.list_push_right(FAILED_JOBS_KEY, &json, cancel).await.is_err() {
            return;
        }

        let capacity = self.config.failed_jobs_capacity as i64;
        while let Ok(len) = self.store.list_len(FAILED_JOBS_KEY, cancel).await {
            if len <= capacity {
                break;
            }
            let Ok(oldest) = self.store.list_range(FAILED_JOBS_KEY, 0, 0, cancel).await else { break };
            let Some(value) = oldest.first() else { break };
            if self.store.list_remove(FAILED_JOBS_KEY, value, cancel).await.unwrap_or(0) == 0 {
                break;
            }
        }
    }

    fn check_failure_rate_alert(&self, job_type: &str) {
        let (rate, count) = self.failure_tracker.failure_rate(job_type);
        if count < FAILURE_RATE_MIN_SAMPLES || rate < self.config.failure_rate_alert_threshold {
            return;
        }
        let alert = FailureRateAlert { job_type: job_type.to_string(), failure_rate: rate, sample_count: count, raised_at: Utc::now() };
        tracing::warn!(job_type, failure_rate = rate, sample_count = count, "job failure rate alert");
        let mut alerts = self.alerts.lock().expect("alerts mutex poisoned");
        alerts.push_back(alert);
        if alerts.len() > 100 {
            alerts.pop_front();
        }
    }

    fn schedule_retry(&self, job_id: Uuid, delay: Duration) {
        let engine = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => engine.requeue_after_retry(job_id).await,
            }
        });
    }

    async fn requeue_after_retry(&self, job_id: Uuid) {
        let cancel = self.shutdown.clone();
        let Ok(Some(mut job)) = self.load(job_id, &cancel).await else { return };
        if job.status != JobStatus::Retrying {
            return;
        }
        job.status = JobStatus::Pending;
        if self.persist(&job, &cancel).await.is_err() {
            return;
        }
        let _ = self.store.list_push_right(job.priority.queue_key(), &job_id.to_string(), &cancel).await;
    }

    async fn dispatch_one(&self, id_str: String, worker_name: &str) {
        let Ok(job_id) = Uuid::parse_str(&id_str) else {
            tracing::warn!(id = %id_str, "dequeued non-uuid job id, dropping");
            return;
        };

        let cancel = self.shutdown.child_token();
        let Ok(Some(mut job)) = self.load(job_id, &cancel).await else { return };
        if job.status != JobStatus::Pending {
            // Cancelled, or already picked up by another worker via a stale queue entry.
            return;
        }

        let lease_ttl = Duration::from_secs(job.expected_duration_secs * self.config.lease_multiplier as u64);
        let _ = self.store.set(&Job::lease_key(job_id), worker_name, Some(lease_ttl), &cancel).await;

        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.attempts += 1;
        if self.persist(&job, &cancel).await.is_err() {
            return;
        }

        let handler = self.handlers.get(&job.job_type).map(|h| h.clone());
        let ctx = JobContext {
            job_id,
            trace_id: job.trace_id.clone(),
            tenant_id: job.tenant_id.clone(),
            attempt: job.attempts,
            cancel: cancel.clone(),
        };

        let started = Instant::now();
        let result = match handler {
            Some(handler) => handler.handle(&ctx, &job.payload).await,
            None => Err(Error::Validation(format!("no handler registered for job type '{}'", job.job_type))),
        };
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let _ = self.store.del(&Job::lease_key(job_id), &cancel).await;
        self.finish_dispatch(job, result, duration_ms, &cancel).await;
    }

    async fn finish_dispatch(&self, mut job: Job, result: Result<()>, duration_ms: f64, cancel: &CancellationToken) {
        // A running job can be cancelled out from under the worker; don't
        // resurrect it into completed/failed/retrying once that's happened.
        if let Ok(Some(current)) = self.load(job.id, cancel).await {
            if current.status == JobStatus::Cancelled {
                return;
            }
        }

        match result {
            Ok(()) => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(Utc::now());
                let _ = self.persist(&job, cancel).await;
                self.metrics.record_completed(&job.job_type, duration_ms);
                self.failure_tracker.record(&job.job_type, false, self.config.failure_rate_alert_window());
            }
            Err(e) => {
                self.failure_tracker.record(&job.job_type, true, self.config.failure_rate_alert_window());
                job.last_error = Some(e.to_string());
                if job.attempts < job.max_attempts {
                    job.status = JobStatus::Retrying;
                    let _ = self.persist(&job, cancel).await;
                    self.metrics.record_retried(&job.job_type);
                    self.schedule_retry(job.id, backoff_delay(&self.config, job.attempts));
                } else {
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(Utc::now());
                    let _ = self.persist(&job, cancel).await;
                    self.metrics.record_failed(&job.job_type, duration_ms);
                    self.record_failure(&job, cancel).await;
                }
                self.check_failure_rate_alert(&job.job_type);
            }
        }
    }

    async fn worker_loop(self, worker_name: String) -> anyhow::Result<()> {
        let queue_keys = JobPriority::queue_keys();
        while !self.shutdown.is_cancelled() {
            match self.store.list_pop_left_blocking(&queue_keys, Duration::from_secs(1), &self.shutdown).await {
                Ok(Some((_queue, id))) => self.dispatch_one(id, &worker_name).await,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(worker = %worker_name, error = %e, "job dequeue failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
        Ok(())
    }

    async fn scheduler_loop(self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.scheduler_tick().await {
                        tracing::warn!(error = %e, "job scheduler tick failed");
                    }
                }
            }
        }
    }

    async fn scheduler_tick(&self) -> Result<()> {
        let cancel = self.shutdown.clone();
        let now = Utc::now();

        for key in self.store.scan_keys(SCHEDULED_SCAN_PATTERN, 10_000, &cancel).await? {
            let Some(raw) = self.store.get(&key, &cancel).await? else { continue };
            let Ok(mut spec) = serde_json::from_str::<ScheduledJobSpec>(&raw) else { continue };
            if !spec.is_active || spec.next_fire_at > now {
                continue;
            }

            let mut new_job = NewJob::new(spec.job_type.clone(), spec.payload.clone(), spec.tenant_id.clone())
                .priority(spec.priority)
                .trace_id(format!("scheduled-{}", spec.id));
            if let Some(user_id) = &spec.user_id {
                new_job = new_job.user(user_id.clone());
            }
            if let Err(e) = self.enqueue(new_job, &cancel).await {
                tracing::warn!(scheduled_id = %spec.id, error = %e, "scheduled job fire failed to enqueue");
            }

            spec.last_fire_at = Some(now);
            spec.next_fire_at = spec.compute_next_fire(now)?;
            self.persist_scheduled(&spec, &cancel).await?;
        }

        let due = self.store.zrange_by_score(DUE_JOBS_KEY, f64::MIN, now.timestamp() as f64, Some(500), &cancel).await?;
        for id_str in due {
            let Ok(id) = Uuid::parse_str(&id_str) else { continue };
            self.store.zrem(DUE_JOBS_KEY, &id_str, &cancel).await?;
            let Some(mut job) = self.load(id, &cancel).await? else { continue };
            if job.status != JobStatus::Scheduled {
                continue;
            }
            job.status = JobStatus::Pending;
            self.persist(&job, &cancel).await?;
            self.store.list_push_right(job.priority.queue_key(), &id_str, &cancel).await?;
        }

        Ok(())
    }

    async fn priority_aging_loop(self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.config.priority_aging_interval());
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.priority_aging_sweep(&self.shutdown.clone()).await {
                        tracing::warn!(error = %e, "priority aging sweep failed");
                    }
                }
            }
        }
    }

    async fn priority_aging_sweep(&self, cancel: &CancellationToken) -> Result<u64> {
        let now = Utc::now();
        let threshold = chrono::Duration::seconds(self.config.priority_aging_threshold_secs as i64);
        let mut promoted = 0u64;

        for priority in [JobPriority::Low, JobPriority::Normal] {
            let key = priority.queue_key();
            for id_str in self.store.list_range(key, 0, -1, cancel).await? {
                let Ok(id) = Uuid::parse_str(&id_str) else { continue };
                let Some(mut job) = self.load(id, cancel).await? else { continue };
                if job.status != JobStatus::Pending || now - job.created_at < threshold {
                    continue;
                }
                // Already dequeued by a worker between the range snapshot and now.
                if self.store.list_remove(key, &id_str, cancel).await? == 0 {
                    continue;
                }
                job.priority = job.priority.aged_up();
                self.persist(&job, cancel).await?;
                self.store.list_push_right(job.priority.queue_key(), &id_str, cancel).await?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn lease_reaper_loop(self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.lease_reap_interval_secs));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.lease_reap_sweep().await {
                        tracing::warn!(error = %e, "lease reap sweep failed");
                    }
                }
            }
        }
    }

    async fn lease_reap_sweep(&self) -> Result<()> {
        let cancel = self.shutdown.clone();
        for key in self.store.scan_keys(JOB_SCAN_PATTERN, 10_000, &cancel).await? {
            if key.ends_with(":lease") {
                continue;
            }
            let Some(raw) = self.store.get(&key, &cancel).await? else { continue };
            let Ok(mut job) = serde_json::from_str::<Job>(&raw) else { continue };
            if job.status != JobStatus::Running {
                continue;
            }
            if self.store.get(&Job::lease_key(job.id), &cancel).await?.is_some() {
                continue;
            }

            job.last_error = Some("worker lease expired before completion".to_string());
            if job.attempts < job.max_attempts {
                job.status = JobStatus::Retrying;
                self.persist(&job, &cancel).await?;
                self.metrics.record_retried(&job.job_type);
                self.schedule_retry(job.id, backoff_delay(&self.config, job.attempts));
            } else {
                job.status = JobStatus::Failed;
                job.completed_at = Some(Utc::now());
                self.persist(&job, &cancel).await?;
                self.metrics.record_failed(&job.job_type, 0.0);
                self.record_failure(&job, &cancel).await;
            }
            self.check_failure_rate_alert(&job.job_type);
        }
        Ok(())
    }
}

fn dedup_marker_key(job_type: &str, dedup_key: &str) -> String {
    let hash = blake3::hash(dedup_key.as_bytes()).to_hex();
    format!("dedup:{job_type}:{}", &hash[..32])
}

/// `delay = min(cap, base * 2^(attempts-1)) * (1 +- jitter)`.
fn backoff_delay(config: &JobEngineConfig, attempts: u32) -> Duration {
    use rand::Rng;
    let exp = attempts.saturating_sub(1).min(20);
    let base = config.backoff_base_ms as f64 * 2f64.powi(exp as i32);
    let capped = base.min(config.backoff_cap_ms as f64);
    let jitter_span = capped * config.backoff_jitter;
    let jitter: f64 = rand::rng().random_range(-jitter_span..=jitter_span);
    Duration::from_millis((capped + jitter).max(0.0) as u64)
}

trait JobEngineConfigExt {
    fn failure_rate_alert_window(&self) -> chrono::Duration;
}

impl JobEngineConfigExt for JobEngineConfig {
    fn failure_rate_alert_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.failure_rate_alert_window_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::FakeKeyedStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    struct AlwaysOk;
    #[async_trait]
    impl JobHandler for AlwaysOk {
        async fn handle(&self, _ctx: &JobContext, _payload: &serde_json::Value) -> Result<()> {
            Ok(())
        }
    }

    struct AlwaysFail;
    #[async_trait]
    impl JobHandler for AlwaysFail {
        async fn handle(&self, _ctx: &JobContext, _payload: &serde_json::Value) -> Result<()> {
            Err(Error::Handler("boom".into()))
        }
    }

    struct CountingHandler(Arc<AtomicUsize>);
    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _ctx: &JobContext, _payload: &serde_json::Value) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn bare_engine() -> JobEngine {
        let store: Arc<dyn KeyedStore> = Arc::new(FakeKeyedStore::new());
        JobEngine {
            store,
            config: Arc::new(JobEngineConfig::default()),
            handlers: Arc::new(DashMap::new()),
            metrics: Arc::new(JobMetrics::new()),
            failure_tracker: Arc::new(FailureRateTracker::new()),
            alerts: Arc::new(Mutex::new(VecDeque::new())),
            shutdown: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn enqueue_lands_in_its_priority_queue() {
        let engine = bare_engine();
        let cancel = token();
        let handle = engine
            .enqueue(NewJob::new("email_notification", serde_json::json!({"to": "a@b.com"}), "acme").priority(JobPriority::High), &cancel)
            .await
            .unwrap();

        let depths = engine.queue_depths(&cancel).await.unwrap();
        let high_depth = depths.iter().find(|(p, _)| *p == JobPriority::High).unwrap().1;
        assert_eq!(high_depth, 1);
        assert_eq!(handle.status(&cancel).await.unwrap(), JobStatus::Pending);
    }

    #[tokio::test]
    async fn dedup_key_suppresses_second_enqueue() {
        let engine = bare_engine();
        let cancel = token();
        let first = engine
            .enqueue(NewJob::new("gps_ingest", serde_json::json!({}), "acme").dedup_key("batch-1"), &cancel)
            .await;
        assert!(first.is_ok());

        let second = engine
            .enqueue(NewJob::new("gps_ingest", serde_json::json!({}), "acme").dedup_key("batch-1"), &cancel)
            .await;
        assert!(matches!(second, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn dispatch_one_runs_registered_handler_and_completes() {
        let engine = bare_engine();
        let cancel = token();
        engine.register_handler("email_notification", Arc::new(AlwaysOk));

        let handle = engine
            .enqueue(NewJob::new("email_notification", serde_json::json!({}), "acme"), &cancel)
            .await
            .unwrap();

        let popped = engine
            .store
            .list_pop_left_blocking(&JobPriority::queue_keys(), Duration::from_millis(50), &cancel)
            .await
            .unwrap()
            .unwrap();
        engine.dispatch_one(popped.1, "test-worker").await;

        assert_eq!(handle.status(&cancel).await.unwrap(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn failed_handler_retries_then_terminally_fails() {
        let engine = bare_engine();
        let cancel = token();
        engine.register_handler("risky", Arc::new(AlwaysFail));

        let handle = engine
            .enqueue(NewJob::new("risky", serde_json::json!({}), "acme").max_attempts(1), &cancel)
            .await
            .unwrap();

        let popped = engine
            .store
            .list_pop_left_blocking(&JobPriority::queue_keys(), Duration::from_millis(50), &cancel)
            .await
            .unwrap()
            .unwrap();
        engine.dispatch_one(popped.1, "test-worker").await;

        let job = handle.job(&cancel).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);

        let failed = engine.failed_jobs(10, &cancel).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job_type, "risky");
    }

    #[tokio::test]
    async fn failed_handler_with_attempts_left_retries() {
        let engine = bare_engine();
        let cancel = token();
        engine.register_handler("risky", Arc::new(AlwaysFail));

        let handle = engine
            .enqueue(NewJob::new("risky", serde_json::json!({}), "acme").max_attempts(3), &cancel)
            .await
            .unwrap();

        let popped = engine
            .store
            .list_pop_left_blocking(&JobPriority::queue_keys(), Duration::from_millis(50), &cancel)
            .await
            .unwrap()
            .unwrap();
        engine.dispatch_one(popped.1, "test-worker").await;

        assert_eq!(handle.status(&cancel).await.unwrap(), JobStatus::Retrying);
    }

    #[tokio::test]
    async fn cancel_removes_pending_job_from_its_queue() {
        let engine = bare_engine();
        let cancel = token();
        let handle = engine
            .enqueue(NewJob::new("email_notification", serde_json::json!({}), "acme"), &cancel)
            .await
            .unwrap();

        engine.cancel(handle.id(), &cancel).await.unwrap();
        assert_eq!(handle.status(&cancel).await.unwrap(), JobStatus::Cancelled);

        let depths = engine.queue_depths(&cancel).await.unwrap();
        assert!(depths.iter().all(|(_, depth)| *depth == 0));
    }

    #[tokio::test]
    async fn cancel_twice_is_a_conflict() {
        let engine = bare_engine();
        let cancel = token();
        let handle = engine
            .enqueue(NewJob::new("email_notification", serde_json::json!({}), "acme"), &cancel)
            .await
            .unwrap();
        engine.cancel(handle.id(), &cancel).await.unwrap();
        assert!(matches!(engine.cancel(handle.id(), &cancel).await, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn reset_requeues_a_failed_job_as_pending() {
        let engine = bare_engine();
        let cancel = token();
        let handle = engine
            .enqueue(NewJob::new("email_notification", serde_json::json!({}), "acme"), &cancel)
            .await
            .unwrap();

        {
            let mut job = handle.job(&cancel).await.unwrap().unwrap();
            job.status = JobStatus::Failed;
            job.attempts = job.max_attempts;
            job.last_error = Some("boom".to_string());
            job.completed_at = Some(Utc::now());
            engine.persist(&job, &cancel).await.unwrap();
        }

        engine.reset(handle.id(), &cancel).await.unwrap();

        let job = handle.job(&cancel).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.is_none());
        let depths = engine.queue_depths(&cancel).await.unwrap();
        let normal_depth = depths.iter().find(|(p, _)| *p == JobPriority::Normal).unwrap().1;
        assert_eq!(normal_depth, 1);
    }

    #[tokio::test]
    async fn reset_rejects_a_job_still_pending() {
        let engine = bare_engine();
        let cancel = token();
        let handle = engine
            .enqueue(NewJob::new("email_notification", serde_json::json!({}), "acme"), &cancel)
            .await
            .unwrap();
        assert!(matches!(engine.reset(handle.id(), &cancel).await, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn list_by_status_filters_by_status_and_tag() {
        let engine = bare_engine();
        let cancel = token();
        engine
            .enqueue(NewJob::new("a", serde_json::json!({}), "acme").tag("urgent"), &cancel)
            .await
            .unwrap();
        let tagged = engine
            .enqueue(NewJob::new("b", serde_json::json!({}), "acme").tag("billing"), &cancel)
            .await
            .unwrap();

        let billing = engine.list_by_status(JobStatus::Pending, Some("billing"), 0, 10, &cancel).await.unwrap();
        assert_eq!(billing.len(), 1);
        assert_eq!(billing[0].id, tagged.id());

        let all_pending = engine.list_by_status(JobStatus::Pending, None, 0, 10, &cancel).await.unwrap();
        assert_eq!(all_pending.len(), 2);
    }

    #[tokio::test]
    async fn update_scheduled_changes_payload_and_recomputes_next_fire() {
        let engine = bare_engine();
        let cancel = token();
        let id = engine
            .create_scheduled("nightly", "export_snapshot", serde_json::json!({"v": 1}), "* * * * * *", JobPriority::Low, "acme", None, &cancel)
            .await
            .unwrap();

        let updated = engine
            .update_scheduled(id, Some(serde_json::json!({"v": 2})), None, &cancel)
            .await
            .unwrap();
        assert_eq!(updated.payload, serde_json::json!({"v": 2}));

        let fetched = engine.get_scheduled(id, &cancel).await.unwrap().unwrap();
        assert_eq!(fetched.payload, serde_json::json!({"v": 2}));
    }

    #[tokio::test]
    async fn update_scheduled_rejects_unknown_id() {
        let engine = bare_engine();
        let cancel = token();
        assert!(matches!(
            engine.update_scheduled(Uuid::new_v4(), None, Some("* * * * * *".to_string()), &cancel).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn priority_aging_promotes_stale_low_priority_job() {
        let engine = bare_engine();
        let cancel = token();
        let handle = engine
            .enqueue(NewJob::new("low_prio_task", serde_json::json!({}), "acme").priority(JobPriority::Low), &cancel)
            .await
            .unwrap();

        {
            let mut job = handle.job(&cancel).await.unwrap().unwrap();
            job.created_at = Utc::now() - chrono::Duration::seconds(9000);
            engine.persist(&job, &cancel).await.unwrap();
        }

        assert_eq!(engine.priority_aging_sweep(&cancel).await.unwrap(), 1);

        let job = handle.job(&cancel).await.unwrap().unwrap();
        assert_eq!(job.priority, JobPriority::Normal);
        let depths = engine.queue_depths(&cancel).await.unwrap();
        let normal_depth = depths.iter().find(|(p, _)| *p == JobPriority::Normal).unwrap().1;
        assert_eq!(normal_depth, 1);
    }

    #[tokio::test]
    async fn lease_reaper_retries_job_whose_lease_expired() {
        let engine = bare_engine();
        let cancel = token();
        let counter = Arc::new(AtomicUsize::new(0));
        engine.register_handler("stuck", Arc::new(CountingHandler(counter.clone())));

        let handle = engine
            .enqueue(NewJob::new("stuck", serde_json::json!({}), "acme").max_attempts(3), &cancel)
            .await
            .unwrap();

        // Simulate a worker that started but crashed before renewing or
        // releasing its lease: mark running, never set the lease key.
        let mut job = handle.job(&cancel).await.unwrap().unwrap();
        job.status = JobStatus::Running;
        job.attempts = 1;
        engine.persist(&job, &cancel).await.unwrap();

        engine.lease_reap_sweep().await.unwrap();

        assert_eq!(handle.status(&cancel).await.unwrap(), JobStatus::Retrying);
    }

    #[tokio::test]
    async fn scheduled_job_fires_into_pending_queue() {
        let engine = bare_engine();
        let cancel = token();
        let id = engine
            .create_scheduled("nightly", "export_snapshot", serde_json::json!({}), "* * * * * *", JobPriority::Low, "acme", None, &cancel)
            .await
            .unwrap();

        {
            let key = ScheduledJobSpec::data_key(id);
            let mut spec: ScheduledJobSpec = serde_json::from_str(&engine.store.get(&key, &cancel).await.unwrap().unwrap()).unwrap();
            spec.next_fire_at = Utc::now() - chrono::Duration::seconds(1);
            engine.persist_scheduled(&spec, &cancel).await.unwrap();
        }

        engine.scheduler_tick().await.unwrap();

        let depths = engine.queue_depths(&cancel).await.unwrap();
        let low_depth = depths.iter().find(|(p, _)| *p == JobPriority::Low).unwrap().1;
        assert_eq!(low_depth, 1);

        let specs = engine.list_scheduled(&cancel).await.unwrap();
        assert!(specs[0].last_fire_at.is_some());
        assert!(specs[0].next_fire_at > Utc::now());
    }

    #[tokio::test]
    async fn deactivated_scheduled_job_does_not_fire() {
        let engine = bare_engine();
        let cancel = token();
        let id = engine
            .create_scheduled("nightly", "export_snapshot", serde_json::json!({}), "* * * * * *", JobPriority::Low, "acme", None, &cancel)
            .await
            .unwrap();
        engine.deactivate_scheduled(id, &cancel).await.unwrap();

        engine.scheduler_tick().await.unwrap();

        let depths = engine.queue_depths(&cancel).await.unwrap();
        assert!(depths.iter().all(|(_, d)| *d == 0));
    }

    #[tokio::test]
    async fn purge_completed_removes_old_terminal_jobs() {
        let engine = bare_engine();
        let cancel = token();
        let handle = engine
            .enqueue(NewJob::new("email_notification", serde_json::json!({}), "acme"), &cancel)
            .await
            .unwrap();

        let mut job = handle.job(&cancel).await.unwrap().unwrap();
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now() - chrono::Duration::days(2));
        engine.persist(&job, &cancel).await.unwrap();

        let purged = engine.purge_completed(chrono::Duration::days(1), &cancel).await.unwrap();
        assert_eq!(purged, 1);
        assert!(engine.get(handle.id(), &cancel).await.unwrap().is_none());
    }

    #[test]
    fn backoff_delay_is_bounded_by_cap() {
        let config = JobEngineConfig { backoff_base_ms: 500, backoff_cap_ms: 2_000, backoff_jitter: 0.2, ..JobEngineConfig::default() };
        for attempt in 1..10 {
            let delay = backoff_delay(&config, attempt);
            assert!(delay.as_millis() <= 2_400);
        }
    }
}
