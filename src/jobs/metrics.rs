//! Prometheus metrics and failure-rate tracking for the job engine.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use prometheus::{Encoder, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

/// Wraps the engine's Prometheus registry and the counters/histograms it
/// exposes, one series per job type.
pub struct JobMetrics {
    registry: Registry,
    enqueued: IntCounterVec,
    completed: IntCounterVec,
    failed: IntCounterVec,
    retried: IntCounterVec,
    cancelled: IntCounterVec,
    duration_ms: HistogramVec,
}

impl JobMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let enqueued = IntCounterVec::new(
            Opts::new("job_enqueued_total", "Jobs enqueued, by job type"),
            &["job_type"],
        )
        .expect("valid metric opts");
        let completed = IntCounterVec::new(
            Opts::new("job_completed_total", "Jobs completed successfully, by job type"),
            &["job_type"],
        )
        .expect("valid metric opts");
        let failed = IntCounterVec::new(
            Opts::new("job_failed_total", "Jobs that exhausted retries, by job type"),
            &["job_type"],
        )
        .expect("valid metric opts");
        let retried = IntCounterVec::new(
            Opts::new("job_retried_total", "Retry attempts scheduled, by job type"),
            &["job_type"],
        )
        .expect("valid metric opts");
        let cancelled = IntCounterVec::new(
            Opts::new("job_cancelled_total", "Jobs cancelled, by job type"),
            &["job_type"],
        )
        .expect("valid metric opts");
        let duration_ms = HistogramVec::new(
            prometheus::HistogramOpts::new("job_duration_milliseconds", "Handler execution time, by job type")
                .buckets(vec![10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 30_000.0, 120_000.0]),
            &["job_type"],
        )
        .expect("valid histogram opts");

        registry.register(Box::new(enqueued.clone())).expect("register enqueued");
        registry.register(Box::new(completed.clone())).expect("register completed");
        registry.register(Box::new(failed.clone())).expect("register failed");
        registry.register(Box::new(retried.clone())).expect("register retried");
        registry.register(Box::new(cancelled.clone())).expect("register cancelled");
        registry.register(Box::new(duration_ms.clone())).expect("register duration");

        Self { registry, enqueued, completed, failed, retried, cancelled, duration_ms }
    }

    pub fn record_enqueued(&self, job_type: &str) {
        self.enqueued.with_label_values(&[job_type]).inc();
    }

    pub fn record_completed(&self, job_type: &str, duration_ms: f64) {
        self.completed.with_label_values(&[job_type]).inc();
        self.duration_ms.with_label_values(&[job_type]).observe(duration_ms);
    }

    pub fn record_failed(&self, job_type: &str, duration_ms: f64) {
        self.failed.with_label_values(&[job_type]).inc();
        self.duration_ms.with_label_values(&[job_type]).observe(duration_ms);
    }

    pub fn record_retried(&self, job_type: &str) {
        self.retried.with_label_values(&[job_type]).inc();
    }

    pub fn record_cancelled(&self, job_type: &str) {
        self.cancelled.with_label_values(&[job_type]).inc();
    }

    /// Render the registry in Prometheus text exposition format, for the
    /// admin `/jobs/metrics` endpoint.
    pub fn render(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|e| Error::Internal(format!("failed to encode job metrics: {e}")))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("non-utf8 metrics output: {e}")))
    }
}

impl Default for JobMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// An alert raised when a job type's failure rate crosses
/// `failure_rate_alert_threshold` over `failure_rate_alert_window_secs`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FailureRateAlert {
    pub job_type: String,
    pub failure_rate: f64,
    pub sample_count: usize,
    pub raised_at: DateTime<Utc>,
}

struct Sample {
    at: DateTime<Utc>,
    failed: bool,
}

/// Tracks a rolling window of success/failure outcomes per job type,
/// in-process. Rebuilt from scratch on restart; this is an operational
/// signal, not a durable record.
#[derive(Default)]
pub struct FailureRateTracker {
    outcomes: DashMap<String, Mutex<VecDeque<Sample>>>,
}

impl FailureRateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, job_type: &str, failed: bool, window: chrono::Duration) {
        let now = Utc::now();
        let entry = self.outcomes.entry(job_type.to_string()).or_default();
        let mut samples = entry.lock().expect("failure rate tracker mutex poisoned");
        samples.push_back(Sample { at: now, failed });
        let cutoff = now - window;
        while samples.front().is_some_and(|s| s.at < cutoff) {
            samples.pop_front();
        }
    }

    /// Current failure rate for `job_type` over its tracked window, and the
    /// sample count it was computed from.
    pub fn failure_rate(&self, job_type: &str) -> (f64, usize) {
        let Some(entry) = self.outcomes.get(job_type) else { return (0.0, 0) };
        let samples = entry.lock().expect("failure rate tracker mutex poisoned");
        if samples.is_empty() {
            return (0.0, 0);
        }
        let failed = samples.iter().filter(|s| s.failed).count();
        (failed as f64 / samples.len() as f64, samples.len())
    }

    pub fn job_types(&self) -> Vec<String> {
        self.outcomes.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_includes_counters() {
        let metrics = JobMetrics::new();
        metrics.record_enqueued("email_notification");
        metrics.record_completed("email_notification", 42.0);
        let text = metrics.render().unwrap();
        assert!(text.contains("job_enqueued_total"));
        assert!(text.contains("job_duration_milliseconds"));
    }

    #[test]
    fn failure_rate_tracks_rolling_window() {
        let tracker = FailureRateTracker::new();
        for _ in 0..3 {
            tracker.record("gps_ingest", true, chrono::Duration::seconds(300));
        }
        tracker.record("gps_ingest", false, chrono::Duration::seconds(300));
        let (rate, count) = tracker.failure_rate("gps_ingest");
        assert_eq!(count, 4);
        assert!((rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn failure_rate_unknown_type_is_zero() {
        let tracker = FailureRateTracker::new();
        let (rate, count) = tracker.failure_rate("unknown");
        assert_eq!(rate, 0.0);
        assert_eq!(count, 0);
    }
}
