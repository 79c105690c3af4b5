//! Background job engine (spec component D): priority queues, retry with
//! jittered backoff, dedup, scheduled/cron jobs, worker leases, and
//! failure-rate alerting, all built on the [`crate::keystore::KeyedStore`]
//! abstraction.

mod engine;
mod metrics;
mod model;

pub use engine::{FailureRecord, JobEngine, JobHandle};
pub use metrics::{FailureRateAlert, FailureRateTracker, JobMetrics};
pub use model::{Job, JobContext, JobHandler, JobPriority, JobStatus, NewJob, ScheduledJobSpec};
