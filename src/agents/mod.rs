//! Agent-based components built on [`acton_reactive`]
//!
//! The `BackgroundWorker` agent supervises long-lived sweep tasks (job
//! scheduler ticks, priority aging, lease reaping, pub/sub bridging) that
//! would otherwise be ad-hoc `tokio::spawn` calls scattered through the
//! job engine and real-time hub. Routing them through one agent gives
//! named task tracking, cancellation, and coordinated shutdown.

mod background_worker;
mod messages;

pub use background_worker::{BackgroundWorker, TaskStatus};
pub use messages::{CancelTask, GetAllTaskStatuses, GetTaskStatus, TaskStatusResponse};
