//! Agent message types for background task reporting
//!
//! These messages define the communication protocol between the
//! `BackgroundWorker` agent and other components in the system.
//!
//! All messages derive `Clone` and `Debug` to satisfy the `ActonMessage` trait
//! requirements via blanket implementation.

// =============================================================================
// Background Worker Agent messages
// =============================================================================

/// Message to cancel a running background task
#[derive(Clone, Debug, Default)]
pub struct CancelTask {
    /// The task ID to cancel
    pub task_id: String,
}

/// Message to query the status of a specific task
#[derive(Clone, Debug, Default)]
pub struct GetTaskStatus {
    /// The task ID to query
    pub task_id: String,
}

/// Message to query the status of all tasks
#[derive(Clone, Debug, Default)]
pub struct GetAllTaskStatuses;

/// Response containing task status information
#[derive(Clone, Debug, Default)]
pub struct TaskStatusResponse {
    /// The task ID
    pub task_id: String,
    /// Current status of the task
    pub status: super::background_worker::TaskStatus,
}
