//! Error types for jobforge operations.
//!
//! `SchedulerError` is the error surfaced by the public scheduler API.
//! Transient conditions (timeouts, handler failures, worker crashes) are
//! recovered inside the dispatcher and only reach callers once a job's
//! retry budget is exhausted.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::config::ConfigError;
use crate::scheduler::queue::QueueError;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Enqueue rejected because the queue is at capacity.
    #[error("Job queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The pool could not create a worker.
    #[error("Worker spawn failed: {0}")]
    WorkerSpawnFailed(String),

    /// A job attempt exceeded its time budget.
    #[error("Job {job_id} timed out after {timeout_ms}ms")]
    JobTimeout { job_id: Uuid, timeout_ms: u64 },

    /// The handler reported a failure for a job attempt.
    #[error("Job {job_id} failed: {reason}")]
    JobExecutionFailed { job_id: Uuid, reason: String },

    /// A job failed terminally after using its retry budget.
    #[error("Job {job_id} failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        job_id: Uuid,
        attempts: u32,
        last_error: String,
    },

    /// A caller-side wait elapsed before the job reached a terminal state.
    #[error("Timed out after {0:?} waiting for job {1}")]
    AwaitTimeout(Duration, Uuid),

    /// The job was still running when the shutdown grace period elapsed.
    #[error("Job {job_id} was terminated by shutdown")]
    ShutdownForced { job_id: Uuid },

    /// The job specification failed validation.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// The scheduler is shutting down and no longer accepts work.
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// The dispatcher task is gone.
    #[error("Dispatcher is not running")]
    DispatcherUnavailable,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<QueueError> for SchedulerError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::QueueFull { capacity } => SchedulerError::QueueFull { capacity },
        }
    }
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
