//! Job handler boundary.
//!
//! The scheduler does not know what a job computes. Workers hand each job's
//! type and payload to a [`JobHandler`] and report the outcome back to the
//! dispatcher. Handlers must tolerate being invoked more than once for the
//! same logical job: failed and timed-out attempts are retried.
//!
//! # Example
//!
//! ```ignore
//! use jobforge::handlers::{HandlerError, JobContext, JobHandler};
//! use jobforge::scheduler::JobType;
//!
//! struct Scorer;
//!
//! #[async_trait::async_trait]
//! impl JobHandler for Scorer {
//!     async fn handle(
//!         &self,
//!         job_type: JobType,
//!         payload: &serde_json::Value,
//!         ctx: &JobContext,
//!     ) -> Result<serde_json::Value, HandlerError> {
//!         ctx.progress().report(50.0, "scoring");
//!         Ok(serde_json::json!({"score": 0.8}))
//!     }
//! }
//! ```

pub mod simulated;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::scheduler::worker::{WorkerId, WorkerMessage};
use crate::scheduler::JobType;

pub use simulated::SimulatedHandler;

/// Errors a handler reports for a failed attempt.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload is not usable by this handler.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The handler does not process this job type.
    #[error("Unsupported job type: {0}")]
    Unsupported(JobType),

    /// Processing failed.
    #[error("Processing failed: {0}")]
    Failed(String),
}

/// Executes jobs on behalf of workers.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Processes one attempt of a job.
    async fn handle(
        &self,
        job_type: JobType,
        payload: &serde_json::Value,
        ctx: &JobContext,
    ) -> Result<serde_json::Value, HandlerError>;

    /// Runs once when a worker starts, before it reports ready.
    ///
    /// Returning an error fails the worker spawn.
    async fn prepare(&self, _worker_id: &WorkerId) -> Result<(), String> {
        Ok(())
    }
}

/// Per-attempt context handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: Uuid,
    worker_id: WorkerId,
    attempt: u32,
    progress: ProgressReporter,
}

impl JobContext {
    pub(crate) fn new(
        job_id: Uuid,
        worker_id: WorkerId,
        attempt: u32,
        outbox: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        Self {
            job_id,
            worker_id,
            attempt,
            progress: ProgressReporter {
                job_id,
                worker_id,
                outbox,
            },
        }
    }

    /// ID of the job being processed.
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// ID of the worker running the attempt.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reporter for progress updates.
    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }
}

/// Sends progress updates from a worker to the dispatcher.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    job_id: Uuid,
    worker_id: WorkerId,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
}

impl ProgressReporter {
    /// Reports progress as a percentage with a short status message.
    pub fn report(&self, percent: f32, message: impl Into<String>) {
        // The dispatcher may already be gone during shutdown.
        let _ = self.outbox.send(WorkerMessage::JobProgress {
            worker_id: self.worker_id,
            job_id: self.job_id,
            percent: percent.clamp(0.0, 100.0),
            message: message.into(),
        });
    }
}
