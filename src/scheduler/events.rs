//! Scheduler notifications for observability consumers.
//!
//! The dispatcher publishes a [`SchedulerEvent`] for every state change on a
//! `broadcast` channel. Publishing never blocks and events are dropped when
//! nobody is subscribed; slow subscribers observe `RecvError::Lagged`.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::job::{FailureKind, JobType};
use super::worker::WorkerId;

/// Capacity of the event channel before slow subscribers start lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A state change inside the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A job was accepted into the queue.
    JobQueued {
        job_id: Uuid,
        job_type: JobType,
        priority: u32,
    },
    /// A job attempt was dispatched to a worker.
    JobStarted {
        job_id: Uuid,
        worker_id: WorkerId,
        attempt: u32,
    },
    /// A handler reported progress.
    JobProgress {
        job_id: Uuid,
        worker_id: WorkerId,
        percent: f32,
        message: String,
    },
    /// A failed attempt was requeued at a demoted priority.
    JobRetried {
        job_id: Uuid,
        retry_count: u32,
        priority: u32,
        error: String,
    },
    /// A job finished successfully.
    JobCompleted {
        job_id: Uuid,
        worker_id: WorkerId,
        processing_time_ms: u64,
    },
    /// A job failed terminally.
    JobFailed {
        job_id: Uuid,
        failure: FailureKind,
        attempts: u32,
        error: String,
    },
    /// A worker joined the pool.
    WorkerCreated { worker_id: WorkerId },
    /// A worker left the pool.
    WorkerRemoved { worker_id: WorkerId, reason: String },
    /// The pool failed to create a worker.
    WorkerSpawnFailed { error: String },
}

impl SchedulerEvent {
    /// Returns the job this event concerns, if any.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            SchedulerEvent::JobQueued { job_id, .. }
            | SchedulerEvent::JobStarted { job_id, .. }
            | SchedulerEvent::JobProgress { job_id, .. }
            | SchedulerEvent::JobRetried { job_id, .. }
            | SchedulerEvent::JobCompleted { job_id, .. }
            | SchedulerEvent::JobFailed { job_id, .. } => Some(*job_id),
            SchedulerEvent::WorkerCreated { .. }
            | SchedulerEvent::WorkerRemoved { .. }
            | SchedulerEvent::WorkerSpawnFailed { .. } => None,
        }
    }
}

/// Publishing side of the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event. No subscribers is not an error.
    pub fn emit(&self, event: SchedulerEvent) {
        let _ = self.sender.send(event);
    }

    /// Returns a receiver for events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}
