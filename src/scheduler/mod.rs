//! Asynchronous job scheduler with a dynamically sized worker pool.
//!
//! This module distributes long-running jobs across isolated worker tasks:
//!
//! - **JobQueue**: Bounded in-memory queue, priority-ordered, FIFO per tier
//! - **WorkerPool**: Registry of live workers plus the scale up/down policy
//! - **Dispatcher**: Single task owning queue, pool and ledger; assigns jobs,
//!   enforces per-attempt deadlines, retries failures with priority demotion
//! - **ResultLedger**: Bounded history of terminal outcomes and statistics
//! - **JobManager**: Cloneable handle exposing enqueue, await, stats, shutdown
//!
//! # Architecture
//!
//! ```text
//!    ┌────────────┐  Command / oneshot   ┌──────────────────────────────┐
//!    │ JobManager ├─────────────────────►│          Dispatcher          │
//!    │  (clones)  │                      │  JobQueue  WorkerPool  Ledger│
//!    └────────────┘                      └──┬──────────▲───────────▲────┘
//!                             Execute(Job)  │          │ Worker    │ Deadline
//!              ┌────────────────────────────┤          │ Message   │ (timer
//!              ▼                            ▼          │           │  tasks)
//!         ┌─────────┐                  ┌─────────┐     │
//!         │ Worker 1│       ...        │ Worker N├─────┘
//!         └─────────┘                  └─────────┘
//! ```
//!
//! Workers never touch scheduler state; all bookkeeping has a single writer,
//! so no locks are involved.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use jobforge::handlers::SimulatedHandler;
//! use jobforge::scheduler::{JobManager, JobSpec, JobType, SchedulerConfig};
//!
//! let config = SchedulerConfig::default().with_workers(2, 4);
//! let handler = Arc::new(SimulatedHandler::new(Duration::from_millis(50)));
//! let manager = JobManager::start(config, handler).await?;
//!
//! let spec = JobSpec::new(JobType::QualityScoring, serde_json::json!({"sample": 1}))
//!     .with_priority(3);
//! let job_id = manager.enqueue(spec).await?;
//! let result = manager.await_job(job_id, Duration::from_secs(10)).await?;
//!
//! manager.shutdown().await;
//! ```
//!
//! # Reliability Features
//!
//! - **Deadlines**: A worker that overruns a job's timeout is terminated and replaced
//! - **Bounded retries**: Failed attempts are requeued at a demoted priority
//!   until the job's retry budget is spent
//! - **Crash recovery**: A panicking worker's job is failed over, never lost
//! - **Graceful shutdown**: In-flight jobs get a grace period before termination

pub mod config;
mod dispatcher;
pub mod events;
pub mod job;
pub mod ledger;
mod manager;
pub mod queue;
pub mod worker;
pub mod worker_pool;

// Re-export main types for convenience
pub use config::{ConfigError, SchedulerConfig};
pub use dispatcher::SchedulerStats;
pub use events::SchedulerEvent;
pub use job::{FailureKind, Job, JobResult, JobSpec, JobType};
pub use ledger::ResultLedger;
pub use manager::JobManager;
pub use queue::{JobQueue, QueueError};
pub use worker::{WorkerId, WorkerMessage};
pub use worker_pool::{PoolLimits, ScalingDecision, WorkerPool};
