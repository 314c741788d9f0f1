//! jobforge: asynchronous job scheduler with a dynamically sized worker pool.
//!
//! This library distributes long-running data-processing jobs across
//! isolated worker tasks, with per-job timeouts, bounded retries with
//! priority demotion, load-driven pool scaling and graceful shutdown.

// Core modules
pub mod cli;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used types
pub use error::{SchedulerError, SchedulerResult};
pub use handlers::{HandlerError, JobContext, JobHandler, SimulatedHandler};
pub use scheduler::{JobManager, JobResult, JobSpec, JobType, SchedulerConfig, SchedulerStats};
