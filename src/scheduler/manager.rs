//! Public entry point of the scheduler.
//!
//! A [`JobManager`] is a cheap, cloneable handle onto a running dispatcher.
//! Construct one at startup with [`JobManager::start`] and pass clones to
//! whoever needs to submit or observe work. When the last handle is dropped
//! the dispatcher terminates its workers and exits.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::info;
use uuid::Uuid;

use crate::error::{SchedulerError, SchedulerResult};
use crate::handlers::JobHandler;

use super::config::SchedulerConfig;
use super::dispatcher::{Command, Dispatcher, SchedulerStats};
use super::events::{EventBus, SchedulerEvent};
use super::job::{Job, JobResult, JobSpec};
use super::worker_pool::{PoolLimits, WorkerPool};

/// Buffered requests before `enqueue` callers wait on the dispatcher.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Handle to a running scheduler.
#[derive(Clone)]
pub struct JobManager {
    commands: mpsc::Sender<Command>,
    events: EventBus,
    config: Arc<SchedulerConfig>,
}

impl JobManager {
    /// Validates the configuration, creates the minimum number of workers
    /// and starts the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Config` for an invalid configuration and
    /// `SchedulerError::WorkerSpawnFailed` if an initial worker cannot be
    /// created. Workers created before the failure are terminated.
    pub async fn start(
        config: SchedulerConfig,
        handler: Arc<dyn JobHandler>,
    ) -> SchedulerResult<Self> {
        config.validate()?;

        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new(PoolLimits::from_config(&config), handler, message_tx);

        for _ in 0..pool.limits().min_workers {
            if let Err(e) = pool.create_worker().await {
                for worker_id in pool.worker_ids() {
                    pool.remove_worker(worker_id);
                }
                return Err(e);
            }
        }

        info!(
            min_workers = pool.limits().min_workers,
            max_workers = pool.limits().max_workers,
            max_queue_size = config.max_queue_size,
            "Job scheduler starting"
        );

        let events = EventBus::default();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let dispatcher = Dispatcher::new(
            config.clone(),
            pool,
            command_rx,
            message_rx,
            events.clone(),
        );
        tokio::spawn(dispatcher.run());

        Ok(Self {
            commands: command_tx,
            events,
            config: Arc::new(config),
        })
    }

    /// Validates a job specification and queues it.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::InvalidJob` if the `JobSpec` fails validation
    /// - `SchedulerError::QueueFull` if the queue is at capacity
    /// - `SchedulerError::ShuttingDown` once shutdown has begun
    pub async fn enqueue(&self, spec: JobSpec) -> SchedulerResult<Uuid> {
        let job = Job::from_spec(spec, &self.config)?;
        self.request(|reply| Command::Enqueue { job, reply }).await?
    }

    /// Enqueues each spec independently. Partial success is expected: the
    /// returned outcomes line up with the input.
    pub async fn enqueue_batch(&self, specs: Vec<JobSpec>) -> Vec<SchedulerResult<Uuid>> {
        let mut outcomes = Vec::with_capacity(specs.len());
        for spec in specs {
            outcomes.push(self.enqueue(spec).await);
        }
        outcomes
    }

    /// Waits for a job to reach a terminal state.
    ///
    /// Polls the ledger every `await_poll_interval_ms`. The job itself is
    /// unaffected when the wait times out.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::AwaitTimeout` if no result appears within
    /// `timeout`.
    pub async fn await_job(&self, job_id: Uuid, timeout: Duration) -> SchedulerResult<JobResult> {
        tokio::time::timeout(timeout, self.poll_result(job_id))
            .await
            .map_err(|_| SchedulerError::AwaitTimeout(timeout, job_id))?
    }

    async fn poll_result(&self, job_id: Uuid) -> SchedulerResult<JobResult> {
        let poll_interval = self.config.await_poll_interval();
        loop {
            if let Some(result) = self.result(job_id).await? {
                return Ok(result);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Waits for several jobs concurrently. Results are in input order.
    ///
    /// # Errors
    ///
    /// Fails with the first error any individual wait produces.
    pub async fn await_jobs(
        &self,
        job_ids: &[Uuid],
        timeout: Duration,
    ) -> SchedulerResult<Vec<JobResult>> {
        try_join_all(job_ids.iter().map(|id| self.await_job(*id, timeout))).await
    }

    /// Returns the terminal result of a job, if it has one.
    pub async fn result(&self, job_id: Uuid) -> SchedulerResult<Option<JobResult>> {
        self.request(|reply| Command::Lookup { job_id, reply }).await
    }

    /// Returns up to `n` most recent terminal results, newest first.
    pub async fn recent_results(&self, n: usize) -> SchedulerResult<Vec<JobResult>> {
        self.request(|reply| Command::Recent { n, reply }).await
    }

    /// Returns current pool, queue and ledger statistics.
    pub async fn get_stats(&self) -> SchedulerResult<SchedulerStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Subscribes to scheduler events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Configuration the scheduler was started with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Stops dispatching, lets in-flight jobs finish within the grace period,
    /// then terminates every worker.
    ///
    /// Resolves once shutdown has completed. Safe to call repeatedly and
    /// from several handles at once.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_err() {
            // Dispatcher already gone.
            return;
        }
        let _ = done.await;
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> SchedulerResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SchedulerError::DispatcherUnavailable)?;
        response
            .await
            .map_err(|_| SchedulerError::DispatcherUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{HandlerError, JobContext, SimulatedHandler};
    use crate::scheduler::config::ConfigError;
    use crate::scheduler::job::JobType;
    use crate::scheduler::worker::WorkerId;
    use async_trait::async_trait;

    struct BrokenHandler;

    #[async_trait]
    impl JobHandler for BrokenHandler {
        async fn handle(
            &self,
            _job_type: JobType,
            _payload: &serde_json::Value,
            _ctx: &JobContext,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(serde_json::Value::Null)
        }

        async fn prepare(&self, _worker_id: &WorkerId) -> Result<(), String> {
            Err("missing model weights".to_string())
        }
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = SchedulerConfig::default().with_workers(3, 2);
        let result = JobManager::start(config, Arc::new(SimulatedHandler::default())).await;

        assert!(matches!(
            result,
            Err(SchedulerError::Config(ConfigError::ValidationFailed(_)))
        ));
    }

    #[tokio::test]
    async fn test_start_surfaces_spawn_failure() {
        let config = SchedulerConfig::default().with_workers(1, 1);
        let result = JobManager::start(config, Arc::new(BrokenHandler)).await;

        assert!(matches!(result, Err(SchedulerError::WorkerSpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_invalid_spec_is_rejected_before_queueing() {
        let config = SchedulerConfig::default().with_workers(1, 1);
        let manager = JobManager::start(config, Arc::new(SimulatedHandler::default()))
            .await
            .expect("scheduler starts");

        let spec = JobSpec::new(JobType::QualityScoring, serde_json::json!({})).with_priority(99);
        assert!(matches!(
            manager.enqueue(spec).await,
            Err(SchedulerError::InvalidJob(_))
        ));
        assert_eq!(manager.get_stats().await.expect("stats").queue_size, 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_job_has_no_result() {
        let config = SchedulerConfig::default().with_workers(1, 1);
        let manager = JobManager::start(config, Arc::new(SimulatedHandler::default()))
            .await
            .expect("scheduler starts");

        assert!(manager.result(Uuid::new_v4()).await.expect("lookup").is_none());
        assert!(manager.recent_results(5).await.expect("recent").is_empty());

        manager.shutdown().await;
        manager.shutdown().await;
    }
}
