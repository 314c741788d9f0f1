//! Worker pool: the registry of live worker units and the scaling policy.
//!
//! The pool is owned by the dispatcher. Workers live in an ordered map keyed
//! by [`WorkerId`], so removing or replacing one never disturbs the others.
//! A removed worker is never reused; its ID is retired.
//!
//! # Scaling
//!
//! Evaluated once per dispatcher tick by [`WorkerPool::plan_scaling`]:
//!
//! - Below `min_workers`: top up to the floor.
//! - Backlog (`pending > available`) and room below `max_workers`: add
//!   `min(backlog, max - total, max_spawns_per_tick)` workers.
//! - Empty queue and above `min_workers`: remove workers idle for longer
//!   than the idle timeout, oldest-idle first, down to the floor.
//!
//! Workers still starting count toward `total` and `available`, so a tick
//! never asks for the same worker twice.
//!
//! # Startup
//!
//! [`WorkerPool::create_worker`] waits for the new worker inline and is used
//! before the dispatcher runs. The dispatcher uses
//! [`WorkerPool::begin_spawn`] instead: the worker is tracked as starting and
//! its readiness arrives later as [`WorkerMessage::Ready`], which
//! [`WorkerPool::finish_spawn`] turns into a live unit.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::handlers::JobHandler;

use super::config::SchedulerConfig;
use super::job::Job;
use super::worker::{await_ready, spawn_worker, WorkerCommand, WorkerId, WorkerMessage};

/// Bounds and timings the pool enforces.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    /// Floor on live workers.
    pub min_workers: usize,
    /// Ceiling on live workers.
    pub max_workers: usize,
    /// Idle time after which a surplus worker may be removed.
    pub idle_timeout: Duration,
    /// How long a new worker may take to signal ready.
    pub spawn_timeout: Duration,
    /// Maximum workers created per scaling evaluation.
    pub max_spawns_per_tick: usize,
}

impl PoolLimits {
    /// Derives pool limits from the scheduler configuration.
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            min_workers: config.effective_min_workers(),
            max_workers: config.effective_max_workers(),
            idle_timeout: config.worker_idle_timeout(),
            spawn_timeout: config.worker_spawn_timeout(),
            max_spawns_per_tick: config.max_spawns_per_tick,
        }
    }
}

/// The binding of a job to the worker running it.
#[derive(Debug)]
pub struct Assignment {
    /// The job being executed.
    pub job: Job,
    /// Unique token of this attempt; stale deadlines carry an older token.
    pub token: u64,
    /// When the attempt was dispatched.
    pub started: Instant,
    /// Timer task that fires the attempt's deadline.
    pub deadline: AbortHandle,
}

impl Assignment {
    /// Milliseconds since the attempt was dispatched.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// A live worker as seen by the pool.
#[derive(Debug)]
pub struct WorkerUnit {
    /// Unique ID.
    pub id: WorkerId,
    /// When the worker was created.
    pub created_at: DateTime<Utc>,
    /// When the worker last finished (or started idling).
    pub last_used_at: Instant,
    /// Number of jobs this worker completed successfully.
    pub jobs_completed: u64,
    /// The job currently bound to this worker.
    pub current: Option<Assignment>,
    commands: mpsc::Sender<WorkerCommand>,
    abort: AbortHandle,
}

impl WorkerUnit {
    /// Returns whether the worker is free to take a job.
    pub fn is_available(&self) -> bool {
        self.current.is_none()
    }
}

/// A worker whose `prepare` hook has not reported yet.
#[derive(Debug)]
struct StartingWorker {
    commands: mpsc::Sender<WorkerCommand>,
    abort: AbortHandle,
}

fn spawn_failed(id: WorkerId, abort: &AbortHandle, reason: String) -> SchedulerError {
    abort.abort();
    warn!(worker_id = %id, reason = %reason, "Worker spawn failed");
    SchedulerError::WorkerSpawnFailed(reason)
}

/// Outcome of a scaling evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalingDecision {
    /// Leave the pool as it is.
    Hold,
    /// Create this many workers.
    ScaleUp(usize),
    /// Remove these idle workers.
    ScaleDown(Vec<WorkerId>),
}

/// Pool of worker units.
pub struct WorkerPool {
    workers: BTreeMap<WorkerId, WorkerUnit>,
    starting: BTreeMap<WorkerId, StartingWorker>,
    next_seq: u64,
    limits: PoolLimits,
    handler: Arc<dyn JobHandler>,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerPool {
    /// Creates an empty pool whose workers report to `outbox`.
    pub fn new(
        limits: PoolLimits,
        handler: Arc<dyn JobHandler>,
        outbox: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        Self {
            workers: BTreeMap::new(),
            starting: BTreeMap::new(),
            next_seq: 1,
            limits,
            handler,
            outbox,
        }
    }

    /// Spawns a worker and waits for it to signal ready.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::WorkerSpawnFailed` if the handler's prepare
    /// hook fails, the worker dies before signalling, or it does not signal
    /// within the spawn timeout. The half-started task is aborted.
    pub async fn create_worker(&mut self) -> Result<WorkerId, SchedulerError> {
        let id = self.next_id();
        let spawned = spawn_worker(id, Arc::clone(&self.handler), self.outbox.clone());
        match await_ready(id, spawned.ready, self.limits.spawn_timeout).await {
            Ok(()) => {
                self.register(id, spawned.commands, spawned.abort);
                Ok(id)
            }
            Err(reason) => Err(spawn_failed(id, &spawned.abort, reason)),
        }
    }

    /// Spawns a worker without waiting for it.
    ///
    /// The worker counts as starting until its [`WorkerMessage::Ready`]
    /// reaches the outbox, at which point the owner calls
    /// [`finish_spawn`](Self::finish_spawn).
    pub fn begin_spawn(&mut self) -> WorkerId {
        let id = self.next_id();
        let spawned = spawn_worker(id, Arc::clone(&self.handler), self.outbox.clone());

        let outbox = self.outbox.clone();
        let timeout = self.limits.spawn_timeout;
        let ready = spawned.ready;
        tokio::spawn(async move {
            let result = await_ready(id, ready, timeout).await;
            let _ = outbox.send(WorkerMessage::Ready {
                worker_id: id,
                result,
            });
        });

        self.starting.insert(
            id,
            StartingWorker {
                commands: spawned.commands,
                abort: spawned.abort,
            },
        );
        debug!(worker_id = %id, starting = self.starting.len(), "Worker starting");
        id
    }

    /// Completes a spawn begun with [`begin_spawn`](Self::begin_spawn).
    ///
    /// Returns `None` if the worker is not starting (cancelled, or already
    /// finished). On failure the task is aborted.
    pub fn finish_spawn(
        &mut self,
        id: WorkerId,
        result: Result<(), String>,
    ) -> Option<Result<WorkerId, SchedulerError>> {
        let starting = self.starting.remove(&id)?;
        Some(match result {
            Ok(()) => {
                self.register(id, starting.commands, starting.abort);
                Ok(id)
            }
            Err(reason) => Err(spawn_failed(id, &starting.abort, reason)),
        })
    }

    /// Aborts every worker that is still starting. Returns how many.
    pub fn cancel_starting(&mut self) -> usize {
        let count = self.starting.len();
        for (id, starting) in std::mem::take(&mut self.starting) {
            starting.abort.abort();
            debug!(worker_id = %id, "Worker startup cancelled");
        }
        count
    }

    fn register(&mut self, id: WorkerId, commands: mpsc::Sender<WorkerCommand>, abort: AbortHandle) {
        self.workers.insert(
            id,
            WorkerUnit {
                id,
                created_at: Utc::now(),
                last_used_at: Instant::now(),
                jobs_completed: 0,
                current: None,
                commands,
                abort,
            },
        );
        info!(worker_id = %id, total_workers = self.workers.len(), "Worker created");
    }

    fn next_id(&mut self) -> WorkerId {
        let id = WorkerId::new(self.next_seq);
        self.next_seq += 1;
        id
    }

    /// Forcibly terminates a worker and removes it from the pool.
    ///
    /// Returns `None` for an unknown worker, otherwise the assignment the
    /// worker was running. The caller must settle that job.
    pub fn remove_worker(&mut self, id: WorkerId) -> Option<Option<Assignment>> {
        let mut unit = self.workers.remove(&id)?;
        unit.abort.abort();

        let assignment = unit.current.take();
        if let Some(ref assignment) = assignment {
            assignment.deadline.abort();
        }

        info!(
            worker_id = %id,
            jobs_completed = unit.jobs_completed,
            had_job = assignment.is_some(),
            total_workers = self.workers.len(),
            "Worker removed"
        );
        Some(assignment)
    }

    /// Binds a job to an idle worker and sends it over the worker's channel.
    ///
    /// # Errors
    ///
    /// If the worker is unknown, busy, or its channel is closed, the job is
    /// handed back untouched.
    pub fn assign(
        &mut self,
        id: WorkerId,
        mut job: Job,
        token: u64,
        deadline: AbortHandle,
    ) -> Result<(), (Job, AbortHandle)> {
        let Some(unit) = self.workers.get_mut(&id) else {
            return Err((job, deadline));
        };
        if !unit.is_available() {
            return Err((job, deadline));
        }

        job.assigned_worker_id = Some(id.to_string());
        job.started_at = Some(Utc::now());

        // Capacity is one and the worker is idle, so the slot is free.
        if let Err(e) = unit.commands.try_send(WorkerCommand::Execute(job.clone())) {
            debug!(worker_id = %id, error = %e, "Worker rejected job");
            job.assigned_worker_id = None;
            job.started_at = None;
            return Err((job, deadline));
        }

        unit.current = Some(Assignment {
            job,
            token,
            started: Instant::now(),
            deadline,
        });
        Ok(())
    }

    /// Unbinds the worker's current job.
    ///
    /// `success` bumps the worker's completion counter.
    pub fn release(&mut self, id: WorkerId, success: bool) -> Option<Assignment> {
        let unit = self.workers.get_mut(&id)?;
        let assignment = unit.current.take()?;
        assignment.deadline.abort();
        unit.last_used_at = Instant::now();
        if success {
            unit.jobs_completed += 1;
        }
        Some(assignment)
    }

    /// Evaluates the scaling policy for the current backlog.
    pub fn plan_scaling(&self, pending: usize, now: Instant) -> ScalingDecision {
        let starting = self.starting_count();
        let total = self.total_count() + starting;
        let available = self.available_count() + starting;
        let limits = &self.limits;

        let mut grow = limits.min_workers.saturating_sub(total);
        if pending > available && total < limits.max_workers {
            let backlog = pending - available;
            let burst = backlog
                .min(limits.max_workers - total)
                .min(limits.max_spawns_per_tick);
            grow = grow.max(burst);
        }
        if grow > 0 {
            return ScalingDecision::ScaleUp(grow);
        }

        if pending == 0 && starting == 0 && total > limits.min_workers {
            let mut idle: Vec<&WorkerUnit> = self
                .workers
                .values()
                .filter(|w| {
                    w.is_available()
                        && now.saturating_duration_since(w.last_used_at) > limits.idle_timeout
                })
                .collect();
            idle.sort_by_key(|w| w.last_used_at);

            let surplus = total - limits.min_workers;
            let victims: Vec<WorkerId> = idle.into_iter().take(surplus).map(|w| w.id).collect();
            if !victims.is_empty() {
                return ScalingDecision::ScaleDown(victims);
            }
        }

        ScalingDecision::Hold
    }

    /// IDs of idle workers, oldest first.
    pub fn available_ids(&self) -> Vec<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.is_available())
            .map(|w| w.id)
            .collect()
    }

    /// IDs of all workers, oldest first.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    /// Returns a worker by ID.
    pub fn get(&self, id: WorkerId) -> Option<&WorkerUnit> {
        self.workers.get(&id)
    }

    /// Number of live workers.
    pub fn total_count(&self) -> usize {
        self.workers.len()
    }

    /// Number of workers spawned but not yet ready.
    pub fn starting_count(&self) -> usize {
        self.starting.len()
    }

    /// Live plus starting workers.
    pub fn headcount(&self) -> usize {
        self.total_count() + self.starting_count()
    }

    /// Number of idle workers.
    pub fn available_count(&self) -> usize {
        self.workers.values().filter(|w| w.is_available()).count()
    }

    /// Number of workers running a job.
    pub fn busy_count(&self) -> usize {
        self.total_count() - self.available_count()
    }

    /// Pool bounds.
    pub fn limits(&self) -> &PoolLimits {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{HandlerError, JobContext, SimulatedHandler};
    use crate::scheduler::job::{JobSpec, JobType};
    use async_trait::async_trait;

    struct UnpreparedHandler;

    #[async_trait]
    impl JobHandler for UnpreparedHandler {
        async fn handle(
            &self,
            _job_type: JobType,
            _payload: &serde_json::Value,
            _ctx: &JobContext,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(serde_json::Value::Null)
        }

        async fn prepare(&self, _worker_id: &WorkerId) -> Result<(), String> {
            Err("cannot start".to_string())
        }
    }

    fn limits(min: usize, max: usize) -> PoolLimits {
        PoolLimits {
            min_workers: min,
            max_workers: max,
            idle_timeout: Duration::from_millis(50),
            spawn_timeout: Duration::from_secs(5),
            max_spawns_per_tick: 3,
        }
    }

    fn test_pool(min: usize, max: usize) -> (WorkerPool, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(SimulatedHandler::new(Duration::from_secs(5)));
        (WorkerPool::new(limits(min, max), handler, tx), rx)
    }

    fn test_job() -> Job {
        Job::from_spec(
            JobSpec::new(JobType::SessionProcessing, serde_json::json!({})),
            &SchedulerConfig::default(),
        )
        .expect("valid job")
    }

    fn idle_timer() -> AbortHandle {
        tokio::spawn(std::future::pending::<()>()).abort_handle()
    }

    #[tokio::test]
    async fn test_empty_pool_scales_to_minimum() {
        let (pool, _rx) = test_pool(2, 4);
        assert_eq!(
            pool.plan_scaling(0, Instant::now()),
            ScalingDecision::ScaleUp(2)
        );
    }

    #[tokio::test]
    async fn test_backlog_scale_up_is_capped_per_tick() {
        let (mut pool, _rx) = test_pool(1, 8);
        pool.create_worker().await.expect("spawn");

        // backlog 9 > 1 available, room for 7, capped at 3
        assert_eq!(
            pool.plan_scaling(10, Instant::now()),
            ScalingDecision::ScaleUp(3)
        );
        // backlog 1 -> exactly one more
        assert_eq!(
            pool.plan_scaling(2, Instant::now()),
            ScalingDecision::ScaleUp(1)
        );
        // no backlog beyond available capacity
        assert_eq!(pool.plan_scaling(1, Instant::now()), ScalingDecision::Hold);
    }

    #[tokio::test]
    async fn test_scale_up_respects_ceiling() {
        let (mut pool, _rx) = test_pool(2, 2);
        pool.create_worker().await.expect("spawn");
        pool.create_worker().await.expect("spawn");

        assert_eq!(pool.plan_scaling(50, Instant::now()), ScalingDecision::Hold);
    }

    #[tokio::test]
    async fn test_idle_workers_scale_down_to_minimum() {
        let (mut pool, _rx) = test_pool(1, 4);
        for _ in 0..3 {
            pool.create_worker().await.expect("spawn");
        }

        // Not idle long enough yet.
        assert_eq!(pool.plan_scaling(0, Instant::now()), ScalingDecision::Hold);

        let later = Instant::now() + Duration::from_millis(200);
        match pool.plan_scaling(0, later) {
            ScalingDecision::ScaleDown(victims) => assert_eq!(victims.len(), 2),
            other => panic!("unexpected decision: {:?}", other),
        }

        // Pending work suppresses scale-down.
        assert!(!matches!(
            pool.plan_scaling(1, later),
            ScalingDecision::ScaleDown(_)
        ));
    }

    #[tokio::test]
    async fn test_busy_workers_are_not_scaled_down() {
        let (mut pool, _rx) = test_pool(0, 2);
        let id = pool.create_worker().await.expect("spawn");
        pool.assign(id, test_job(), 1, idle_timer())
            .expect("idle worker accepts job");

        let later = Instant::now() + Duration::from_secs(10);
        assert_eq!(pool.plan_scaling(0, later), ScalingDecision::Hold);
    }

    #[tokio::test]
    async fn test_assign_binds_exactly_one_job() {
        let (mut pool, _rx) = test_pool(1, 2);
        let id = pool.create_worker().await.expect("spawn");

        pool.assign(id, test_job(), 1, idle_timer())
            .expect("idle worker accepts job");
        assert!(!pool.get(id).expect("worker").is_available());
        assert_eq!(pool.busy_count(), 1);

        let (rejected, _) = pool
            .assign(id, test_job(), 2, idle_timer())
            .expect_err("busy worker rejects second job");
        assert!(rejected.assigned_worker_id.is_none());

        let released = pool.release(id, true).expect("assignment");
        assert_eq!(released.token, 1);
        assert_eq!(released.job.assigned_worker_id, Some(id.to_string()));
        assert_eq!(pool.get(id).expect("worker").jobs_completed, 1);
        assert_eq!(pool.available_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_worker_returns_bound_job() {
        let (mut pool, _rx) = test_pool(1, 2);
        let id = pool.create_worker().await.expect("spawn");
        let job = test_job();
        let job_id = job.id;
        pool.assign(id, job, 1, idle_timer()).expect("assign");

        let removed = pool.remove_worker(id).expect("worker existed");
        assert_eq!(removed.map(|a| a.job.id), Some(job_id));
        assert_eq!(pool.total_count(), 0);
        assert!(pool.remove_worker(id).is_none());
    }

    #[tokio::test]
    async fn test_worker_ids_are_never_reused() {
        let (mut pool, _rx) = test_pool(1, 2);
        let first = pool.create_worker().await.expect("spawn");
        pool.remove_worker(first);
        let second = pool.create_worker().await.expect("spawn");
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_background_spawn_registers_on_ready() {
        let (mut pool, mut rx) = test_pool(1, 8);
        let id = pool.begin_spawn();
        assert_eq!(pool.starting_count(), 1);
        assert_eq!(pool.total_count(), 0);

        // A starting worker covers the floor and one pending job.
        assert_eq!(pool.plan_scaling(0, Instant::now()), ScalingDecision::Hold);
        assert_eq!(pool.plan_scaling(1, Instant::now()), ScalingDecision::Hold);
        assert_eq!(
            pool.plan_scaling(3, Instant::now()),
            ScalingDecision::ScaleUp(2)
        );

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("ready in time")
            .expect("outbox open");
        let WorkerMessage::Ready { worker_id, result } = message else {
            panic!("unexpected message: {:?}", message);
        };
        assert_eq!(worker_id, id);

        let created = pool
            .finish_spawn(worker_id, result)
            .expect("worker was starting")
            .expect("worker prepared");
        assert_eq!(created, id);
        assert_eq!(pool.total_count(), 1);
        assert_eq!(pool.starting_count(), 0);
        assert!(pool.finish_spawn(id, Ok(())).is_none());
    }

    #[tokio::test]
    async fn test_failed_background_spawn_is_not_registered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new(limits(1, 2), Arc::new(UnpreparedHandler), tx);
        pool.begin_spawn();

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("ready in time")
            .expect("outbox open");
        let WorkerMessage::Ready { worker_id, result } = message else {
            panic!("unexpected message: {:?}", message);
        };

        let err = pool
            .finish_spawn(worker_id, result)
            .expect("worker was starting")
            .expect_err("prepare fails");
        assert!(matches!(err, SchedulerError::WorkerSpawnFailed(_)));
        assert_eq!(pool.headcount(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_spawn_is_ignored() {
        let (mut pool, _rx) = test_pool(1, 2);
        let id = pool.begin_spawn();

        assert_eq!(pool.cancel_starting(), 1);
        assert!(pool.finish_spawn(id, Ok(())).is_none());
        assert_eq!(pool.headcount(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_surfaced() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new(limits(1, 2), Arc::new(UnpreparedHandler), tx);

        let err = pool.create_worker().await.expect_err("prepare fails");
        assert!(matches!(err, SchedulerError::WorkerSpawnFailed(_)));
        assert_eq!(pool.total_count(), 0);
    }
}
