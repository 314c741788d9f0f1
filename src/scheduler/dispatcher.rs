//! The dispatcher: single writer of all scheduler bookkeeping.
//!
//! One tokio task owns the [`JobQueue`], the [`WorkerPool`] and the
//! [`ResultLedger`]. Everything else talks to it through channels:
//!
//! - `Command`s from [`JobManager`](super::JobManager) handles, answered on
//!   oneshot replies
//! - [`WorkerMessage`]s from worker tasks
//! - deadline signals from per-attempt timer tasks
//!
//! Each dispatched attempt carries a token. A deadline only acts if its
//! token still matches the worker's current assignment, and a worker report
//! only acts if the job is still bound to that worker, so whichever of
//! response and deadline is handled first wins.
//!
//! The loop never waits on a worker's startup. New workers are spawned in
//! the background and join the pool when their `Ready` message arrives.
//!
//! # Lifecycle
//!
//! `Running` dispatches on every tick. `shutdown` moves to `Draining`: ticks
//! stop, in-flight jobs may finish until the grace period ends, failures are
//! finalized instead of requeued. `Stopped` is reached once nothing is in
//! flight or the grace period elapses; remaining workers are terminated and
//! their jobs recorded as `ShutdownForced`. A stopped dispatcher keeps
//! answering lookups and stats until every handle is dropped.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SchedulerError, SchedulerResult};
use crate::metrics::{MetricsCollector, WorkerEvent};

use super::config::SchedulerConfig;
use super::events::{EventBus, SchedulerEvent};
use super::job::{FailureKind, Job, JobResult};
use super::ledger::ResultLedger;
use super::queue::JobQueue;
use super::worker::{WorkerId, WorkerMessage};
use super::worker_pool::{Assignment, ScalingDecision, WorkerPool};

/// Point-in-time scheduler statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Live workers.
    pub total_workers: usize,
    /// Idle workers.
    pub available_workers: usize,
    /// Workers running a job.
    pub busy_workers: usize,
    /// Workers spawned but not yet ready.
    pub starting_workers: usize,
    /// Pending jobs.
    pub queue_size: usize,
    /// Age of the most urgent pending job.
    pub oldest_pending_ms: u64,
    /// Jobs that completed successfully.
    pub completed_jobs: u64,
    /// Jobs that failed terminally.
    pub failed_jobs: u64,
    /// Failed attempts that were requeued.
    pub retried_jobs: u64,
    /// Moving average of the final attempt duration.
    pub average_processing_time_ms: f64,
    /// Busy workers divided by live workers.
    pub system_load: f64,
    /// Effective maximum pool size.
    pub pool_capacity: usize,
}

/// Request sent from a manager handle to the dispatcher.
#[derive(Debug)]
pub(crate) enum Command {
    Enqueue {
        job: Job,
        reply: oneshot::Sender<SchedulerResult<Uuid>>,
    },
    Lookup {
        job_id: Uuid,
        reply: oneshot::Sender<Option<JobResult>>,
    },
    Recent {
        n: usize,
        reply: oneshot::Sender<Vec<JobResult>>,
    },
    Stats {
        reply: oneshot::Sender<SchedulerStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Fired by a timer task when an attempt runs out of time.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    worker_id: WorkerId,
    token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Running,
    Draining { until: tokio::time::Instant },
    Stopped,
}

/// The scheduling actor.
pub(crate) struct Dispatcher {
    config: SchedulerConfig,
    queue: JobQueue,
    pool: WorkerPool,
    ledger: ResultLedger,
    events: EventBus,
    metrics: MetricsCollector,
    state: DispatchState,
    next_token: u64,
    retried: u64,
    commands: mpsc::Receiver<Command>,
    messages: mpsc::UnboundedReceiver<WorkerMessage>,
    deadline_tx: mpsc::UnboundedSender<Deadline>,
    deadline_rx: mpsc::UnboundedReceiver<Deadline>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl Dispatcher {
    /// Creates a dispatcher over an already populated pool.
    pub(crate) fn new(
        config: SchedulerConfig,
        pool: WorkerPool,
        commands: mpsc::Receiver<Command>,
        messages: mpsc::UnboundedReceiver<WorkerMessage>,
        events: EventBus,
    ) -> Self {
        let (deadline_tx, deadline_rx) = mpsc::unbounded_channel();
        Self {
            queue: JobQueue::new(config.max_queue_size),
            ledger: ResultLedger::new(config.ledger_capacity, config.stats_window),
            config,
            pool,
            events,
            metrics: MetricsCollector::new(),
            state: DispatchState::Running,
            next_token: 1,
            retried: 0,
            commands,
            messages,
            deadline_tx,
            deadline_rx,
            shutdown_waiters: Vec::new(),
        }
    }

    /// Main loop. Returns once every manager handle is dropped.
    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.queue_process_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            workers = self.pool.total_count(),
            max_workers = self.pool.limits().max_workers,
            "Dispatcher started"
        );

        loop {
            let drain_until = match self.state {
                DispatchState::Draining { until } => Some(until),
                _ => None,
            };

            tokio::select! {
                _ = ticker.tick(), if self.state == DispatchState::Running => {
                    self.tick();
                }
                _ = drain_expiry(drain_until) => {
                    warn!(
                        in_flight = self.pool.busy_count(),
                        "Shutdown grace period elapsed, terminating workers"
                    );
                    self.stop_all();
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        if self.state != DispatchState::Stopped {
                            info!("All scheduler handles dropped, stopping");
                            self.stop_all();
                        }
                        break;
                    }
                },
                Some(message) = self.messages.recv() => {
                    self.handle_worker_message(message);
                }
                Some(deadline) = self.deadline_rx.recv() => {
                    self.handle_deadline(deadline);
                }
            }

            if matches!(self.state, DispatchState::Draining { .. }) && self.pool.busy_count() == 0 {
                info!("In-flight jobs drained");
                self.stop_all();
            }
        }

        debug!("Dispatcher exited");
    }

    /// One scheduling round: scale, then hand pending jobs to idle workers.
    fn tick(&mut self) {
        self.apply_scaling();
        self.dispatch_pending();
        self.update_gauges();
    }

    fn apply_scaling(&mut self) {
        match self.pool.plan_scaling(self.queue.len(), Instant::now()) {
            ScalingDecision::Hold => {}
            ScalingDecision::ScaleUp(count) => {
                debug!(count, pending = self.queue.len(), "Scaling up");
                for _ in 0..count {
                    self.request_worker();
                }
            }
            ScalingDecision::ScaleDown(victims) => {
                debug!(count = victims.len(), "Scaling down idle workers");
                for worker_id in victims {
                    if let Some(assignment) = self.remove_worker(worker_id, "idle timeout") {
                        // Only idle workers are chosen; settle anyway so nothing vanishes.
                        self.settle_lost(worker_id, assignment, "worker retired while busy");
                    }
                }
            }
        }
    }

    fn dispatch_pending(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        for worker_id in self.pool.available_ids() {
            let Some(job) = self.queue.pop() else {
                break;
            };
            self.start_attempt(worker_id, job);
        }
    }

    fn start_attempt(&mut self, worker_id: WorkerId, job: Job) {
        let token = self.next_token;
        self.next_token += 1;

        let job_id = job.id;
        let attempt = job.attempt();
        let deadline = self.arm_deadline(worker_id, token, Duration::from_millis(job.timeout_ms));

        match self.pool.assign(worker_id, job, token, deadline) {
            Ok(()) => {
                debug!(job_id = %job_id, worker_id = %worker_id, attempt, "Job dispatched");
                self.metrics.inc_jobs_in_progress();
                self.events.emit(SchedulerEvent::JobStarted {
                    job_id,
                    worker_id,
                    attempt,
                });
            }
            Err((job, deadline)) => {
                deadline.abort();
                warn!(job_id = %job_id, worker_id = %worker_id, "Worker unreachable, job returned to queue");
                self.queue.restore(job);
                // The worker task is gone; its replacement comes from the next scaling pass.
                self.remove_worker(worker_id, "command channel closed");
            }
        }
    }

    fn arm_deadline(&self, worker_id: WorkerId, token: u64, timeout: Duration) -> AbortHandle {
        let deadlines = self.deadline_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = deadlines.send(Deadline { worker_id, token });
        })
        .abort_handle()
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { job, reply } => {
                let _ = reply.send(self.enqueue(job));
            }
            Command::Lookup { job_id, reply } => {
                let _ = reply.send(self.ledger.get(&job_id).cloned());
            }
            Command::Recent { n, reply } => {
                let _ = reply.send(self.ledger.recent(n));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { reply } => match self.state {
                DispatchState::Stopped => {
                    let _ = reply.send(());
                }
                DispatchState::Draining { .. } => self.shutdown_waiters.push(reply),
                DispatchState::Running => {
                    let grace = self.config.shutdown_grace_period();
                    info!(
                        in_flight = self.pool.busy_count(),
                        pending = self.queue.len(),
                        grace_ms = grace.as_millis() as u64,
                        "Shutdown requested, draining in-flight jobs"
                    );
                    self.state = DispatchState::Draining {
                        until: tokio::time::Instant::now() + grace,
                    };
                    self.shutdown_waiters.push(reply);
                }
            },
        }
    }

    fn enqueue(&mut self, job: Job) -> SchedulerResult<Uuid> {
        if self.state != DispatchState::Running {
            return Err(SchedulerError::ShuttingDown);
        }

        let job_id = job.id;
        let job_type = job.job_type;
        let priority = job.priority;
        self.queue.push(job)?;

        debug!(job_id = %job_id, job_type = %job_type, priority, queue_size = self.queue.len(), "Job queued");
        self.metrics.update_queue_depth(self.queue.len());
        self.events.emit(SchedulerEvent::JobQueued {
            job_id,
            job_type,
            priority,
        });
        Ok(job_id)
    }

    fn handle_worker_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::JobCompleted {
                worker_id,
                job_id,
                data,
                elapsed_ms,
            } => {
                if !self.is_bound(worker_id, job_id) {
                    debug!(job_id = %job_id, worker_id = %worker_id, "Ignoring stale completion");
                    return;
                }
                if let Some(assignment) = self.pool.release(worker_id, true) {
                    self.complete(worker_id, assignment.job, data, elapsed_ms);
                }
            }
            WorkerMessage::JobFailed {
                worker_id,
                job_id,
                error,
                elapsed_ms,
            } => {
                if !self.is_bound(worker_id, job_id) {
                    debug!(job_id = %job_id, worker_id = %worker_id, "Ignoring stale failure");
                    return;
                }
                if let Some(assignment) = self.pool.release(worker_id, false) {
                    let reason = SchedulerError::JobExecutionFailed {
                        job_id,
                        reason: error,
                    }
                    .to_string();
                    self.settle_failure(
                        assignment.job,
                        worker_id,
                        FailureKind::ExecutionFailed,
                        reason,
                        elapsed_ms,
                    );
                }
            }
            WorkerMessage::JobProgress {
                worker_id,
                job_id,
                percent,
                message,
            } => {
                if self.is_bound(worker_id, job_id) {
                    self.events.emit(SchedulerEvent::JobProgress {
                        job_id,
                        worker_id,
                        percent,
                        message,
                    });
                }
            }
            WorkerMessage::Ready { worker_id, result } => {
                match self.pool.finish_spawn(worker_id, result) {
                    None => {
                        debug!(worker_id = %worker_id, "Ignoring readiness of cancelled worker");
                    }
                    Some(Ok(worker_id)) => {
                        self.metrics.record_worker_event(WorkerEvent::Created);
                        self.events.emit(SchedulerEvent::WorkerCreated { worker_id });
                        if self.state == DispatchState::Running {
                            self.dispatch_pending();
                        }
                    }
                    Some(Err(e)) => {
                        // A later scaling pass tries again.
                        warn!(error = %e, total_workers = self.pool.total_count(), "Pool continues below target size");
                        self.metrics.record_worker_event(WorkerEvent::SpawnFailed);
                        self.events.emit(SchedulerEvent::WorkerSpawnFailed {
                            error: e.to_string(),
                        });
                    }
                }
            }
            WorkerMessage::Exited { worker_id, error } => {
                if self.pool.get(worker_id).is_none() {
                    return;
                }
                warn!(worker_id = %worker_id, error = %error, "Worker exited unexpectedly");
                if let Some(assignment) = self.remove_worker(worker_id, &error) {
                    self.settle_lost(worker_id, assignment, &error);
                }
                if self.state == DispatchState::Running
                    && self.pool.headcount() < self.pool.limits().min_workers
                {
                    self.request_worker();
                }
            }
        }
        self.update_gauges();
    }

    fn handle_deadline(&mut self, deadline: Deadline) {
        let current = self
            .pool
            .get(deadline.worker_id)
            .and_then(|w| w.current.as_ref())
            .is_some_and(|a| a.token == deadline.token);
        if !current {
            // The worker answered first.
            return;
        }

        let worker_id = deadline.worker_id;
        let Some(assignment) = self.remove_worker(worker_id, "missed job deadline") else {
            return;
        };

        let elapsed_ms = assignment.elapsed_ms();
        let job = assignment.job;
        let reason = SchedulerError::JobTimeout {
            job_id: job.id,
            timeout_ms: job.timeout_ms,
        }
        .to_string();
        warn!(job_id = %job.id, worker_id = %worker_id, timeout_ms = job.timeout_ms, "Job attempt timed out");

        self.settle_failure(job, worker_id, FailureKind::Timeout, reason, elapsed_ms);

        // A worker that overran its budget is never reused.
        if self.state == DispatchState::Running {
            self.request_worker();
        }
        self.update_gauges();
    }

    fn complete(&mut self, worker_id: WorkerId, mut job: Job, data: serde_json::Value, elapsed_ms: u64) {
        job.completed_at = Some(chrono::Utc::now());
        let result = JobResult::success(&job, worker_id.to_string(), data, elapsed_ms);

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            worker_id = %worker_id,
            attempts = result.attempts,
            processing_time_ms = elapsed_ms,
            "Job completed"
        );

        self.metrics.dec_jobs_in_progress();
        self.metrics
            .record_job(job.job_type.as_str(), "success", elapsed_ms as f64 / 1000.0);
        self.events.emit(SchedulerEvent::JobCompleted {
            job_id: job.id,
            worker_id,
            processing_time_ms: elapsed_ms,
        });
        self.ledger.record(result);
    }

    /// Counts a failed attempt, then requeues the job or records it as failed.
    fn settle_failure(
        &mut self,
        mut job: Job,
        worker_id: WorkerId,
        kind: FailureKind,
        error: String,
        elapsed_ms: u64,
    ) {
        self.metrics.dec_jobs_in_progress();

        let may_retry = job.record_failure();
        if may_retry && self.state == DispatchState::Running {
            job.demote(self.config.priority_ceiling);
            self.retried += 1;
            self.metrics.record_retry(job.job_type.as_str());

            info!(
                job_id = %job.id,
                retry_count = job.retry_count,
                max_retries = job.max_retries,
                priority = job.priority,
                error = %error,
                "Job attempt failed, requeued"
            );
            self.events.emit(SchedulerEvent::JobRetried {
                job_id: job.id,
                retry_count: job.retry_count,
                priority: job.priority,
                error,
            });
            self.queue.requeue(job);
            return;
        }

        job.completed_at = Some(chrono::Utc::now());
        let result = JobResult::failure(&job, worker_id.to_string(), kind, error.clone(), elapsed_ms);

        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            failure = %kind,
            attempts = result.attempts,
            error = %error,
            "Job failed"
        );

        self.metrics.record_job(
            job.job_type.as_str(),
            &kind.to_string(),
            elapsed_ms as f64 / 1000.0,
        );
        self.events.emit(SchedulerEvent::JobFailed {
            job_id: job.id,
            failure: kind,
            attempts: result.attempts,
            error,
        });
        self.ledger.record(result);
    }

    /// Settles the job of a worker that disappeared under it.
    fn settle_lost(&mut self, worker_id: WorkerId, assignment: Assignment, error: &str) {
        let elapsed_ms = assignment.elapsed_ms();
        let reason = SchedulerError::JobExecutionFailed {
            job_id: assignment.job.id,
            reason: format!("{} lost: {}", worker_id, error),
        }
        .to_string();
        self.settle_failure(
            assignment.job,
            worker_id,
            FailureKind::WorkerLost,
            reason,
            elapsed_ms,
        );
    }

    /// Starts a worker in the background; it joins the pool on `Ready`.
    fn request_worker(&mut self) {
        let worker_id = self.pool.begin_spawn();
        debug!(worker_id = %worker_id, total_workers = self.pool.total_count(), "Worker requested");
    }

    /// Terminates a worker. Returns the assignment it was running, which the
    /// caller must settle.
    fn remove_worker(&mut self, worker_id: WorkerId, reason: &str) -> Option<Assignment> {
        let assignment = self.pool.remove_worker(worker_id)?;
        self.metrics.record_worker_event(WorkerEvent::Removed);
        self.events.emit(SchedulerEvent::WorkerRemoved {
            worker_id,
            reason: reason.to_string(),
        });
        assignment
    }

    /// Terminates every worker and completes shutdown.
    fn stop_all(&mut self) {
        self.state = DispatchState::Stopped;

        let cancelled = self.pool.cancel_starting();
        if cancelled > 0 {
            debug!(cancelled, "Cancelled starting workers");
        }

        for worker_id in self.pool.worker_ids() {
            if let Some(assignment) = self.remove_worker(worker_id, "shutdown") {
                let elapsed_ms = assignment.elapsed_ms();
                let job_id = assignment.job.id;
                warn!(job_id = %job_id, worker_id = %worker_id, "Terminating in-flight job");
                self.settle_failure(
                    assignment.job,
                    worker_id,
                    FailureKind::ShutdownForced,
                    SchedulerError::ShutdownForced { job_id }.to_string(),
                    elapsed_ms,
                );
            }
        }
        self.update_gauges();

        info!(
            pending = self.queue.len(),
            completed = self.ledger.completed_count(),
            failed = self.ledger.failed_count(),
            "Scheduler stopped"
        );

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn is_bound(&self, worker_id: WorkerId, job_id: Uuid) -> bool {
        self.pool
            .get(worker_id)
            .and_then(|w| w.current.as_ref())
            .is_some_and(|a| a.job.id == job_id)
    }

    fn stats(&self) -> SchedulerStats {
        let total = self.pool.total_count();
        let busy = self.pool.busy_count();
        SchedulerStats {
            total_workers: total,
            available_workers: total - busy,
            busy_workers: busy,
            starting_workers: self.pool.starting_count(),
            queue_size: self.queue.len(),
            oldest_pending_ms: self
                .queue
                .peek()
                .map(|job| job.age().num_milliseconds().max(0) as u64)
                .unwrap_or(0),
            completed_jobs: self.ledger.completed_count(),
            failed_jobs: self.ledger.failed_count(),
            retried_jobs: self.retried,
            average_processing_time_ms: self.ledger.average_processing_time_ms(),
            system_load: if total == 0 {
                0.0
            } else {
                busy as f64 / total as f64
            },
            pool_capacity: self.pool.limits().max_workers,
        }
    }

    fn update_gauges(&self) {
        self.metrics.update_queue_depth(self.queue.len());
        self.metrics
            .update_workers(self.pool.total_count(), self.pool.busy_count());
    }
}

/// Resolves when the drain deadline passes; never resolves without one.
async fn drain_expiry(until: Option<tokio::time::Instant>) {
    match until {
        Some(until) => tokio::time::sleep_until(until).await,
        None => std::future::pending().await,
    }
}
