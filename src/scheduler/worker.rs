//! Worker units.
//!
//! A worker is an isolated tokio task. It owns nothing but its command
//! receiver and a sender for messages back to the dispatcher; it never sees
//! the queue, the pool registry or the ledger. It runs one job at a time:
//! receive `Execute`, call the handler, report the outcome, repeat.
//!
//! A supervisor task watches each worker. If the worker task panics, the
//! supervisor reports [`WorkerMessage::Exited`] so the dispatcher can fail
//! the bound job and replace the worker. Workers stopped by the pool (abort
//! or closed command channel) exit silently.
//!
//! Startup is asynchronous: [`await_ready`] turns the readiness signal into
//! an outcome, either awaited directly or reported as
//! [`WorkerMessage::Ready`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error};
use uuid::Uuid;

use crate::handlers::{JobContext, JobHandler};

use super::job::Job;

/// Unique identifier of a worker unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Creates a worker ID from its sequence number.
    pub fn new(seq: u64) -> Self {
        Self(seq)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Command sent from the dispatcher to a worker.
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// Run one attempt of the job.
    Execute(Job),
}

/// Message sent from a worker (or its supervisor) to the dispatcher.
#[derive(Debug)]
pub enum WorkerMessage {
    /// The handler finished the attempt successfully.
    JobCompleted {
        worker_id: WorkerId,
        job_id: Uuid,
        data: serde_json::Value,
        elapsed_ms: u64,
    },
    /// The handler reported a failure.
    JobFailed {
        worker_id: WorkerId,
        job_id: Uuid,
        error: String,
        elapsed_ms: u64,
    },
    /// The handler reported progress.
    JobProgress {
        worker_id: WorkerId,
        job_id: Uuid,
        percent: f32,
        message: String,
    },
    /// A worker started in the background finished starting up.
    Ready {
        worker_id: WorkerId,
        result: Result<(), String>,
    },
    /// The worker task ended unexpectedly.
    Exited { worker_id: WorkerId, error: String },
}

/// Handles the pool keeps for a spawned worker task.
pub(crate) struct SpawnedWorker {
    pub commands: mpsc::Sender<WorkerCommand>,
    pub abort: AbortHandle,
    pub ready: oneshot::Receiver<Result<(), String>>,
}

/// Spawns a worker task and its supervisor.
///
/// The returned `ready` receiver resolves once the handler's `prepare` hook
/// has run.
pub(crate) fn spawn_worker(
    worker_id: WorkerId,
    handler: Arc<dyn JobHandler>,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
) -> SpawnedWorker {
    // One slot: the dispatcher only sends to idle workers.
    let (command_tx, command_rx) = mpsc::channel(1);
    let (ready_tx, ready_rx) = oneshot::channel();

    let runtime = WorkerRuntime {
        id: worker_id,
        handler,
        commands: command_rx,
        outbox: outbox.clone(),
    };
    let task = tokio::spawn(runtime.run(ready_tx));
    let abort = task.abort_handle();
    supervise(worker_id, task, outbox);

    SpawnedWorker {
        commands: command_tx,
        abort,
        ready: ready_rx,
    }
}

/// Waits for a spawned worker's `prepare` hook, bounded by `timeout`.
pub(crate) async fn await_ready(
    worker_id: WorkerId,
    ready: oneshot::Receiver<Result<(), String>>,
    timeout: Duration,
) -> Result<(), String> {
    match tokio::time::timeout(timeout, ready).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(reason))) => Err(format!("{} failed to prepare: {}", worker_id, reason)),
        Ok(Err(_)) => Err(format!("{} exited before signalling ready", worker_id)),
        Err(_) => Err(format!(
            "{} did not signal ready within {:?}",
            worker_id, timeout
        )),
    }
}

/// Reports a panicked worker task to the dispatcher.
fn supervise(worker_id: WorkerId, task: JoinHandle<()>, outbox: mpsc::UnboundedSender<WorkerMessage>) {
    tokio::spawn(async move {
        match task.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                debug!(worker_id = %worker_id, "Worker task aborted");
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "Worker task crashed");
                let _ = outbox.send(WorkerMessage::Exited {
                    worker_id,
                    error: format!("worker crashed: {}", e),
                });
            }
        }
    });
}

/// State owned by a running worker task.
struct WorkerRuntime {
    id: WorkerId,
    handler: Arc<dyn JobHandler>,
    commands: mpsc::Receiver<WorkerCommand>,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerRuntime {
    /// Main worker loop.
    async fn run(mut self, ready: oneshot::Sender<Result<(), String>>) {
        if let Err(reason) = self.handler.prepare(&self.id).await {
            let _ = ready.send(Err(reason));
            return;
        }
        if ready.send(Ok(())).is_err() {
            // The pool gave up waiting for us.
            return;
        }

        debug!(worker_id = %self.id, "Worker started");

        while let Some(command) = self.commands.recv().await {
            match command {
                WorkerCommand::Execute(job) => {
                    let message = self.execute(job).await;
                    if self.outbox.send(message).is_err() {
                        break;
                    }
                }
            }
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }

    /// Runs one attempt of a job and builds the report for the dispatcher.
    async fn execute(&self, job: Job) -> WorkerMessage {
        let start = Instant::now();
        let ctx = JobContext::new(job.id, self.id, job.attempt(), self.outbox.clone());

        let outcome = self.handler.handle(job.job_type, &job.payload, &ctx).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(data) => WorkerMessage::JobCompleted {
                worker_id: self.id,
                job_id: job.id,
                data,
                elapsed_ms,
            },
            Err(e) => WorkerMessage::JobFailed {
                worker_id: self.id,
                job_id: job.id,
                error: e.to_string(),
                elapsed_ms,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{HandlerError, SimulatedHandler};
    use crate::scheduler::config::SchedulerConfig;
    use crate::scheduler::job::{JobSpec, JobType};
    use async_trait::async_trait;

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn handle(
            &self,
            _job_type: JobType,
            _payload: &serde_json::Value,
            _ctx: &JobContext,
        ) -> Result<serde_json::Value, HandlerError> {
            panic!("handler blew up");
        }
    }

    struct RefusingHandler;

    #[async_trait]
    impl JobHandler for RefusingHandler {
        async fn handle(
            &self,
            _job_type: JobType,
            _payload: &serde_json::Value,
            _ctx: &JobContext,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(serde_json::Value::Null)
        }

        async fn prepare(&self, _worker_id: &WorkerId) -> Result<(), String> {
            Err("no model loaded".to_string())
        }
    }

    fn test_job(payload: serde_json::Value) -> Job {
        Job::from_spec(
            JobSpec::new(JobType::QualityScoring, payload),
            &SchedulerConfig::default(),
        )
        .expect("valid job")
    }

    async fn next_terminal(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> WorkerMessage {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("worker should respond")
                .expect("channel open");
            if !matches!(message, WorkerMessage::JobProgress { .. }) {
                return message;
            }
        }
    }

    #[test]
    fn test_worker_id_display() {
        assert_eq!(WorkerId::new(7).to_string(), "worker-7");
        assert!(WorkerId::new(1) < WorkerId::new(2));
    }

    #[tokio::test]
    async fn test_worker_reports_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(SimulatedHandler::new(Duration::from_millis(1)));
        let spawned = spawn_worker(WorkerId::new(1), handler, tx);

        assert_eq!(spawned.ready.await.expect("ready signal"), Ok(()));

        let job = test_job(serde_json::json!({"echo": 1}));
        let job_id = job.id;
        spawned
            .commands
            .send(WorkerCommand::Execute(job))
            .await
            .expect("worker accepts job");

        match next_terminal(&mut rx).await {
            WorkerMessage::JobCompleted {
                worker_id,
                job_id: id,
                data,
                ..
            } => {
                assert_eq!(worker_id, WorkerId::new(1));
                assert_eq!(id, job_id);
                assert_eq!(data["echo"], 1);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_worker_reports_handler_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(SimulatedHandler::new(Duration::ZERO));
        let spawned = spawn_worker(WorkerId::new(2), handler, tx);
        spawned.ready.await.expect("ready").expect("prepared");

        spawned
            .commands
            .send(WorkerCommand::Execute(test_job(serde_json::json!({"fail": true}))))
            .await
            .expect("worker accepts job");

        assert!(matches!(
            next_terminal(&mut rx).await,
            WorkerMessage::JobFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_panicking_worker_is_reported_as_exited() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let spawned = spawn_worker(WorkerId::new(3), Arc::new(PanickingHandler), tx);
        spawned.ready.await.expect("ready").expect("prepared");

        spawned
            .commands
            .send(WorkerCommand::Execute(test_job(serde_json::json!({}))))
            .await
            .expect("worker accepts job");

        match next_terminal(&mut rx).await {
            WorkerMessage::Exited { worker_id, error } => {
                assert_eq!(worker_id, WorkerId::new(3));
                assert!(error.contains("crashed"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_prepare_is_reported_on_ready() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let spawned = spawn_worker(WorkerId::new(4), Arc::new(RefusingHandler), tx);

        let ready = spawned.ready.await.expect("ready signal");
        assert_eq!(ready, Err("no model loaded".to_string()));
    }

    #[tokio::test]
    async fn test_await_ready_reports_prepare_failure() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let spawned = spawn_worker(WorkerId::new(5), Arc::new(RefusingHandler), tx);

        let err = await_ready(WorkerId::new(5), spawned.ready, Duration::from_secs(5))
            .await
            .expect_err("prepare fails");
        assert!(err.contains("worker-5 failed to prepare"));
        assert!(err.contains("no model loaded"));
    }
}
