//! Simulated handler used by the CLI demo and tests.
//!
//! Payload fields:
//!
//! - `sleep_ms`: latency of the attempt (defaults to the handler latency)
//! - `fail`: when `true`, every attempt fails
//! - `echo`: copied into the output

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{HandlerError, JobContext, JobHandler};
use crate::scheduler::JobType;

/// Handler that sleeps and succeeds or fails according to its payload.
#[derive(Debug, Default)]
pub struct SimulatedHandler {
    latency: Duration,
    fail_every: Option<u64>,
    invocations: AtomicU64,
}

impl SimulatedHandler {
    /// Creates a handler with the given default latency.
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            fail_every: None,
            invocations: AtomicU64::new(0),
        }
    }

    /// Fails every `n`-th invocation (counting from 1). Zero disables it.
    pub fn with_fail_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    /// Returns how many attempts this handler has processed.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for SimulatedHandler {
    async fn handle(
        &self,
        job_type: JobType,
        payload: &serde_json::Value,
        ctx: &JobContext,
    ) -> Result<serde_json::Value, HandlerError> {
        let invocation = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;

        let latency = match payload.get("sleep_ms") {
            Some(value) => Duration::from_millis(value.as_u64().ok_or_else(|| {
                HandlerError::InvalidPayload("sleep_ms must be an unsigned integer".to_string())
            })?),
            None => self.latency,
        };

        debug!(
            job_id = %ctx.job_id(),
            job_type = %job_type,
            attempt = ctx.attempt(),
            latency_ms = latency.as_millis() as u64,
            "Simulating job"
        );

        ctx.progress().report(0.0, "started");
        tokio::time::sleep(latency).await;

        let forced = payload.get("fail").and_then(|v| v.as_bool()).unwrap_or(false);
        let periodic = self.fail_every.is_some_and(|n| invocation % n == 0);
        if forced || periodic {
            return Err(HandlerError::Failed(format!(
                "simulated failure on attempt {}",
                ctx.attempt()
            )));
        }

        ctx.progress().report(100.0, "done");
        Ok(serde_json::json!({
            "job_type": job_type.as_str(),
            "attempt": ctx.attempt(),
            "worker": ctx.worker_id().to_string(),
            "echo": payload.get("echo").cloned().unwrap_or(serde_json::Value::Null),
        }))
    }
}
