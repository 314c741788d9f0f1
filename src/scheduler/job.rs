//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `JobType`: The closed set of task categories handlers understand
//! - `JobSpec`: What a caller submits; validated and stamped at enqueue time
//! - `Job`: A unit of work owned by exactly one of queue, worker or ledger
//! - `JobResult`: The terminal outcome recorded in the ledger
//! - `FailureKind`: Why the last attempt of a failed job failed

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchedulerError;

use super::config::SchedulerConfig;

/// Category of work a job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Analysis of a single recorded session.
    SessionProcessing,
    /// Validation of a batch of samples.
    BatchValidation,
    /// Quality scoring of a sample.
    QualityScoring,
    /// Enrichment of a sample with surrounding context.
    ContextEnhancement,
    /// Assembly of training-set entries.
    TrainingGeneration,
}

impl JobType {
    /// All job types, in declaration order.
    pub const ALL: [JobType; 5] = [
        JobType::SessionProcessing,
        JobType::BatchValidation,
        JobType::QualityScoring,
        JobType::ContextEnhancement,
        JobType::TrainingGeneration,
    ];

    /// Returns the wire name of this job type.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::SessionProcessing => "session_processing",
            JobType::BatchValidation => "batch_validation",
            JobType::QualityScoring => "quality_scoring",
            JobType::ContextEnhancement => "context_enhancement",
            JobType::TrainingGeneration => "training_generation",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SchedulerError::InvalidJob(format!("unknown job type '{}'", s)))
    }
}

/// Specification of a job as submitted by a caller.
///
/// Optional fields fall back to the scheduler configuration when the job
/// is enqueued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    /// Category of the job.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Priority (lower = more urgent).
    #[serde(default)]
    pub priority: Option<u32>,
    /// Opaque data interpreted by the job handler.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Maximum number of attempts before the job fails terminally.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Wall-clock budget for a single attempt, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl JobSpec {
    /// Creates a new job specification with configuration defaults.
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            job_type,
            priority: None,
            payload,
            max_retries: None,
            timeout_ms: None,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the per-attempt timeout in milliseconds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// A job representing a unit of work to be executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at enqueue time.
    pub id: Uuid,
    /// Category of the job.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Priority (lower = more urgent). Incremented on retry.
    pub priority: u32,
    /// Opaque data interpreted by the job handler.
    pub payload: serde_json::Value,
    /// When this job was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the current attempt was dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of failed attempts so far.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Wall-clock budget for a single attempt, in milliseconds.
    pub timeout_ms: u64,
    /// Worker currently executing this job.
    pub assigned_worker_id: Option<String>,
}

impl Job {
    /// Validates a spec against the configuration and stamps it into a job.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidJob` if the payload is missing, the
    /// priority lies outside `1..=priority_ceiling`, or the timeout is zero.
    pub fn from_spec(spec: JobSpec, config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        if spec.payload.is_null() {
            return Err(SchedulerError::InvalidJob(
                "payload is required".to_string(),
            ));
        }

        let priority = spec.priority.unwrap_or(config.default_priority);
        if priority == 0 || priority > config.priority_ceiling {
            return Err(SchedulerError::InvalidJob(format!(
                "priority {} outside 1..={}",
                priority, config.priority_ceiling
            )));
        }

        let timeout_ms = spec.timeout_ms.unwrap_or(config.default_job_timeout_ms);
        if timeout_ms == 0 {
            return Err(SchedulerError::InvalidJob(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            job_type: spec.job_type,
            priority,
            payload: spec.payload,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(config.default_max_retries),
            timeout_ms,
            assigned_worker_id: None,
        })
    }

    /// Records a failed attempt and returns whether the job may run again.
    ///
    /// The job is retried while `retry_count < max_retries`, so it executes
    /// at most `max_retries` times (and always at least once).
    pub fn record_failure(&mut self) -> bool {
        self.retry_count += 1;
        self.assigned_worker_id = None;
        self.started_at = None;
        self.retry_count < self.max_retries
    }

    /// Demotes the job by one priority step, capped at `ceiling`.
    pub fn demote(&mut self, ceiling: u32) {
        self.priority = self.priority.saturating_add(1).min(ceiling);
    }

    /// Returns the 1-based number of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// Returns how long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Cause of the final failed attempt of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The attempt exceeded its time budget.
    Timeout,
    /// The handler reported a failure.
    ExecutionFailed,
    /// The worker crashed or was removed while running the job.
    WorkerLost,
    /// The job was still running when the shutdown grace period elapsed.
    ShutdownForced,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::ExecutionFailed => write!(f, "execution_failed"),
            FailureKind::WorkerLost => write!(f, "worker_lost"),
            FailureKind::ShutdownForced => write!(f, "shutdown_forced"),
        }
    }
}

/// Terminal outcome of a job.
///
/// Exactly one result is recorded per job that reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// ID of the job.
    pub job_id: Uuid,
    /// Category of the job.
    pub job_type: JobType,
    /// Whether the job completed successfully.
    pub success: bool,
    /// Handler output on success.
    pub data: Option<serde_json::Value>,
    /// Last error message on failure.
    pub error: Option<String>,
    /// Cause of the last failed attempt.
    pub failure: Option<FailureKind>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Duration of the final attempt in milliseconds.
    pub processing_time_ms: u64,
    /// ID of the worker that ran the final attempt.
    pub worker_id: String,
    /// When the result was recorded.
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    /// Creates a successful job result.
    pub fn success(
        job: &Job,
        worker_id: impl Into<String>,
        data: serde_json::Value,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            success: true,
            data: Some(data),
            error: None,
            failure: None,
            attempts: job.attempt(),
            processing_time_ms,
            worker_id: worker_id.into(),
            completed_at: Utc::now(),
        }
    }

    /// Creates a failed job result.
    ///
    /// `job.retry_count` must already include the final attempt.
    pub fn failure(
        job: &Job,
        worker_id: impl Into<String>,
        kind: FailureKind,
        error: impl Into<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            success: false,
            data: None,
            error: Some(error.into()),
            failure: Some(kind),
            attempts: job.retry_count.max(1),
            processing_time_ms,
            worker_id: worker_id.into(),
            completed_at: Utc::now(),
        }
    }

    /// Returns whether the job completed successfully.
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Converts the result into the handler output or the terminal error.
    pub fn into_result(self) -> Result<serde_json::Value, SchedulerError> {
        if self.success {
            return Ok(self.data.unwrap_or(serde_json::Value::Null));
        }

        let last_error = self.error.unwrap_or_else(|| "unknown error".to_string());
        match self.failure {
            Some(FailureKind::ShutdownForced) => Err(SchedulerError::ShutdownForced {
                job_id: self.job_id,
            }),
            _ => Err(SchedulerError::RetriesExhausted {
                job_id: self.job_id,
                attempts: self.attempts,
                last_error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    #[test]
    fn test_job_type_round_trips_through_str() {
        for job_type in JobType::ALL {
            let parsed: JobType = job_type.as_str().parse().expect("known type should parse");
            assert_eq!(parsed, job_type);
        }
        assert!("cooking".parse::<JobType>().is_err());
    }

    #[test]
    fn test_job_spec_deserializes_type_field() {
        let spec: JobSpec = serde_json::from_value(serde_json::json!({
            "type": "quality_scoring",
            "priority": 2,
            "payload": {"sample": 1}
        }))
        .expect("spec should deserialize");

        assert_eq!(spec.job_type, JobType::QualityScoring);
        assert_eq!(spec.priority, Some(2));
        assert!(spec.max_retries.is_none());
    }

    #[test]
    fn test_job_from_spec_applies_defaults() {
        let config = test_config();
        let spec = JobSpec::new(JobType::SessionProcessing, serde_json::json!({"id": 7}));
        let job = Job::from_spec(spec, &config).expect("valid spec");

        assert!(!job.id.is_nil());
        assert_eq!(job.priority, config.default_priority);
        assert_eq!(job.max_retries, config.default_max_retries);
        assert_eq!(job.timeout_ms, config.default_job_timeout_ms);
        assert_eq!(job.retry_count, 0);
        assert!(job.assigned_worker_id.is_none());
    }

    #[test]
    fn test_job_from_spec_rejects_invalid_fields() {
        let config = test_config();

        let missing_payload = JobSpec::new(JobType::QualityScoring, serde_json::Value::Null);
        assert!(matches!(
            Job::from_spec(missing_payload, &config),
            Err(SchedulerError::InvalidJob(_))
        ));

        let too_low = JobSpec::new(JobType::QualityScoring, serde_json::json!({})).with_priority(0);
        assert!(Job::from_spec(too_low, &config).is_err());

        let too_high = JobSpec::new(JobType::QualityScoring, serde_json::json!({}))
            .with_priority(config.priority_ceiling + 1);
        assert!(Job::from_spec(too_high, &config).is_err());

        let zero_timeout =
            JobSpec::new(JobType::QualityScoring, serde_json::json!({})).with_timeout_ms(0);
        assert!(Job::from_spec(zero_timeout, &config).is_err());
    }

    #[test]
    fn test_record_failure_respects_budget() {
        let config = test_config();
        let spec = JobSpec::new(JobType::BatchValidation, serde_json::json!({})).with_max_retries(3);
        let mut job = Job::from_spec(spec, &config).expect("valid spec");

        assert!(job.record_failure());
        assert!(job.record_failure());
        assert!(!job.record_failure());
        assert_eq!(job.retry_count, 3);
    }

    #[test]
    fn test_zero_retry_budget_still_runs_once() {
        let config = test_config();
        let spec = JobSpec::new(JobType::BatchValidation, serde_json::json!({})).with_max_retries(0);
        let mut job = Job::from_spec(spec, &config).expect("valid spec");

        assert_eq!(job.attempt(), 1);
        assert!(!job.record_failure());
    }

    #[test]
    fn test_demote_is_capped() {
        let config = test_config();
        let spec = JobSpec::new(JobType::TrainingGeneration, serde_json::json!({})).with_priority(4);
        let mut job = Job::from_spec(spec, &config).expect("valid spec");

        job.demote(5);
        assert_eq!(job.priority, 5);
        job.demote(5);
        assert_eq!(job.priority, 5);
    }

    #[test]
    fn test_demote_at_unbounded_ceiling_saturates() {
        let config = test_config().with_priority_ceiling(u32::MAX);
        let spec = JobSpec::new(JobType::QualityScoring, serde_json::json!({})).with_priority(u32::MAX);
        let mut job = Job::from_spec(spec, &config).expect("valid spec");

        job.demote(u32::MAX);
        assert_eq!(job.priority, u32::MAX);
    }

    #[test]
    fn test_failed_result_maps_to_terminal_error() {
        let config = test_config();
        let spec = JobSpec::new(JobType::ContextEnhancement, serde_json::json!({}));
        let mut job = Job::from_spec(spec, &config).expect("valid spec");
        job.retry_count = 3;

        let result = JobResult::failure(&job, "worker-1", FailureKind::ExecutionFailed, "boom", 12);
        assert!(!result.is_success());
        assert_eq!(result.attempts, 3);
        match result.into_result() {
            Err(SchedulerError::RetriesExhausted {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "boom");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let forced = JobResult::failure(&job, "worker-1", FailureKind::ShutdownForced, "stop", 0);
        assert!(matches!(
            forced.into_result(),
            Err(SchedulerError::ShutdownForced { .. })
        ));
    }

    #[test]
    fn test_success_result_carries_data() {
        let config = test_config();
        let spec = JobSpec::new(JobType::QualityScoring, serde_json::json!({}));
        let job = Job::from_spec(spec, &config).expect("valid spec");

        let result = JobResult::success(&job, "worker-2", serde_json::json!({"score": 0.9}), 40);
        assert!(result.is_success());
        assert_eq!(result.attempts, 1);
        assert_eq!(
            result.into_result().expect("success"),
            serde_json::json!({"score": 0.9})
        );
    }
}
