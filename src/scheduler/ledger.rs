//! Bounded history of terminal job outcomes.
//!
//! The ledger holds the most recent `capacity` results, evicting the oldest
//! first. Lifetime completion/failure counters are kept separately so they
//! survive eviction. The moving average covers the last `window` results.
//! Results are indexed by job ID; `order` keeps arrival order for eviction
//! and for newest-first listings.

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use super::job::JobResult;

/// Append-only, bounded store of terminal results.
#[derive(Debug)]
pub struct ResultLedger {
    order: VecDeque<Uuid>,
    results: HashMap<Uuid, JobResult>,
    capacity: usize,
    window: usize,
    completed: u64,
    failed: u64,
}

impl ResultLedger {
    /// Creates a ledger keeping `capacity` results and averaging over `window`.
    pub fn new(capacity: usize, window: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            results: HashMap::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            window: window.max(1),
            completed: 0,
            failed: 0,
        }
    }

    /// Appends a terminal result, evicting the oldest one when full.
    pub fn record(&mut self, result: JobResult) {
        if result.success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }

        if self.results.contains_key(&result.job_id) {
            self.order.retain(|id| *id != result.job_id);
        } else if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.results.remove(&evicted);
            }
        }
        self.order.push_back(result.job_id);
        self.results.insert(result.job_id, result);
    }

    /// Looks up the result of a job.
    pub fn get(&self, job_id: &Uuid) -> Option<&JobResult> {
        self.results.get(job_id)
    }

    /// Returns up to `n` most recent results, newest first.
    pub fn recent(&self, n: usize) -> Vec<JobResult> {
        self.newest().take(n).cloned().collect()
    }

    /// Average processing time over the most recent `window` results.
    pub fn average_processing_time_ms(&self) -> f64 {
        let sample: Vec<u64> = self
            .newest()
            .take(self.window)
            .map(|r| r.processing_time_ms)
            .collect();

        if sample.is_empty() {
            return 0.0;
        }
        sample.iter().sum::<u64>() as f64 / sample.len() as f64
    }

    /// Lifetime count of successful jobs.
    pub fn completed_count(&self) -> u64 {
        self.completed
    }

    /// Lifetime count of terminally failed jobs.
    pub fn failed_count(&self) -> u64 {
        self.failed
    }

    fn newest(&self) -> impl Iterator<Item = &JobResult> + '_ {
        self.order
            .iter()
            .rev()
            .filter_map(move |id| self.results.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::config::SchedulerConfig;
    use crate::scheduler::job::{FailureKind, Job, JobSpec, JobType};

    fn create_test_job() -> Job {
        Job::from_spec(
            JobSpec::new(JobType::QualityScoring, serde_json::json!({})),
            &SchedulerConfig::default(),
        )
        .expect("valid job")
    }

    fn success(ms: u64) -> JobResult {
        JobResult::success(&create_test_job(), "worker-1", serde_json::json!(null), ms)
    }

    fn failure(ms: u64) -> JobResult {
        let mut job = create_test_job();
        job.retry_count = 1;
        JobResult::failure(&job, "worker-1", FailureKind::ExecutionFailed, "bad", ms)
    }

    #[test]
    fn test_record_and_lookup() {
        let mut ledger = ResultLedger::new(10, 10);
        let result = success(5);
        let id = result.job_id;
        ledger.record(result);

        assert_eq!(ledger.get(&id).map(|r| r.job_id), Some(id));
        assert!(ledger.get(&Uuid::new_v4()).is_none());
        assert_eq!(ledger.completed_count(), 1);
        assert_eq!(ledger.failed_count(), 0);
    }

    #[test]
    fn test_oldest_entries_are_evicted() {
        let mut ledger = ResultLedger::new(2, 10);
        let first = success(1);
        let first_id = first.job_id;
        ledger.record(first);
        ledger.record(success(2));
        ledger.record(failure(3));

        assert_eq!(ledger.recent(10).len(), 2);
        assert_eq!(ledger.results.len(), 2);
        assert!(ledger.get(&first_id).is_none());
        // Counters survive eviction.
        assert_eq!(ledger.completed_count(), 2);
        assert_eq!(ledger.failed_count(), 1);
    }

    #[test]
    fn test_moving_average_uses_recent_window() {
        let mut ledger = ResultLedger::new(10, 2);
        assert_eq!(ledger.average_processing_time_ms(), 0.0);

        ledger.record(success(1000));
        ledger.record(success(10));
        ledger.record(failure(30));

        assert!((ledger.average_processing_time_ms() - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_recent_is_newest_first() {
        let mut ledger = ResultLedger::new(10, 10);
        let older = success(1);
        let newer = success(2);
        let newer_id = newer.job_id;
        ledger.record(older);
        ledger.record(newer);

        let recent = ledger.recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].job_id, newer_id);
        assert_eq!(ledger.recent(10).len(), 2);
    }

    #[test]
    fn test_repeated_job_keeps_one_entry() {
        let mut ledger = ResultLedger::new(2, 10);
        let first = success(1);
        let first_id = first.job_id;
        ledger.record(first.clone());
        ledger.record(success(2));
        ledger.record(first);

        let ids: Vec<Uuid> = ledger.recent(10).iter().map(|r| r.job_id).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], first_id);
        assert_eq!(ledger.results.len(), 2);
    }
}
