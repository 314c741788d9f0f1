//! In-memory priority job queue.
//!
//! Pending jobs are kept sorted by priority number (ascending). Jobs with
//! equal priority keep their insertion order, so each priority tier is
//! served first-in-first-out. The queue is bounded; `push` on a full queue
//! fails instead of blocking.
//!
//! The queue is owned by the dispatcher and is never shared.

use std::collections::VecDeque;

use thiserror::Error;

use super::job::Job;

/// Errors that can occur during queue operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is at capacity.
    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
}

/// Bounded priority queue of pending jobs.
#[derive(Debug)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
    capacity: usize,
}

impl JobQueue {
    /// Creates an empty queue holding at most `capacity` jobs.
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            capacity,
        }
    }

    /// Inserts a job behind every pending job of the same or higher urgency.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::QueueFull` if the queue is at capacity; the job
    /// is dropped in that case.
    pub fn push(&mut self, job: Job) -> Result<(), QueueError> {
        if self.is_full() {
            return Err(QueueError::QueueFull {
                capacity: self.capacity,
            });
        }

        let index = self.jobs.partition_point(|queued| queued.priority <= job.priority);
        self.jobs.insert(index, job);
        Ok(())
    }

    /// Reinserts a retried job behind its priority tier, ignoring capacity.
    ///
    /// Retries were already admitted once, so they may overshoot the bound
    /// by at most the number of in-flight jobs.
    pub fn requeue(&mut self, job: Job) {
        let index = self.jobs.partition_point(|queued| queued.priority <= job.priority);
        self.jobs.insert(index, job);
    }

    /// Puts a job that could not be dispatched back at the head of its tier.
    pub fn restore(&mut self, job: Job) {
        let index = self.jobs.partition_point(|queued| queued.priority < job.priority);
        self.jobs.insert(index, job);
    }

    /// Removes and returns the most urgent pending job.
    pub fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    /// Returns the most urgent pending job without removing it.
    pub fn peek(&self) -> Option<&Job> {
        self.jobs.front()
    }

    /// Returns the number of pending jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Returns whether the queue is at capacity.
    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.capacity
    }
}
