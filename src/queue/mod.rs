//! Job queue abstraction.
//!
//! The queue is an injected interface rather than a process-wide singleton so
//! the worker pool, the stalled-job monitor and the tests can all run against
//! either the Redis backend or the in-memory one. Claim exclusivity is the
//! backend's contract: a job id is handed to at most one active consumer at a
//! time, and multiple worker processes may share one backend safely.

pub mod limiter;
pub mod memory;
pub mod redis;
pub mod stalled;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::models::{ClaimedJob, DeadLetterJob, Job};
use crate::types::AppResult;

pub use self::limiter::{LocalRateLimiter, RateLimiter, SharedRateLimiter};
pub use self::memory::MemoryQueue;
pub use self::redis::RedisQueue;
pub use self::stalled::StalledMonitor;

/// Result of one stalled-job sweep.
#[derive(Debug, Clone, Default)]
pub struct StallSweep {
    pub requeued: Vec<String>,
    pub dead_lettered: Vec<String>,
}

/// Current depth of each queue area, reported by `/health` consumers and logs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueDepths {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub dead: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Durably store a job and return its queue-assigned id.
    async fn enqueue(&self, job: Job) -> AppResult<String>;

    /// Claim the next ready job, if any. A claimed job belongs to the caller
    /// until `ack`, `nack`, `dead_letter` or a stalled-sweep recovery.
    async fn claim(&self) -> AppResult<Option<ClaimedJob>>;

    /// Mark a claimed job complete and release it.
    async fn ack(&self, job_id: &str) -> AppResult<()>;

    /// Return a claimed job to the queue, to become claimable after `delay`.
    /// Increments the job's attempt counter.
    async fn nack(&self, job_id: &str, delay: Duration) -> AppResult<()>;

    /// Atomically move a job (claimed or scheduled) into the dead letter
    /// store, preserving its attempt history.
    async fn dead_letter(&self, job_id: &str, reason: &str) -> AppResult<()>;

    /// Renew the claim on an in-flight job so the stalled sweep leaves it be.
    async fn heartbeat(&self, job_id: &str) -> AppResult<()>;

    /// Requeue active jobs whose heartbeat is older than `stall_after`;
    /// dead-letter any that exceed the backend's stall tolerance.
    async fn recover_stalled(&self, stall_after: Duration) -> AppResult<StallSweep>;

    /// Drop completed-job records beyond `keep` entries or older than
    /// `max_age`. Dead letters are never pruned.
    async fn prune_completed(&self, keep: usize, max_age: Duration) -> AppResult<u64>;

    async fn depths(&self) -> AppResult<QueueDepths>;

    async fn dead_letters(&self) -> AppResult<Vec<DeadLetterJob>>;

    /// Backend connectivity probe for health reporting.
    async fn ping(&self) -> AppResult<()>;
}

/// Exponential backoff schedule for failed attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based):
    /// `base_delay * 2^(attempt-1)`, saturating on overflow.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Whether another delivery should be scheduled after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
