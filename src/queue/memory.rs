//! In-memory queue backend.
//!
//! Single-process stand-in for the Redis backend with the same claim and
//! retry semantics. Used by the test suite and by embedded deployments that
//! run without external infrastructure.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{ClaimedJob, DeadLetterJob, Job};
use crate::types::{AppError, AppResult};

use super::{JobQueue, QueueDepths, StallSweep};

#[derive(Debug, Clone)]
struct StoredJob {
    job: Job,
    stalled_count: u32,
}

#[derive(Debug, Clone)]
struct ActiveEntry {
    last_heartbeat: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, StoredJob>,
    waiting: VecDeque<String>,
    /// job id -> instant (millis since epoch) at which it becomes claimable
    delayed: HashMap<String, DateTime<Utc>>,
    active: HashMap<String, ActiveEntry>,
    completed: Vec<(String, DateTime<Utc>)>,
    dead: Vec<DeadLetterJob>,
    unreachable: bool,
}

pub struct MemoryQueue {
    inner: Mutex<Inner>,
    max_stalled_count: u32,
}

impl MemoryQueue {
    pub fn new(max_stalled_count: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_stalled_count,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // lock() only fails if a holder panicked; propagating the poison
        // would just repeat the panic, so recover the data instead
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulate the backend going away, for readiness tests.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Age an active job's heartbeat, simulating a worker that went silent.
    pub fn backdate_heartbeat(&self, job_id: &str, by: Duration) {
        let mut inner = self.lock();
        if let Some(entry) = inner.active.get_mut(job_id) {
            entry.last_heartbeat = entry.last_heartbeat
                - chrono::Duration::milliseconds(by.as_millis() as i64);
        }
    }

    pub fn completed_count(&self) -> usize {
        self.lock().completed.len()
    }

    fn check_reachable(inner: &Inner) -> AppResult<()> {
        if inner.unreachable {
            return Err(AppError::Unavailable("queue backend unreachable".into()));
        }
        Ok(())
    }

    fn promote_due(inner: &mut Inner, now: DateTime<Utc>) {
        let due: Vec<String> = inner
            .delayed
            .iter()
            .filter(|(_, ready_at)| **ready_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            inner.delayed.remove(&id);
            inner.waiting.push_back(id);
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: Job) -> AppResult<String> {
        let mut inner = self.lock();
        Self::check_reachable(&inner)?;
        let job_id = Uuid::new_v4().to_string();
        inner.jobs.insert(
            job_id.clone(),
            StoredJob {
                job,
                stalled_count: 0,
            },
        );
        inner.waiting.push_back(job_id.clone());
        Ok(job_id)
    }

    async fn claim(&self) -> AppResult<Option<ClaimedJob>> {
        let mut inner = self.lock();
        Self::check_reachable(&inner)?;
        let now = Utc::now();
        Self::promote_due(&mut inner, now);
        let Some(job_id) = inner.waiting.pop_front() else {
            return Ok(None);
        };
        // payload can vanish under a concurrent dead-letter; drop the id
        let Some(stored) = inner.jobs.get(&job_id) else {
            return Ok(None);
        };
        let claimed = ClaimedJob {
            job_id: job_id.clone(),
            job: stored.job.clone(),
            stalled_count: stored.stalled_count,
        };
        inner.active.insert(
            job_id,
            ActiveEntry {
                last_heartbeat: now,
            },
        );
        Ok(Some(claimed))
    }

    async fn ack(&self, job_id: &str) -> AppResult<()> {
        let mut inner = self.lock();
        inner.active.remove(job_id);
        inner.jobs.remove(job_id);
        inner.completed.push((job_id.to_string(), Utc::now()));
        Ok(())
    }

    async fn nack(&self, job_id: &str, delay: Duration) -> AppResult<()> {
        let mut inner = self.lock();
        inner.active.remove(job_id);
        if let Some(stored) = inner.jobs.get_mut(job_id) {
            stored.job.attempts_made += 1;
            let ready_at =
                Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            inner.delayed.insert(job_id.to_string(), ready_at);
        }
        Ok(())
    }

    async fn dead_letter(&self, job_id: &str, reason: &str) -> AppResult<()> {
        let mut inner = self.lock();
        inner.active.remove(job_id);
        inner.delayed.remove(job_id);
        inner.waiting.retain(|id| id != job_id);
        let Some(stored) = inner.jobs.remove(job_id) else {
            return Ok(());
        };
        inner.dead.push(DeadLetterJob {
            original_job_id: job_id.to_string(),
            job: stored.job,
            failure_reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn heartbeat(&self, job_id: &str) -> AppResult<()> {
        let mut inner = self.lock();
        // refresh only a live claim; a beat arriving after the stalled
        // sweep (or an ack) released the job must not re-register it
        if let Some(entry) = inner.active.get_mut(job_id) {
            entry.last_heartbeat = Utc::now();
        }
        Ok(())
    }

    async fn recover_stalled(&self, stall_after: Duration) -> AppResult<StallSweep> {
        let mut inner = self.lock();
        Self::check_reachable(&inner)?;
        let cutoff = Utc::now() - chrono::Duration::milliseconds(stall_after.as_millis() as i64);
        let stalled: Vec<String> = inner
            .active
            .iter()
            .filter(|(_, entry)| entry.last_heartbeat < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        let mut sweep = StallSweep::default();
        for job_id in stalled {
            inner.active.remove(&job_id);
            let exceeded = match inner.jobs.get_mut(&job_id) {
                Some(stored) => {
                    stored.stalled_count += 1;
                    stored.stalled_count >= self.max_stalled_count
                }
                None => continue,
            };
            if exceeded {
                if let Some(stored) = inner.jobs.remove(&job_id) {
                    inner.dead.push(DeadLetterJob {
                        original_job_id: job_id.clone(),
                        job: stored.job,
                        failure_reason: format!(
                            "stalled {} times, exceeding the stall tolerance",
                            stored.stalled_count
                        ),
                        failed_at: Utc::now(),
                    });
                }
                sweep.dead_lettered.push(job_id);
            } else {
                inner.waiting.push_back(job_id.clone());
                sweep.requeued.push(job_id);
            }
        }
        Ok(sweep)
    }

    async fn prune_completed(&self, keep: usize, max_age: Duration) -> AppResult<u64> {
        let mut inner = self.lock();
        let cutoff = Utc::now() - chrono::Duration::milliseconds(max_age.as_millis() as i64);
        let before = inner.completed.len();
        inner.completed.retain(|(_, at)| *at >= cutoff);
        if inner.completed.len() > keep {
            let excess = inner.completed.len() - keep;
            inner.completed.drain(..excess);
        }
        Ok((before - inner.completed.len()) as u64)
    }

    async fn depths(&self) -> AppResult<QueueDepths> {
        let inner = self.lock();
        Ok(QueueDepths {
            waiting: inner.waiting.len() as u64,
            delayed: inner.delayed.len() as u64,
            active: inner.active.len() as u64,
            dead: inner.dead.len() as u64,
        })
    }

    async fn dead_letters(&self) -> AppResult<Vec<DeadLetterJob>> {
        Ok(self.lock().dead.clone())
    }

    async fn ping(&self) -> AppResult<()> {
        let inner = self.lock();
        Self::check_reachable(&inner)
    }
}
