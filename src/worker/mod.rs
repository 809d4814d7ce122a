//! Worker pool: claims jobs, runs the persistence pipeline on each, and
//! routes failures to retry or the dead letter store.
//!
//! Each process runs up to `concurrency` handlers at once; multiple processes
//! can share one queue because claim exclusivity is the queue's contract, not
//! the pool's. Handler failures are contained here and never crash the
//! process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};
use tracing::{error, info, warn};

use crate::engine::PersistenceEngine;
use crate::models::ClaimedJob;
use crate::queue::{JobQueue, RateLimiter, RetryPolicy};
use crate::shutdown::LifecycleHandle;

/// Observable lifecycle signals, consumed by logging and tests only; they
/// have no effect on persistence correctness.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started { job_id: String },
    Completed { job_id: String, version: i64 },
    Failed { job_id: String, attempt: u32, error: String },
    Stalled { job_id: String },
}

/// Shared worker flags and the in-flight gauge, read by the health reporter
/// and the shutdown coordinator.
pub struct WorkerStatus {
    name: String,
    running: AtomicBool,
    paused: AtomicBool,
    in_flight: AtomicUsize,
    in_flight_ids: Mutex<HashSet<String>>,
}

impl WorkerStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            in_flight_ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn job_started(&self, job_id: &str) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.lock_ids().insert(job_id.to_string());
    }

    pub fn job_finished(&self, job_id: &str) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.lock_ids().remove(job_id);
    }

    /// Ids of jobs still in flight, logged on a forced exit.
    pub fn in_flight_job_ids(&self) -> Vec<String> {
        self.lock_ids().iter().cloned().collect()
    }

    fn lock_ids(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight_ids.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    engine: Arc<PersistenceEngine>,
    limiter: Arc<dyn RateLimiter>,
    policy: RetryPolicy,
    status: Arc<WorkerStatus>,
    events: broadcast::Sender<WorkerEvent>,
    concurrency: usize,
    /// How often an in-flight job renews its claim.
    heartbeat_interval: Duration,
    /// Sleep between claim attempts when the queue is empty.
    idle_poll: Duration,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn JobQueue>,
        engine: Arc<PersistenceEngine>,
        limiter: Arc<dyn RateLimiter>,
        policy: RetryPolicy,
        status: Arc<WorkerStatus>,
        events: broadcast::Sender<WorkerEvent>,
        concurrency: usize,
        heartbeat_interval: Duration,
        idle_poll: Duration,
    ) -> Self {
        Self {
            queue,
            engine,
            limiter,
            policy,
            status,
            events,
            concurrency,
            heartbeat_interval,
            idle_poll,
        }
    }

    /// Claim loop. Returns once the lifecycle leaves `Running`; spawned
    /// handlers finish on their own and are awaited by the shutdown
    /// coordinator via the in-flight gauge.
    pub async fn run(self: Arc<Self>, lifecycle: LifecycleHandle) {
        info!(
            worker = self.status.name(),
            concurrency = self.concurrency,
            "worker pool started"
        );
        let slots = Arc::new(Semaphore::new(self.concurrency));
        loop {
            if lifecycle.is_draining() || self.status.paused() {
                break;
            }
            let permit = match slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break, // semaphore closed, pool is shutting down
            };
            if let Err(e) = self.limiter.acquire().await {
                warn!(error = %e, "rate limiter unavailable, backing off");
                drop(permit);
                tokio::time::sleep(self.idle_poll).await;
                continue;
            }
            // re-check after potentially waiting on the limiter
            if lifecycle.is_draining() || self.status.paused() {
                break;
            }
            match self.queue.claim().await {
                Ok(Some(claimed)) => {
                    let pool = self.clone();
                    tokio::spawn(async move {
                        pool.handle_job(claimed).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(self.idle_poll).await;
                }
                Err(e) => {
                    warn!(error = %e, "claim failed, backing off");
                    drop(permit);
                    tokio::time::sleep(self.idle_poll).await;
                }
            }
        }
        info!(worker = self.status.name(), "worker pool stopped claiming");
    }

    async fn handle_job(&self, claimed: ClaimedJob) {
        let job_id = claimed.job_id.clone();
        self.status.job_started(&job_id);
        let _ = self.events.send(WorkerEvent::Started {
            job_id: job_id.clone(),
        });

        let heartbeat = self.spawn_heartbeat(job_id.clone());
        let result = self.engine.process(&claimed.job).await;
        heartbeat.abort();

        match result {
            Ok(version) => {
                if let Err(e) = self.queue.ack(&job_id).await {
                    // the write is durable; redelivery will dedup to a no-op
                    error!(%job_id, error = %e, "ack failed after successful persistence");
                } else {
                    let _ = self.events.send(WorkerEvent::Completed {
                        job_id: job_id.clone(),
                        version,
                    });
                }
            }
            Err(e) => {
                let attempt = claimed.job.attempts_made + 1;
                let _ = self.events.send(WorkerEvent::Failed {
                    job_id: job_id.clone(),
                    attempt,
                    error: e.to_string(),
                });
                self.route_failure(&job_id, attempt, &e).await;
            }
        }
        self.status.job_finished(&job_id);
    }

    /// Retry policy routing: non-retriable errors skip the retry budget and
    /// dead-letter immediately; retriable ones get exponential backoff until
    /// the budget is exhausted.
    async fn route_failure(&self, job_id: &str, attempt: u32, error: &crate::types::AppError) {
        let outcome = if !error.is_retriable() {
            self.queue
                .dead_letter(job_id, &format!("non-retriable: {error}"))
                .await
        } else if self.policy.should_retry(attempt) {
            let delay = self.policy.delay_for(attempt);
            warn!(
                job_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "job failed, scheduling retry"
            );
            self.queue.nack(job_id, delay).await
        } else {
            warn!(job_id, attempt, error = %error, "retry budget exhausted, dead-lettering");
            self.queue
                .dead_letter(job_id, &format!("exhausted {attempt} attempts: {error}"))
                .await
        };
        if let Err(e) = outcome {
            error!(job_id, error = %e, "failed to route job failure back to the queue");
        }
    }

    fn spawn_heartbeat(&self, job_id: String) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                if let Err(e) = queue.heartbeat(&job_id).await {
                    warn!(%job_id, error = %e, "heartbeat failed");
                }
            }
        })
    }
}
