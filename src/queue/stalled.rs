//! Periodic maintenance: stalled-job recovery and completed-job pruning.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::shutdown::LifecycleHandle;
use crate::types::AppResult;
use crate::worker::WorkerEvent;

use super::JobQueue;

/// Sweeps the active set on a fixed interval. A claimed job with no heartbeat
/// for a full interval is considered abandoned by a crashed or hung worker:
/// it is requeued, or dead-lettered once its stall counter exceeds the
/// backend's tolerance. This is what stops a poison job from looping
/// indefinitely across process restarts.
pub struct StalledMonitor {
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    completed_keep_count: usize,
    completed_keep_age: Duration,
    events: broadcast::Sender<WorkerEvent>,
}

impl StalledMonitor {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        interval: Duration,
        completed_keep_count: usize,
        completed_keep_age: Duration,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            queue,
            interval,
            completed_keep_count,
            completed_keep_age,
            events,
        }
    }

    /// Run until the process reaches the stopped state. Runs through the
    /// draining phase on purpose: jobs abandoned by a force-exited sibling
    /// process are exactly what this sweep recovers.
    pub async fn run(&self, mut lifecycle: LifecycleHandle) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "stalled-job sweep failed");
                    }
                }
                _ = lifecycle.stopped() => break,
            }
        }
    }

    pub async fn sweep_once(&self) -> AppResult<()> {
        let sweep = self.queue.recover_stalled(self.interval).await?;
        for job_id in &sweep.requeued {
            warn!(%job_id, "stalled job requeued");
            let _ = self.events.send(WorkerEvent::Stalled {
                job_id: job_id.clone(),
            });
        }
        for job_id in &sweep.dead_lettered {
            warn!(%job_id, "stalled job exceeded stall tolerance, dead-lettered");
            let _ = self.events.send(WorkerEvent::Stalled {
                job_id: job_id.clone(),
            });
        }

        let pruned = self
            .queue
            .prune_completed(self.completed_keep_count, self.completed_keep_age)
            .await?;
        if pruned > 0 {
            debug!(pruned, "pruned completed job records");
        }
        Ok(())
    }
}
