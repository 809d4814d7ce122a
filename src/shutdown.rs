//! Graceful shutdown: `Running -> Draining -> Stopped`, no way back.
//!
//! On a termination signal the coordinator pauses the worker pool (no new
//! claims), waits a bounded time for in-flight jobs to finish naturally, then
//! stops. Durability wins over shutdown latency: an in-flight write is never
//! aborted. If the timeout elapses first, the unfinished job ids are logged
//! and left claimed; the stalled-job sweep of a surviving process recovers
//! them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::worker::WorkerStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Running,
    Draining,
    Stopped,
}

/// Owner side of the lifecycle state machine. Transitions are one-way.
pub struct Lifecycle {
    tx: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleState::Running);
        Self { tx }
    }

    pub fn handle(&self) -> LifecycleHandle {
        LifecycleHandle {
            rx: self.tx.subscribe(),
        }
    }

    pub fn begin_drain(&self) {
        self.tx.send_if_modified(|state| {
            if *state == LifecycleState::Running {
                *state = LifecycleState::Draining;
                true
            } else {
                false
            }
        });
    }

    pub fn stop(&self) {
        self.tx.send_if_modified(|state| {
            if *state != LifecycleState::Stopped {
                *state = LifecycleState::Stopped;
                true
            } else {
                false
            }
        });
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct LifecycleHandle {
    rx: watch::Receiver<LifecycleState>,
}

impl LifecycleHandle {
    pub fn state(&self) -> LifecycleState {
        *self.rx.borrow()
    }

    pub fn is_draining(&self) -> bool {
        self.state() >= LifecycleState::Draining
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == LifecycleState::Stopped
    }

    /// Resolves once the lifecycle reaches `Stopped`.
    pub async fn stopped(&mut self) {
        while self.state() != LifecycleState::Stopped {
            if self.rx.changed().await.is_err() {
                return; // owner dropped; treat as stopped
            }
        }
    }
}

pub struct ShutdownCoordinator {
    lifecycle: Arc<Lifecycle>,
    status: Arc<WorkerStatus>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(lifecycle: Arc<Lifecycle>, status: Arc<WorkerStatus>, timeout: Duration) -> Self {
        Self {
            lifecycle,
            status,
            timeout,
        }
    }

    /// Wait for SIGTERM/SIGINT, then drain.
    pub async fn run(&self) {
        wait_for_termination_signal().await;
        info!("termination signal received, beginning drain");
        self.drain().await;
    }

    /// Drive the state machine to `Stopped`, bounded by the drain timeout.
    pub async fn drain(&self) {
        self.lifecycle.begin_drain();
        self.status.set_paused(true);

        let deadline = tokio::time::Instant::now() + self.timeout;
        while self.status.in_flight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                let unfinished = self.status.in_flight_job_ids();
                warn!(
                    unfinished = ?unfinished,
                    "drain timeout elapsed with jobs in flight, force-stopping; \
                     the stalled-job sweep will recover them"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.status.set_running(false);
        self.lifecycle.stop();
        info!("worker stopped");
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "could not install SIGTERM handler, falling back to ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_one_way() {
        let lifecycle = Lifecycle::new();
        let handle = lifecycle.handle();
        assert_eq!(handle.state(), LifecycleState::Running);

        lifecycle.begin_drain();
        assert_eq!(handle.state(), LifecycleState::Draining);

        lifecycle.stop();
        assert_eq!(handle.state(), LifecycleState::Stopped);

        // no path back to running or draining
        lifecycle.begin_drain();
        assert_eq!(handle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_stopped_future_resolves() {
        let lifecycle = Arc::new(Lifecycle::new());
        let mut handle = lifecycle.handle();
        let waiter = tokio::spawn(async move { handle.stopped().await });
        lifecycle.begin_drain();
        lifecycle.stop();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_without_in_flight_work_stops_immediately() {
        let lifecycle = Arc::new(Lifecycle::new());
        let status = Arc::new(WorkerStatus::new("test-worker"));
        let coordinator =
            ShutdownCoordinator::new(lifecycle.clone(), status.clone(), Duration::from_secs(30));

        coordinator.drain().await;
        assert!(lifecycle.handle().is_stopped());
        assert!(status.paused());
        assert!(!status.running());
    }

    #[tokio::test]
    async fn test_drain_times_out_with_work_stuck_in_flight() {
        let lifecycle = Arc::new(Lifecycle::new());
        let status = Arc::new(WorkerStatus::new("test-worker"));
        status.job_started("job-stuck");
        let coordinator =
            ShutdownCoordinator::new(lifecycle.clone(), status.clone(), Duration::from_millis(100));

        let start = tokio::time::Instant::now();
        coordinator.drain().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(lifecycle.handle().is_stopped());
        // the stuck job stays claimed for the stalled sweep
        assert_eq!(status.in_flight(), 1);
    }
}
