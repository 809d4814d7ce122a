//! End-to-end pipeline scenarios over the in-memory backends.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use docpipe::db::{DocumentStore, MemoryStore};
use docpipe::engine::PersistenceEngine;
use docpipe::models::{Job, JobContext};
use docpipe::notify::BroadcastNotifier;
use docpipe::queue::{JobQueue, LocalRateLimiter, MemoryQueue, RetryPolicy, StalledMonitor};
use docpipe::shutdown::{Lifecycle, ShutdownCoordinator};
use docpipe::snapshot;
use docpipe::worker::{WorkerEvent, WorkerPool, WorkerStatus};

struct Harness {
    queue: Arc<MemoryQueue>,
    store: Arc<MemoryStore>,
    notifier: Arc<BroadcastNotifier>,
    status: Arc<WorkerStatus>,
    lifecycle: Arc<Lifecycle>,
    events: broadcast::Sender<WorkerEvent>,
    pool: Arc<WorkerPool>,
}

impl Harness {
    fn new(concurrency: usize) -> Self {
        let queue = Arc::new(MemoryQueue::new(3));
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(BroadcastNotifier::new(64));
        let status = Arc::new(WorkerStatus::new("test-worker"));
        let lifecycle = Arc::new(Lifecycle::new());
        let (events, _) = broadcast::channel(256);
        let engine = Arc::new(PersistenceEngine::new(store.clone(), notifier.clone()));
        let limiter = Arc::new(LocalRateLimiter::new(1000, Duration::from_secs(1)).unwrap());
        // fast schedule so retries complete within the test budget
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
        };
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            engine,
            limiter,
            policy,
            status.clone(),
            events.clone(),
            concurrency,
            Duration::from_millis(20),
            Duration::from_millis(5),
        ));
        Self {
            queue,
            store,
            notifier,
            status,
            lifecycle,
            events,
            pool,
        }
    }

    fn start(&self) {
        let pool = self.pool.clone();
        let handle = self.lifecycle.handle();
        tokio::spawn(async move { pool.run(handle).await });
    }

    async fn enqueue(&self, document_id: Uuid, payload: &[u8], first_creation: bool) -> String {
        let job = Job::new(
            "doc-1",
            snapshot::encode(payload),
            JobContext {
                user_id: Uuid::new_v4(),
                user_email: "alice@example.com".into(),
                slug: "doc-1".into(),
                document_id,
            },
            Some("edit".into()),
            first_creation,
        );
        self.queue.enqueue(job).await.unwrap()
    }

    async fn drain(&self, timeout: Duration) {
        ShutdownCoordinator::new(self.lifecycle.clone(), self.status.clone(), timeout)
            .drain()
            .await;
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within the test budget"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn version_count(store: &MemoryStore, doc: Uuid) -> usize {
    store.list_versions(doc).await.unwrap().len()
}

#[tokio::test]
async fn test_first_creation_end_to_end() {
    let h = Harness::new(2);
    let mut confirmations = h.notifier.subscribe();
    let doc = Uuid::new_v4();

    h.start();
    h.enqueue(doc, b"initial content", true).await;

    let (channel, confirmation) = confirmations.recv().await.unwrap();
    assert_eq!(channel, "doc:doc-1:saved");
    assert_eq!(confirmation.document_id, doc);
    assert_eq!(confirmation.version, 1);

    let store = h.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move { store.list_versions(doc).await.unwrap().len() == 1 }
    })
    .await;

    let meta = h.store.get_metadata(doc).await.unwrap().unwrap();
    assert_eq!(meta.slug, "doc-1");

    let queue = h.queue.clone();
    wait_until(|| {
        let queue = queue.clone();
        async move { queue.completed_count() == 1 }
    })
    .await;

    h.drain(Duration::from_secs(2)).await;
    // exactly one terminal outcome: persisted and acknowledged
    let depths = h.queue.depths().await.unwrap();
    assert_eq!(depths.waiting + depths.delayed + depths.active + depths.dead, 0);
}

#[tokio::test]
async fn test_second_save_increments_version_and_keeps_slug() {
    let h = Harness::new(1);
    let doc = Uuid::new_v4();

    h.start();
    h.enqueue(doc, b"one", true).await;
    let store = h.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move { version_count(&store, doc).await == 1 }
    })
    .await;

    h.enqueue(doc, b"two", false).await;
    let store = h.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move { version_count(&store, doc).await == 2 }
    })
    .await;

    let versions: Vec<i64> = h
        .store
        .list_versions(doc)
        .await
        .unwrap()
        .iter()
        .map(|row| row.version)
        .collect();
    assert_eq!(versions, vec![1, 2]);
    assert_eq!(h.store.get_metadata(doc).await.unwrap().unwrap().slug, "doc-1");

    h.drain(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_transient_failures_retry_then_succeed() {
    let h = Harness::new(1);
    let mut events = h.events.subscribe();
    let doc = Uuid::new_v4();

    h.store.fail_next_commits(2);
    h.start();
    h.enqueue(doc, b"survives retries", true).await;

    let store = h.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move { version_count(&store, doc).await == 1 }
    })
    .await;

    // two failed attempts before the one that persisted
    let mut failed_attempts = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WorkerEvent::Failed { attempt, .. } = event {
            failed_attempts.push(attempt);
        }
    }
    assert_eq!(failed_attempts, vec![1, 2]);
    assert!(h.queue.dead_letters().await.unwrap().is_empty());

    h.drain(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_the_job() {
    let h = Harness::new(1);
    let doc = Uuid::new_v4();

    h.store.fail_next_commits(100);
    h.start();
    h.enqueue(doc, b"never persists", true).await;

    let queue = h.queue.clone();
    wait_until(|| {
        let queue = queue.clone();
        async move { queue.depths().await.unwrap().dead == 1 }
    })
    .await;

    let dead = h.queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].failure_reason.contains("exhausted 5 attempts"));
    assert_eq!(dead[0].job.attempts_made, 4);
    // never both: no version row exists
    assert_eq!(version_count(&h.store, doc).await, 0);
    assert_eq!(h.queue.completed_count(), 0);

    h.drain(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_metadata_failure_never_splits_the_outcome() {
    let h = Harness::new(1);
    let doc = Uuid::new_v4();

    // every commit fails on its metadata statement, rolling back the
    // version row with it
    h.store.fail_metadata_writes(true);
    h.start();
    h.enqueue(doc, b"all or nothing", true).await;

    let queue = h.queue.clone();
    wait_until(|| {
        let queue = queue.clone();
        async move { queue.depths().await.unwrap().dead == 1 }
    })
    .await;

    // exactly one terminal outcome: dead-lettered with nothing durable,
    // never dead-lettered alongside a persisted version row
    assert_eq!(version_count(&h.store, doc).await, 0);
    assert!(h.store.get_metadata(doc).await.unwrap().is_none());
    assert_eq!(h.queue.completed_count(), 0);

    h.drain(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_malformed_snapshot_skips_the_retry_budget() {
    let h = Harness::new(1);
    let doc = Uuid::new_v4();

    h.start();
    let job = Job::new(
        "doc-1",
        vec![0xff, 0xfe, 0xfd], // not a snapshot envelope
        JobContext {
            user_id: Uuid::new_v4(),
            user_email: "alice@example.com".into(),
            slug: "doc-1".into(),
            document_id: doc,
        },
        None,
        true,
    );
    h.queue.enqueue(job).await.unwrap();

    let queue = h.queue.clone();
    wait_until(|| {
        let queue = queue.clone();
        async move { queue.depths().await.unwrap().dead == 1 }
    })
    .await;

    let dead = h.queue.dead_letters().await.unwrap();
    assert!(dead[0].failure_reason.contains("non-retriable"));
    // dead-lettered on the first attempt, no retries consumed
    assert_eq!(dead[0].job.attempts_made, 0);

    h.drain(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_duplicate_jobs_persist_exactly_once() {
    let h = Harness::new(2);
    let doc = Uuid::new_v4();

    h.start();
    // the queue is at-least-once: the same snapshot can arrive twice
    h.enqueue(doc, b"identical bytes", true).await;
    h.enqueue(doc, b"identical bytes", false).await;

    let queue = h.queue.clone();
    wait_until(|| {
        let queue = queue.clone();
        async move { queue.completed_count() == 2 }
    })
    .await;

    assert_eq!(version_count(&h.store, doc).await, 1);
    assert!(h.queue.dead_letters().await.unwrap().is_empty());

    h.drain(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_concurrent_documents_and_gapless_versions() {
    let h = Harness::new(4);
    let doc_a = Uuid::new_v4();
    let doc_b = Uuid::new_v4();

    h.start();
    for i in 0..6u8 {
        h.enqueue(doc_a, &[b'a', i], i == 0).await;
        h.enqueue(doc_b, &[b'b', i], i == 0).await;
    }

    let store = h.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            store.list_versions(doc_a).await.unwrap().len() == 6
                && store.list_versions(doc_b).await.unwrap().len() == 6
        }
    })
    .await;

    for doc in [doc_a, doc_b] {
        let versions: Vec<i64> = h
            .store
            .list_versions(doc)
            .await
            .unwrap()
            .iter()
            .map(|row| row.version)
            .collect();
        assert_eq!(versions, (1..=6).collect::<Vec<i64>>());
    }

    h.drain(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_drain_finishes_in_flight_work_and_claims_nothing_new() {
    let h = Harness::new(1);
    let doc = Uuid::new_v4();

    h.store.set_write_latency(Some(Duration::from_millis(200)));
    h.start();
    h.enqueue(doc, b"in flight", true).await;
    h.enqueue(doc, b"left behind", false).await;

    // let the first job get claimed
    let status = h.status.clone();
    wait_until(|| {
        let status = status.clone();
        async move { status.in_flight() > 0 }
    })
    .await;

    h.drain(Duration::from_secs(2)).await;

    // the in-flight job completed and was acknowledged before exit
    assert_eq!(version_count(&h.store, doc).await, 1);
    assert_eq!(h.queue.completed_count(), 1);
    // the second job was never claimed
    let depths = h.queue.depths().await.unwrap();
    assert_eq!(depths.waiting, 1);
    assert_eq!(depths.active, 0);
}

#[tokio::test]
async fn test_stalled_monitor_dead_letters_a_thrice_stalled_job() {
    let queue = Arc::new(MemoryQueue::new(3));
    let (events, _) = broadcast::channel(64);
    let mut event_rx = events.subscribe();
    let monitor = StalledMonitor::new(
        queue.clone(),
        Duration::from_millis(50),
        1000,
        Duration::from_secs(3600),
        events,
    );

    let job = Job::new(
        "doc-1",
        snapshot::encode(b"poison"),
        JobContext {
            user_id: Uuid::new_v4(),
            user_email: "alice@example.com".into(),
            slug: "doc-1".into(),
            document_id: Uuid::new_v4(),
        },
        None,
        true,
    );
    queue.enqueue(job).await.unwrap();

    // a crashed worker claims the job and never heartbeats, three times over
    for _ in 0..3 {
        let claimed = queue.claim().await.unwrap().unwrap();
        queue.backdate_heartbeat(&claimed.job_id, Duration::from_secs(60));
        monitor.sweep_once().await.unwrap();
    }

    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].failure_reason.contains("stalled"));
    // the retry budget was untouched; stall tolerance alone dead-lettered it
    assert_eq!(dead[0].job.attempts_made, 0);

    let mut stalled_events = 0;
    while let Ok(event) = event_rx.try_recv() {
        if matches!(event, WorkerEvent::Stalled { .. }) {
            stalled_events += 1;
        }
    }
    assert_eq!(stalled_events, 3);
}
