use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docpipe::config::Config;
use docpipe::db::{DocumentStore, PgStore};
use docpipe::engine::PersistenceEngine;
use docpipe::notify::RedisNotifier;
use docpipe::queue::{JobQueue, RedisQueue, RetryPolicy, SharedRateLimiter, StalledMonitor};
use docpipe::routes::{create_router, AppState};
use docpipe::shutdown::{Lifecycle, ShutdownCoordinator};
use docpipe::worker::{WorkerEvent, WorkerPool, WorkerStatus};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docpipe=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(worker = %config.worker.name, "configuration loaded");

    // Connect to backends; a missing backend is fatal at startup. The
    // process never runs in a silently degraded mode.
    let pool = docpipe::db::create_pool(&config.database)
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to Postgres: {}", e))?;
    let redis_client = redis::Client::open(config.redis.url.as_str())
        .map_err(|e| anyhow::anyhow!("invalid Redis URL: {}", e))?;
    let redis_con = redis_client
        .get_connection_manager()
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to Redis: {}", e))?;

    let store: Arc<dyn DocumentStore> = Arc::new(PgStore::new(pool));
    let queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(
        redis_con.clone(),
        config.worker.max_stalled_count,
    ));
    store
        .ping()
        .await
        .map_err(|e| anyhow::anyhow!("Postgres did not answer the startup probe: {}", e))?;
    queue
        .ping()
        .await
        .map_err(|e| anyhow::anyhow!("Redis did not answer the startup probe: {}", e))?;

    let notifier = Arc::new(RedisNotifier::new(redis_con.clone()));
    let limiter = Arc::new(SharedRateLimiter::new(
        redis_con,
        config.rate_limit.max,
        config.rate_limit.window(),
    )?);
    let engine = Arc::new(PersistenceEngine::new(store.clone(), notifier));

    let lifecycle = Arc::new(Lifecycle::new());
    let status = Arc::new(WorkerStatus::new(config.worker.name.clone()));
    let (events, _) = broadcast::channel::<WorkerEvent>(256);

    // Lifecycle signal logging
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match event {
                WorkerEvent::Started { job_id } => info!(%job_id, "job started"),
                WorkerEvent::Completed { job_id, version } => {
                    info!(%job_id, version, "job completed")
                }
                WorkerEvent::Failed {
                    job_id,
                    attempt,
                    error,
                } => info!(%job_id, attempt, %error, "job failed"),
                WorkerEvent::Stalled { job_id } => info!(%job_id, "job stalled"),
            }
        }
    });

    let pool_task = {
        let policy = RetryPolicy {
            max_attempts: config.worker.max_attempts,
            base_delay: config.worker.backoff_base_delay(),
        };
        let worker_pool = Arc::new(WorkerPool::new(
            queue.clone(),
            engine,
            limiter,
            policy,
            status.clone(),
            events.clone(),
            config.worker.concurrency,
            config.worker.stalled_check_interval() / 3,
            std::time::Duration::from_millis(250),
        ));
        let handle = lifecycle.handle();
        tokio::spawn(async move { worker_pool.run(handle).await })
    };

    let monitor_task = {
        let monitor = StalledMonitor::new(
            queue.clone(),
            config.worker.stalled_check_interval(),
            config.retention.completed_keep_count,
            config.retention.completed_keep_age(),
            events.clone(),
        );
        let handle = lifecycle.handle();
        tokio::spawn(async move { monitor.run(handle).await })
    };

    // Health/readiness reporter
    let app = create_router(AppState {
        status: status.clone(),
        queue,
        store,
        lifecycle: lifecycle.handle(),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.health.port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind health port {}: {}", addr, e))?;
    info!("health reporter listening on {}", addr);
    let health_task = {
        let mut handle = lifecycle.handle();
        tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { handle.stopped().await });
            if let Err(e) = server.await {
                error!(error = %e, "health server error");
            }
        })
    };

    // Block until a termination signal, then drain
    let coordinator =
        ShutdownCoordinator::new(lifecycle, status, config.worker.shutdown_timeout());
    coordinator.run().await;

    pool_task.abort();
    let _ = monitor_task.await;
    let _ = health_task.await;
    info!("docpipe exited cleanly");
    Ok(())
}
