use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub worker: WorkerConfig,
    pub rate_limit: RateLimitConfig,
    pub health: HealthConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_delay_ms: u64,
    pub stalled_check_interval_ms: u64,
    pub max_stalled_count: u32,
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum job starts per window, shared across all worker processes.
    pub max: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    pub completed_keep_count: usize,
    pub completed_keep_age_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
                max_connections: env::var("DB_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
                min_connections: env::var("DB_MIN_CONNECTIONS")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()?,
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            },
            worker: WorkerConfig {
                name: env::var("WORKER_NAME").unwrap_or_else(|_| default_worker_name()),
                concurrency: env::var("WORKER_CONCURRENCY")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()?,
                max_attempts: env::var("MAX_ATTEMPTS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()?,
                backoff_base_delay_ms: env::var("BACKOFF_BASE_DELAY_MS")
                    .unwrap_or_else(|_| "2000".to_string())
                    .parse()?,
                stalled_check_interval_ms: env::var("STALLED_CHECK_INTERVAL_MS")
                    .unwrap_or_else(|_| "30000".to_string())
                    .parse()?,
                max_stalled_count: env::var("MAX_STALLED_COUNT")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()?,
                shutdown_timeout_ms: env::var("SHUTDOWN_TIMEOUT_MS")
                    .unwrap_or_else(|_| "30000".to_string())
                    .parse()?,
            },
            rate_limit: RateLimitConfig {
                max: env::var("RATE_LIMIT_MAX")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()?,
                duration_ms: env::var("RATE_LIMIT_DURATION_MS")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()?,
            },
            health: HealthConfig {
                port: env::var("HEALTH_PORT")
                    .unwrap_or_else(|_| "3003".to_string())
                    .parse()?,
            },
            retention: RetentionConfig {
                completed_keep_count: env::var("COMPLETED_KEEP_COUNT")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()?,
                completed_keep_age_ms: env::var("COMPLETED_KEEP_AGE_MS")
                    .unwrap_or_else(|_| "86400000".to_string())
                    .parse()?,
            },
        })
    }
}

impl WorkerConfig {
    pub fn backoff_base_delay(&self) -> Duration {
        Duration::from_millis(self.backoff_base_delay_ms)
    }

    pub fn stalled_check_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_check_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

impl RetentionConfig {
    pub fn completed_keep_age(&self) -> Duration {
        Duration::from_millis(self.completed_keep_age_ms)
    }
}

fn default_worker_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("docpipe-{}", host)
}
