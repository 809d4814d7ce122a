//! Admission control for job starts.
//!
//! The limiter bounds job starts per time window across every worker process
//! sharing the queue, so scaling out does not multiply the effective limit.
//! `SharedRateLimiter` keeps the counters in Redis (fixed window);
//! `LocalRateLimiter` is the in-process equivalent for embedded deployments
//! and tests.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::types::{AppError, AppResult};

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Suspend until a job-start slot is available.
    async fn acquire(&self) -> AppResult<()>;
}

/// Counter increment and window expiry in one script, so the key can never
/// be left without a TTL by a failure between the two commands. A counter
/// with no TTL would never expire, and every `acquire` would wait forever.
const WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Redis fixed-window limiter: one INCR-ed counter per window, expired by
/// Redis itself. Centralized, so the limit holds across processes.
pub struct SharedRateLimiter {
    con: ConnectionManager,
    window_script: Script,
    max: u32,
    window: Duration,
}

impl SharedRateLimiter {
    const KEY: &'static str = "docpipe:ratelimit";

    pub fn new(con: ConnectionManager, max: u32, window: Duration) -> AppResult<Self> {
        if max == 0 {
            return Err(AppError::Config("rate limit max must be positive".into()));
        }
        Ok(Self {
            con,
            window_script: Script::new(WINDOW_SCRIPT),
            max,
            window,
        })
    }
}

/// How long to sleep before retrying a full window, and whether the counter
/// key first needs its expiry restored. A negative TTL means the key has no
/// expiry (for example one left behind by an older process that died between
/// incrementing and setting the TTL); without repair it would never open a
/// new window.
fn retry_wait(ttl_ms: i64, window: Duration) -> (Duration, bool) {
    if ttl_ms < 0 {
        (window, true)
    } else {
        (Duration::from_millis(ttl_ms as u64), false)
    }
}

#[async_trait]
impl RateLimiter for SharedRateLimiter {
    async fn acquire(&self) -> AppResult<()> {
        loop {
            let mut con = self.con.clone();
            let count: i64 = self
                .window_script
                .key(Self::KEY)
                .arg(self.window.as_millis() as i64)
                .invoke_async(&mut con)
                .await?;
            if count <= self.max as i64 {
                return Ok(());
            }
            // window is full; wait for the key to expire and try again
            let ttl: i64 = con.pttl(Self::KEY).await?;
            let (wait, repair_expiry) = retry_wait(ttl, self.window);
            if repair_expiry {
                let _: () = con.pexpire(Self::KEY, self.window.as_millis() as i64).await?;
            }
            tokio::time::sleep(wait).await;
        }
    }
}

/// In-process token bucket via `governor`, shaped to "max per window".
pub struct LocalRateLimiter {
    inner: governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl LocalRateLimiter {
    pub fn new(max: u32, window: Duration) -> AppResult<Self> {
        let max = NonZeroU32::new(max)
            .ok_or_else(|| AppError::Config("rate limit max must be positive".into()))?;
        let period = window / max.get();
        let quota = Quota::with_period(period)
            .ok_or_else(|| AppError::Config("rate limit window must be positive".into()))?
            .allow_burst(max);
        Ok(Self {
            inner: governor::RateLimiter::direct(quota),
        })
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    async fn acquire(&self) -> AppResult<()> {
        self.inner.until_ready().await;
        Ok(())
    }
}
