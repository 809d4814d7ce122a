//! Redis-backed queue.
//!
//! Layout, all under the `docpipe:` prefix:
//! - `waiting`    list of ready job ids (LPUSH producer side, RPOP claim side)
//! - `delayed`    zset of job ids scored by ready-at millis
//! - `active`     zset of claimed job ids scored by last-heartbeat millis
//! - `job:{id}`   JSON of the stored job (payload + attempt/stall counters)
//! - `completed`  zset of finished job ids scored by completion millis
//! - `dead`       list of JSON dead letter records, never auto-pruned
//!
//! The claim step runs as a Lua script so pop-from-waiting and
//! register-as-active happen atomically; a worker crash between the two can
//! therefore never lose a job id. Everything else tolerates at-least-once
//! semantics by design.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ClaimedJob, DeadLetterJob, Job};
use crate::types::{AppError, AppResult};

use super::{JobQueue, QueueDepths, StallSweep};

const KEY_WAITING: &str = "docpipe:waiting";
const KEY_DELAYED: &str = "docpipe:delayed";
const KEY_ACTIVE: &str = "docpipe:active";
const KEY_COMPLETED: &str = "docpipe:completed";
const KEY_DEAD: &str = "docpipe:dead";

fn job_key(job_id: &str) -> String {
    format!("docpipe:job:{job_id}")
}

// RPOP waiting, ZADD active with the claim timestamp, atomically.
const CLAIM_SCRIPT: &str = r#"
local id = redis.call('RPOP', KEYS[1])
if not id then
  return nil
end
redis.call('ZADD', KEYS[2], ARGV[1], id)
return id
"#;

#[derive(Debug, Serialize, Deserialize)]
struct StoredJob {
    job: Job,
    stalled_count: u32,
}

pub struct RedisQueue {
    con: ConnectionManager,
    claim_script: Script,
    max_stalled_count: u32,
    /// Batch size for delayed-promotion and stalled sweeps.
    sweep_batch: isize,
}

impl RedisQueue {
    pub fn new(con: ConnectionManager, max_stalled_count: u32) -> Self {
        Self {
            con,
            claim_script: Script::new(CLAIM_SCRIPT),
            max_stalled_count,
            sweep_batch: 128,
        }
    }

    async fn load(&self, job_id: &str) -> AppResult<Option<StoredJob>> {
        let mut con = self.con.clone();
        let raw: Option<String> = con.get(job_key(job_id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, job_id: &str, stored: &StoredJob) -> AppResult<()> {
        let mut con = self.con.clone();
        let json = serde_json::to_string(stored)?;
        let _: () = con.set(job_key(job_id), json).await?;
        Ok(())
    }

    /// Move due delayed jobs back into the waiting list. Safe under multiple
    /// processes: only the sweeper whose ZREM removed the id pushes it.
    async fn promote_due(&self) -> AppResult<()> {
        let mut con = self.con.clone();
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = con
            .zrangebyscore_limit(KEY_DELAYED, "-inf", now, 0, self.sweep_batch)
            .await?;
        for job_id in due {
            let removed: i64 = con.zrem(KEY_DELAYED, &job_id).await?;
            if removed > 0 {
                let _: () = con.lpush(KEY_WAITING, &job_id).await?;
            }
        }
        Ok(())
    }

    async fn remove_everywhere(&self, job_id: &str) -> AppResult<()> {
        let mut con = self.con.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(KEY_ACTIVE, job_id)
            .zrem(KEY_DELAYED, job_id)
            .lrem(KEY_WAITING, 0, job_id)
            .del(job_key(job_id))
            .query_async(&mut con)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: Job) -> AppResult<String> {
        let job_id = Uuid::new_v4().to_string();
        self.store(
            &job_id,
            &StoredJob {
                job,
                stalled_count: 0,
            },
        )
        .await?;
        let mut con = self.con.clone();
        let _: () = con.lpush(KEY_WAITING, &job_id).await?;
        Ok(job_id)
    }

    async fn claim(&self) -> AppResult<Option<ClaimedJob>> {
        self.promote_due().await?;
        let mut con = self.con.clone();
        let now = Utc::now().timestamp_millis();
        let job_id: Option<String> = self
            .claim_script
            .key(KEY_WAITING)
            .key(KEY_ACTIVE)
            .arg(now)
            .invoke_async(&mut con)
            .await?;
        let Some(job_id) = job_id else {
            return Ok(None);
        };
        match self.load(&job_id).await? {
            Some(stored) => Ok(Some(ClaimedJob {
                job_id,
                job: stored.job,
                stalled_count: stored.stalled_count,
            })),
            None => {
                // payload vanished (e.g. concurrent dead-letter); drop the claim
                let _: () = con.zrem(KEY_ACTIVE, &job_id).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, job_id: &str) -> AppResult<()> {
        let mut con = self.con.clone();
        let now = Utc::now().timestamp_millis();
        let _: () = redis::pipe()
            .atomic()
            .zrem(KEY_ACTIVE, job_id)
            .del(job_key(job_id))
            .zadd(KEY_COMPLETED, job_id, now)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn nack(&self, job_id: &str, delay: Duration) -> AppResult<()> {
        let mut stored = self
            .load(job_id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("nack of unknown job {job_id}")))?;
        stored.job.attempts_made += 1;
        self.store(job_id, &stored).await?;

        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut con = self.con.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(KEY_ACTIVE, job_id)
            .zadd(KEY_DELAYED, job_id, ready_at)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, job_id: &str, reason: &str) -> AppResult<()> {
        let Some(stored) = self.load(job_id).await? else {
            return Ok(());
        };
        let record = DeadLetterJob {
            original_job_id: job_id.to_string(),
            job: stored.job,
            failure_reason: reason.to_string(),
            failed_at: Utc::now(),
        };
        let json = serde_json::to_string(&record)?;
        let mut con = self.con.clone();
        let _: () = con.rpush(KEY_DEAD, json).await?;
        self.remove_everywhere(job_id).await
    }

    async fn heartbeat(&self, job_id: &str) -> AppResult<()> {
        let mut con = self.con.clone();
        let now = Utc::now().timestamp_millis();
        // XX: refresh only a live claim. An unconditional ZADD could re-add
        // the id after the stalled sweep (or an ack) released it, leaving
        // the job both waiting and active.
        let _: () = redis::cmd("ZADD")
            .arg(KEY_ACTIVE)
            .arg("XX")
            .arg(now)
            .arg(job_id)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn recover_stalled(&self, stall_after: Duration) -> AppResult<StallSweep> {
        let mut con = self.con.clone();
        let cutoff = Utc::now().timestamp_millis() - stall_after.as_millis() as i64;
        let stalled: Vec<String> = con
            .zrangebyscore_limit(KEY_ACTIVE, "-inf", cutoff, 0, self.sweep_batch)
            .await?;

        let mut sweep = StallSweep::default();
        for job_id in stalled {
            // only the sweeper that wins the ZREM owns the recovery
            let removed: i64 = con.zrem(KEY_ACTIVE, &job_id).await?;
            if removed == 0 {
                continue;
            }
            let Some(mut stored) = self.load(&job_id).await? else {
                continue;
            };
            stored.stalled_count += 1;
            if stored.stalled_count >= self.max_stalled_count {
                let record = DeadLetterJob {
                    original_job_id: job_id.clone(),
                    job: stored.job,
                    failure_reason: format!(
                        "stalled {} times, exceeding the stall tolerance",
                        stored.stalled_count
                    ),
                    failed_at: Utc::now(),
                };
                let json = serde_json::to_string(&record)?;
                let _: () = con.rpush(KEY_DEAD, json).await?;
                let _: () = con.del(job_key(&job_id)).await?;
                sweep.dead_lettered.push(job_id);
            } else {
                self.store(&job_id, &stored).await?;
                let _: () = con.lpush(KEY_WAITING, &job_id).await?;
                sweep.requeued.push(job_id);
            }
        }
        Ok(sweep)
    }

    async fn prune_completed(&self, keep: usize, max_age: Duration) -> AppResult<u64> {
        let mut con = self.con.clone();
        let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let by_age: u64 = con.zrembyscore(KEY_COMPLETED, "-inf", cutoff).await?;
        let card: u64 = con.zcard(KEY_COMPLETED).await?;
        let by_count = if card > keep as u64 {
            let excess = (card - keep as u64) as isize;
            let removed: u64 = con
                .zremrangebyrank(KEY_COMPLETED, 0, excess - 1)
                .await?;
            removed
        } else {
            0
        };
        Ok(by_age + by_count)
    }

    async fn depths(&self) -> AppResult<QueueDepths> {
        let mut con = self.con.clone();
        let (waiting, delayed, active, dead): (u64, u64, u64, u64) = redis::pipe()
            .llen(KEY_WAITING)
            .zcard(KEY_DELAYED)
            .zcard(KEY_ACTIVE)
            .llen(KEY_DEAD)
            .query_async(&mut con)
            .await?;
        Ok(QueueDepths {
            waiting,
            delayed,
            active,
            dead,
        })
    }

    async fn dead_letters(&self) -> AppResult<Vec<DeadLetterJob>> {
        let mut con = self.con.clone();
        let raw: Vec<String> = con.lrange(KEY_DEAD, 0, -1).await?;
        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(AppError::from))
            .collect()
    }

    async fn ping(&self) -> AppResult<()> {
        let mut con = self.con.clone();
        let _: String = redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }
}
