//! Redis queue backend
//!
//! Layout under `{prefix}:{queue}`:
//! - `:wait` list, newest on the left; claim pops from the right
//! - `:active` list of jobs held by workers
//! - `:heartbeats` sorted set of active jobs scored by their last heartbeat in milliseconds
//! - `:delayed` sorted set scored by the ready-at time in milliseconds
//! - `:completed` / `:failed` retention lists, newest on the left
//! - `:job:{id}` JSON record of each job
//!
//! Claiming runs `RPOPLPUSH` and the first heartbeat in one script, so one
//! job never reaches two workers and a fresh claim never looks stalled.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use redis::{AsyncCommands, Script};

use super::{JobId, JobState, QueueBackend, QueueCounts, StoredJob};
use crate::cache::RedisPool;

/// KEYS: wait, active, heartbeats. ARGV: now in milliseconds.
const CLAIM_SCRIPT: &str = r#"
local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if id then
  redis.call('ZADD', KEYS[3], ARGV[1], id)
end
return id
"#;

/// KEYS: heartbeats. ARGV: id, now in milliseconds.
const HEARTBEAT_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
  return 1
end
return 0
"#;

#[derive(Clone)]
pub struct RedisBackend {
    pool: RedisPool,
    base: String,
}

impl RedisBackend {
    pub fn new(pool: RedisPool, prefix: &str, queue: &str) -> Self {
        Self {
            pool,
            base: format!("{}:{}", prefix, queue),
        }
    }

    fn key(&self, list: &str) -> String {
        format!("{}:{}", self.base, list)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{}", self.base, id)
    }

    async fn load(&self, id: &str) -> Result<Option<StoredJob>> {
        match self.pool.get(&self.job_key(id)).await? {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).with_context(|| format!("corrupt job record {}", id))?,
            )),
            None => Ok(None),
        }
    }

    async fn trim(&self, list: &str, keep: usize) -> Result<()> {
        let mut conn = self.pool.get_connection().await?;
        let evicted: Vec<String> = conn.lrange(list, keep as isize, -1).await?;
        if evicted.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &evicted {
            pipe.del(self.job_key(id)).ignore();
        }
        if keep == 0 {
            pipe.del(list).ignore();
        } else {
            pipe.ltrim(list, 0, keep as isize - 1).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn push(&self, job: &StoredJob) -> Result<()> {
        let id = job.id.to_string();
        let json = serde_json::to_string(job)?;
        let mut conn = self.pool.get_connection().await?;

        let _: () = redis::pipe()
            .atomic()
            .set(self.job_key(&id), json)
            .ignore()
            .lpush(self.key("wait"), &id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim(&self, now_ms: i64) -> Result<Option<StoredJob>> {
        let mut conn = self.pool.get_connection().await?;
        let delayed = self.key("delayed");
        let wait = self.key("wait");
        let active = self.key("active");

        let due: Vec<String> = conn.zrangebyscore(&delayed, "-inf", now_ms).await?;
        for id in due {
            // Only the process whose ZREM succeeds promotes the job
            let removed: i64 = conn.zrem(&delayed, &id).await?;
            if removed == 1 {
                let _: () = conn.lpush(&wait, &id).await?;
            }
        }

        let claimed: Option<String> = Script::new(CLAIM_SCRIPT)
            .key(&wait)
            .key(&active)
            .key(self.key("heartbeats"))
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        let Some(id) = claimed else {
            return Ok(None);
        };

        match self.load(&id).await? {
            Some(mut job) => {
                job.begin_attempt(Utc.timestamp_millis_opt(now_ms).single().unwrap_or_else(Utc::now));
                self.update(&job).await?;
                Ok(Some(job))
            }
            None => {
                tracing::warn!(job_id = %id, "Claimed job has no record, dropping");
                let _: () = redis::pipe()
                    .atomic()
                    .lrem(&active, 1, &id)
                    .ignore()
                    .zrem(self.key("heartbeats"), &id)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn heartbeat(&self, id: JobId, now_ms: i64) -> Result<bool> {
        let mut conn = self.pool.get_connection().await?;
        let held: i64 = Script::new(HEARTBEAT_SCRIPT)
            .key(self.key("heartbeats"))
            .arg(id.to_string())
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(held == 1)
    }

    async fn update(&self, job: &StoredJob) -> Result<()> {
        let json = serde_json::to_string(job)?;
        self.pool
            .set(&self.job_key(&job.id.to_string()), &json)
            .await
    }

    async fn delay(&self, job: &StoredJob, ready_at_ms: i64) -> Result<()> {
        let id = job.id.to_string();
        let json = serde_json::to_string(job)?;
        let mut conn = self.pool.get_connection().await?;

        let _: () = redis::pipe()
            .atomic()
            .lrem(self.key("active"), 1, &id)
            .ignore()
            .zrem(self.key("heartbeats"), &id)
            .ignore()
            .zadd(self.key("delayed"), &id, ready_at_ms)
            .ignore()
            .set(self.job_key(&id), json)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn finish(&self, job: &StoredJob, keep: usize) -> Result<()> {
        let id = job.id.to_string();
        let json = serde_json::to_string(job)?;
        let list = if job.state == JobState::Completed {
            self.key("completed")
        } else {
            self.key("failed")
        };

        {
            let mut conn = self.pool.get_connection().await?;
            let _: () = redis::pipe()
                .atomic()
                .lrem(self.key("active"), 1, &id)
                .ignore()
                .zrem(self.key("heartbeats"), &id)
                .ignore()
                .set(self.job_key(&id), json)
                .ignore()
                .lpush(&list, &id)
                .ignore()
                .query_async(&mut conn)
                .await?;
        }

        self.trim(&list, keep).await
    }

    async fn requeue(&self, job: &StoredJob) -> Result<()> {
        let id = job.id.to_string();
        let json = serde_json::to_string(job)?;
        let mut conn = self.pool.get_connection().await?;

        let _: () = redis::pipe()
            .atomic()
            .lrem(self.key("active"), 1, &id)
            .ignore()
            .zrem(self.key("heartbeats"), &id)
            .ignore()
            .set(self.job_key(&id), json)
            .ignore()
            .lpush(self.key("wait"), &id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<StoredJob>> {
        self.load(&id.to_string()).await
    }

    async fn stalled(&self, cutoff_ms: i64) -> Result<Vec<StoredJob>> {
        let mut conn = self.pool.get_connection().await?;
        let ids: Vec<String> = conn
            .zrangebyscore(self.key("heartbeats"), "-inf", cutoff_ms)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let mut conn = self.pool.get_connection().await?;
        let (waiting, active, delayed, completed, failed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .llen(self.key("wait"))
                .llen(self.key("active"))
                .zcard(self.key("delayed"))
                .llen(self.key("completed"))
                .llen(self.key("failed"))
                .query_async(&mut conn)
                .await?;

        Ok(QueueCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }
}
