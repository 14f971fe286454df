//! Redis queue backend.
//!
//! Layout, with `<p>` the configured key prefix:
//!
//! - `<p>:job:<id>` hash: `job` (JSON snapshot taken at enqueue) plus the
//!   mutable fields `state`, `attempts`, `token`, `result`, `failed_reason`,
//!   `processed_at`, `finished_at`
//! - `<p>:<queue>:wait` zset scored by `priority * 2^32 + seq`
//! - `<p>:<queue>:delayed` zset scored by the ms timestamp the job is ready at
//! - `<p>:<queue>:active` zset scored by lease expiry
//! - `<p>:<queue>:completed` / `:failed` zsets scored by finish time
//!
//! Claim, completion and failure run as Lua scripts so each transition is a
//! single atomic step on the server.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Backoff, Claim, Job, JobCounts, JobOptions, JobPayload, JobState, QueueBackend, QueueName,
    RetentionPolicy, STALLED_REASON,
};
use crate::config::RedisConfig;
use crate::types::{AppError, AppResult};
use crate::utils::retry::with_retry;

const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  local score = redis.call('HGET', ARGV[4] .. id, 'wait_score')
  if score then
    redis.call('ZADD', KEYS[1], score, id)
  end
end
while true do
  local head = redis.call('ZRANGE', KEYS[1], 0, 0)
  if #head == 0 then
    return false
  end
  local id = head[1]
  redis.call('ZREM', KEYS[1], id)
  local key = ARGV[4] .. id
  if redis.call('HGET', key, 'state') == 'queued' then
    redis.call('HSET', key, 'state', 'active', 'token', ARGV[3], 'processed_at', ARGV[1])
    redis.call('ZADD', KEYS[3], tonumber(ARGV[1]) + tonumber(ARGV[2]), id)
    return id
  end
end
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' then
  return 0
end
if redis.call('HGET', KEYS[1], 'token') ~= ARGV[2] then
  return 0
end
redis.call('HSET', KEYS[1], 'state', 'completed', 'result', ARGV[3], 'finished_at', ARGV[4])
redis.call('HDEL', KEYS[1], 'token')
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
return 1
"#;

// ARGV[5] == '1' checks the lease token; '0' is stall recovery, which instead
// checks that the lease really expired. ARGV[6] == '1' re-queues without backoff.
const FAIL_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' then
  return -1
end
if ARGV[5] == '1' then
  if redis.call('HGET', KEYS[1], 'token') ~= ARGV[2] then
    return -1
  end
else
  local expires = redis.call('ZSCORE', KEYS[2], ARGV[1])
  if (not expires) or tonumber(expires) > tonumber(ARGV[4]) then
    return -1
  end
end
local attempts = redis.call('HINCRBY', KEYS[1], 'attempts', 1)
local max = tonumber(redis.call('HGET', KEYS[1], 'max_attempts'))
redis.call('HSET', KEYS[1], 'failed_reason', ARGV[3])
redis.call('HDEL', KEYS[1], 'token')
redis.call('ZREM', KEYS[2], ARGV[1])
if attempts < max then
  redis.call('HSET', KEYS[1], 'state', 'queued')
  local delay = 0
  if ARGV[6] ~= '1' then
    local base = tonumber(redis.call('HGET', KEYS[1], 'backoff_ms'))
    if redis.call('HGET', KEYS[1], 'backoff_kind') == 'exponential' then
      delay = base * (2 ^ attempts)
    else
      delay = base
    end
  end
  if delay > 0 then
    redis.call('ZADD', KEYS[4], tonumber(ARGV[4]) + delay, ARGV[1])
  else
    redis.call('ZADD', KEYS[3], redis.call('HGET', KEYS[1], 'wait_score'), ARGV[1])
  end
  return 1
end
redis.call('HSET', KEYS[1], 'state', 'failed', 'finished_at', ARGV[4])
redis.call('ZADD', KEYS[5], ARGV[4], ARGV[1])
return 2
"#;

pub struct RedisQueue {
    conn: ConnectionManager,
    prefix: String,
    claim_script: Script,
    complete_script: Script,
    fail_script: Script,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn parse_ms(raw: Option<&String>) -> Option<DateTime<Utc>> {
    raw.and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
}

impl RedisQueue {
    /// Connect, retrying with backoff while Redis comes up.
    pub async fn connect(config: &RedisConfig) -> AppResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = with_retry(
            || ConnectionManager::new(client.clone()),
            5,
            Duration::from_millis(50),
            Duration::from_secs(2),
        )
        .await?;
        info!(url = %config.url, prefix = %config.key_prefix, "Connected to Redis job queue");
        Ok(Self::with_connection(conn, &config.key_prefix))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            claim_script: Script::new(CLAIM_SCRIPT),
            complete_script: Script::new(COMPLETE_SCRIPT),
            fail_script: Script::new(FAIL_SCRIPT),
        }
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn queue_key(&self, queue: QueueName, set: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, set)
    }

    async fn load(&self, id: &str) -> AppResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.job_key(id))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Self::decode(&fields).map(Some)
    }

    fn decode(fields: &HashMap<String, String>) -> AppResult<Job> {
        let snapshot = fields
            .get("job")
            .ok_or_else(|| AppError::Queue("job hash is missing its snapshot".into()))?;
        let mut job: Job = serde_json::from_str(snapshot)?;
        if let Some(state) = fields.get("state") {
            job.state = state.parse()?;
        }
        if let Some(attempts) = fields.get("attempts").and_then(|v| v.parse().ok()) {
            job.attempts = attempts;
        }
        job.result = fields.get("result").cloned();
        job.failed_reason = fields.get("failed_reason").cloned();
        job.processed_at = parse_ms(fields.get("processed_at"));
        job.finished_at = parse_ms(fields.get("finished_at"));
        Ok(job)
    }

    async fn run_fail(&self, job: &Job, token: &str, reason: &str, stalled: bool) -> AppResult<i64> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .fail_script
            .key(self.job_key(&job.id))
            .key(self.queue_key(job.queue, "active"))
            .key(self.queue_key(job.queue, "wait"))
            .key(self.queue_key(job.queue, "delayed"))
            .key(self.queue_key(job.queue, "failed"))
            .arg(&job.id)
            .arg(token)
            .arg(reason)
            .arg(now_ms())
            .arg(if stalled { "0" } else { "1" })
            .arg(if stalled { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        Ok(code)
    }

    async fn finished_ids(&self, key: &str, age: Duration, keep: usize) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let cutoff = now_ms() - age.as_millis() as i64;
        let mut ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({}", cutoff))
            .query_async(&mut conn)
            .await?;
        let overflow: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(keep as i64)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        for id in overflow {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> AppResult<Job> {
        let job = Job::new(payload, options)?;
        let mut conn = self.conn.clone();

        let seq: u64 = redis::cmd("INCR")
            .arg(format!("{}:seq", self.prefix))
            .query_async(&mut conn)
            .await?;
        let wait_score = (job.priority as f64) * 4_294_967_296.0 + seq as f64;
        let (backoff_kind, backoff_ms) = match job.backoff {
            Backoff::Fixed { delay_ms } => ("fixed", delay_ms),
            Backoff::Exponential { delay_ms } => ("exponential", delay_ms),
        };

        let fields: Vec<(&str, String)> = vec![
            ("job", serde_json::to_string(&job)?),
            ("state", JobState::Queued.to_string()),
            ("attempts", "0".to_string()),
            ("max_attempts", job.max_attempts.to_string()),
            ("backoff_kind", backoff_kind.to_string()),
            ("backoff_ms", backoff_ms.to_string()),
            ("wait_score", wait_score.to_string()),
        ];

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.job_key(&job.id), &fields)
            .ignore()
            .zadd(self.queue_key(job.queue, "wait"), &job.id, wait_score)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::Enqueue(format!("{}: {}", job.id, e)))?;

        debug!(job_id = %job.id, queue = %job.queue, "Job enqueued in Redis");
        Ok(job)
    }

    async fn get_job(&self, id: &str) -> AppResult<Option<Job>> {
        self.load(id).await
    }

    async fn get_completed(&self, queue: QueueName) -> AppResult<Vec<Job>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.queue_key(queue, "completed"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn claim(&self, queue: QueueName, lease: Duration) -> AppResult<Option<Claim>> {
        let mut conn = self.conn.clone();
        let token = Uuid::new_v4();
        let claimed: Option<String> = self
            .claim_script
            .key(self.queue_key(queue, "wait"))
            .key(self.queue_key(queue, "delayed"))
            .key(self.queue_key(queue, "active"))
            .arg(now_ms())
            .arg(lease.as_millis() as i64)
            .arg(token.to_string())
            .arg(self.job_prefix())
            .invoke_async(&mut conn)
            .await?;

        let Some(id) = claimed else {
            return Ok(None);
        };
        match self.load(&id).await? {
            Some(job) => Ok(Some(Claim { job, token })),
            None => {
                warn!(job_id = %id, "Claimed job vanished before it could be loaded");
                Ok(None)
            }
        }
    }

    async fn complete(&self, claim: &Claim, result: String) -> AppResult<Job> {
        let mut conn = self.conn.clone();
        let job = &claim.job;
        let done: i64 = self
            .complete_script
            .key(self.job_key(&job.id))
            .key(self.queue_key(job.queue, "active"))
            .key(self.queue_key(job.queue, "completed"))
            .arg(&job.id)
            .arg(claim.token.to_string())
            .arg(result)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        if done != 1 {
            return Err(AppError::LeaseLost(job.id.clone()));
        }
        self.load(&job.id)
            .await?
            .ok_or_else(|| AppError::NotFound(job.id.clone()))
    }

    async fn fail(&self, claim: &Claim, reason: &str) -> AppResult<Job> {
        let code = self
            .run_fail(&claim.job, &claim.token.to_string(), reason, false)
            .await?;
        if code < 0 {
            return Err(AppError::LeaseLost(claim.job.id.clone()));
        }
        self.load(&claim.job.id)
            .await?
            .ok_or_else(|| AppError::NotFound(claim.job.id.clone()))
    }

    async fn recover_stalled(&self) -> AppResult<usize> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let mut moved = 0;
        for queue in QueueName::ALL {
            let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(self.queue_key(queue, "active"))
                .arg("-inf")
                .arg(now)
                .query_async(&mut conn)
                .await?;
            for id in expired {
                let Some(job) = self.load(&id).await? else {
                    continue;
                };
                if self.run_fail(&job, "", STALLED_REASON, true).await? >= 0 {
                    warn!(job_id = %id, queue = %queue, "Recovered stalled job");
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }

    async fn purge(&self, retention: &RetentionPolicy) -> AppResult<usize> {
        let mut conn = self.conn.clone();
        let mut removed = 0;
        for queue in QueueName::ALL {
            for (set, age, keep) in [
                ("completed", retention.completed_age, retention.completed_count),
                ("failed", retention.failed_age, retention.failed_count),
            ] {
                let key = self.queue_key(queue, set);
                let ids = self.finished_ids(&key, age, keep).await?;
                if ids.is_empty() {
                    continue;
                }
                let job_keys: Vec<String> = ids.iter().map(|id| self.job_key(id)).collect();
                let _: () = redis::pipe()
                    .atomic()
                    .del(job_keys)
                    .ignore()
                    .zrem(&key, &ids)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                removed += ids.len();
            }
        }
        if removed > 0 {
            debug!(removed, "Purged finished jobs from Redis");
        }
        Ok(removed)
    }

    async fn counts(&self, queue: QueueName) -> AppResult<JobCounts> {
        let mut conn = self.conn.clone();
        let (wait, delayed, active, completed, failed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .zcard(self.queue_key(queue, "wait"))
                .zcard(self.queue_key(queue, "delayed"))
                .zcard(self.queue_key(queue, "active"))
                .zcard(self.queue_key(queue, "completed"))
                .zcard(self.queue_key(queue, "failed"))
                .query_async(&mut conn)
                .await?;
        Ok(JobCounts {
            queued: wait + delayed,
            active,
            completed,
            failed,
        })
    }

    async fn ping(&self) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
