//! Redis-backed broker.
//!
//! Key layout under `{prefix}:{queue}`:
//!
//! - `waiting`: sorted set, score `rank * 2^40 + seq` (claim order)
//! - `delayed`: sorted set, score = eligible-at millis
//! - `active`: sorted set, score = lock expiry millis
//! - `completed`, `failed`: sorted sets, score = finish millis
//! - `priority`, `owners`: hashes of job id to rank and to claiming worker
//! - `job:{id}`: the JSON job record
//!
//! Set membership is the source of truth for a job's state. Every move
//! between sets runs in a Lua script, so a job is claimed and settled at most
//! once even with many processes sharing the server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ::redis::aio::ConnectionManager;
use ::redis::Script;
use tracing::debug;

use crate::{
    QueueResult, QueueError, JobId, JobRecord, JobStatus, JobCounts,
    broker::{Broker, Settlement},
    config::BrokerConfig,
    types::{WorkerId, record::later_by},
};

/// 2^40: priority rank occupies the bits above the sequence number
const RANK_SHIFT: u64 = 1 << 40;

const ADD_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return redis.call('GET', KEYS[1])
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
if ARGV[4] ~= '' then
  redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
else
  local seq = redis.call('INCR', KEYS[4])
  redis.call('ZADD', KEYS[2], tonumber(ARGV[3]) * tonumber(ARGV[5]) + seq, ARGV[1])
end
return false
"#;

const PROMOTE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  local rank = tonumber(redis.call('HGET', KEYS[3], id) or '2')
  local seq = redis.call('INCR', KEYS[4])
  redis.call('ZADD', KEYS[2], rank * tonumber(ARGV[2]) + seq, id)
end
"#;

const CLAIM_TAIL: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[2])
if #popped == 0 then
  return false
end
local id = popped[1]
redis.call('ZADD', KEYS[5], ARGV[3], id)
redis.call('HSET', KEYS[6], id, ARGV[4])
return id
"#;

const COUNT_TAIL: &str = r#"
return {
  redis.call('ZCARD', KEYS[2]),
  redis.call('ZCARD', KEYS[1]),
  redis.call('ZCARD', KEYS[5]),
  redis.call('ZCARD', KEYS[6]),
  redis.call('ZCARD', KEYS[7])
}
"#;

const SETTLE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HDEL', KEYS[4], ARGV[1])
if ARGV[4] == '1' then
  redis.call('DEL', KEYS[3])
  redis.call('HDEL', KEYS[5], ARGV[1])
else
  redis.call('SET', KEYS[3], ARGV[2])
  redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
end
return 1
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return 0
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
return 1
"#;

const CLEAN_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', KEYS[2], id)
  redis.call('DEL', ARGV[2] .. id)
end
return ids
"#;

/// Broker on a shared Redis server, multiplexed through a [`ConnectionManager`]
pub struct RedisBroker {
    conn: ConnectionManager,
    prefix: String,
    closed: AtomicBool,
    add_script: Script,
    claim_script: Script,
    count_script: Script,
    settle_script: Script,
    extend_script: Script,
    clean_script: Script,
}

impl RedisBroker {
    /// Connect to the server described by `config`; keys are namespaced by `prefix`
    pub async fn connect(config: &BrokerConfig, prefix: impl Into<String>) -> QueueResult<Self> {
        let client = ::redis::Client::open(config.url())
            .map_err(|e| QueueError::InvalidConfig(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;

        debug!(host = %config.host, port = config.port, db = config.db, "redis broker connected");

        Ok(Self {
            conn,
            prefix: prefix.into(),
            closed: AtomicBool::new(false),
            add_script: Script::new(ADD_SCRIPT),
            claim_script: Script::new(&format!("{}{}", PROMOTE, CLAIM_TAIL)),
            count_script: Script::new(&format!("{}{}", PROMOTE, COUNT_TAIL)),
            settle_script: Script::new(SETTLE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
            clean_script: Script::new(CLEAN_SCRIPT),
        })
    }

    /// Connect using `REDIS_*` environment variables
    pub async fn from_env(prefix: impl Into<String>) -> QueueResult<Self> {
        let config = BrokerConfig::from_env()?;
        Self::connect(&config, prefix).await
    }

    fn key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, suffix)
    }

    fn job_key_prefix(&self, queue: &str) -> String {
        format!("{}:{}:job:", self.prefix, queue)
    }

    fn job_key(&self, queue: &str, job_id: &JobId) -> String {
        format!("{}{}", self.job_key_prefix(queue), job_id)
    }

    fn status_key(&self, queue: &str, status: JobStatus) -> String {
        self.key(queue, status.name())
    }

    fn connection(&self) -> QueueResult<ConnectionManager> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::BrokerUnavailable("redis broker is closed".to_string()));
        }
        Ok(self.conn.clone())
    }

    async fn load(&self, conn: &mut ConnectionManager, queue: &str, ids: &[String]) -> QueueResult<Vec<JobRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| format!("{}{}", self.job_key_prefix(queue), id)).collect();
        let raw: Vec<Option<String>> = ::redis::cmd("MGET").arg(&keys).query_async(conn).await?;

        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(QueueError::from))
            .collect()
    }

    async fn store(&self, conn: &mut ConnectionManager, record: &JobRecord) -> QueueResult<()> {
        let json = serde_json::to_string(record)?;
        let _: () = ::redis::cmd("SET")
            .arg(self.job_key(&record.queue, &record.id))
            .arg(json)
            .query_async(conn)
            .await?;
        Ok(())
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: f64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms as i64).single()
}

#[async_trait]
impl Broker for RedisBroker {
    async fn next_id(&self) -> QueueResult<JobId> {
        let mut conn = self.connection()?;
        let id: u64 = ::redis::cmd("INCR")
            .arg(format!("{}:id", self.prefix))
            .query_async(&mut conn)
            .await?;
        Ok(JobId::from_sequence(id))
    }

    async fn add(&self, job: JobRecord) -> QueueResult<(JobRecord, bool)> {
        let mut conn = self.connection()?;
        let json = serde_json::to_string(&job)?;

        let (target, delayed_score) = match (job.status, job.delay_until) {
            (JobStatus::Delayed, Some(at)) => (self.key(&job.queue, "delayed"), millis(at).to_string()),
            _ => (self.key(&job.queue, "waiting"), String::new()),
        };

        let existing: Option<String> = self
            .add_script
            .key(self.job_key(&job.queue, &job.id))
            .key(target)
            .key(self.key(&job.queue, "priority"))
            .key(format!("{}:seq", self.prefix))
            .arg(job.id.as_str())
            .arg(json)
            .arg(job.priority.rank() as u32)
            .arg(delayed_score)
            .arg(RANK_SHIFT)
            .invoke_async(&mut conn)
            .await?;

        match existing {
            Some(json) => Ok((serde_json::from_str(&json)?, false)),
            None => Ok((job, true)),
        }
    }

    async fn claim(
        &self,
        queue: &str,
        worker: &WorkerId,
        lock_for: Duration,
    ) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.connection()?;
        let now = Utc::now();
        let lock_until = later_by(now, lock_for);

        let claimed: Option<String> = self
            .claim_script
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "waiting"))
            .key(self.key(queue, "priority"))
            .key(format!("{}:seq", self.prefix))
            .key(self.key(queue, "active"))
            .key(self.key(queue, "owners"))
            .arg(millis(now))
            .arg(RANK_SHIFT)
            .arg(millis(lock_until))
            .arg(worker.as_str())
            .invoke_async(&mut conn)
            .await?;

        let Some(id) = claimed else {
            return Ok(None);
        };
        let job_id = JobId::from(id);

        // Ownership is already recorded in `active`; bring the record body up to date
        let mut record = self
            .get(queue, &job_id)
            .await?
            .ok_or_else(|| QueueError::Internal(format!("claimed job {} has no record", job_id)))?;
        record.activate(Some(worker.clone()), lock_until);
        self.store(&mut conn, &record).await?;

        debug!(queue, job_id = %job_id, worker = %worker, "claimed job");
        Ok(Some(record))
    }

    async fn settle(
        &self,
        queue: &str,
        job_id: &JobId,
        settlement: Settlement,
    ) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.connection()?;
        let Some(mut record) = self.get(queue, job_id).await? else {
            return Ok(None);
        };
        if record.status != JobStatus::Active {
            return Ok(None);
        }

        let now = Utc::now();
        let (target, score, remove) = match settlement {
            Settlement::Completed => {
                record.complete();
                let finished = record.completed_at.unwrap_or(now);
                (JobStatus::Completed, millis(finished), record.remove_on_complete)
            }
            Settlement::Failed { error, retryable, backoff_cap } => {
                if retryable && record.can_retry() {
                    let delay = record.backoff.delay_for(record.attempts + 1, backoff_cap);
                    let retry_at = later_by(now, delay);
                    record.schedule_retry(error, retry_at);
                    (JobStatus::Delayed, millis(retry_at), false)
                } else {
                    record.fail(error);
                    let finished = record.failed_at.unwrap_or(now);
                    (JobStatus::Failed, millis(finished), record.remove_on_fail)
                }
            }
        };

        let moved: i64 = self
            .settle_script
            .key(self.key(queue, "active"))
            .key(self.status_key(queue, target))
            .key(self.job_key(queue, job_id))
            .key(self.key(queue, "owners"))
            .key(self.key(queue, "priority"))
            .arg(job_id.as_str())
            .arg(serde_json::to_string(&record)?)
            .arg(score)
            .arg(if remove { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        Ok((moved == 1).then_some(record))
    }

    async fn extend_lock(
        &self,
        queue: &str,
        job_id: &JobId,
        worker: &WorkerId,
        lock_for: Duration,
    ) -> QueueResult<bool> {
        let mut conn = self.connection()?;
        let lock_until = later_by(Utc::now(), lock_for);

        let renewed: i64 = self
            .extend_script
            .key(self.key(queue, "active"))
            .key(self.key(queue, "owners"))
            .arg(job_id.as_str())
            .arg(worker.as_str())
            .arg(millis(lock_until))
            .invoke_async(&mut conn)
            .await?;

        Ok(renewed > 0)
    }

    async fn get(&self, queue: &str, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.connection()?;
        let raw: Option<String> = ::redis::cmd("GET")
            .arg(self.job_key(queue, job_id))
            .query_async(&mut conn)
            .await?;

        raw.map(|json| serde_json::from_str(&json).map_err(QueueError::from))
            .transpose()
    }

    async fn list(&self, queue: &str, status: JobStatus, limit: usize) -> QueueResult<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection()?;
        let ids: Vec<String> = ::redis::cmd("ZRANGE")
            .arg(self.status_key(queue, status))
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await?;

        let mut records = self.load(&mut conn, queue, &ids).await?;
        // Promoted jobs keep their delayed record until claimed
        for record in &mut records {
            record.status = status;
        }
        Ok(records)
    }

    async fn counts(&self, queue: &str) -> QueueResult<JobCounts> {
        let mut conn = self.connection()?;
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) = self
            .count_script
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "waiting"))
            .key(self.key(queue, "priority"))
            .key(format!("{}:seq", self.prefix))
            .key(self.key(queue, "active"))
            .key(self.key(queue, "completed"))
            .key(self.key(queue, "failed"))
            .arg(millis(Utc::now()))
            .arg(RANK_SHIFT)
            .invoke_async(&mut conn)
            .await?;

        Ok(JobCounts { waiting, delayed, active, completed, failed })
    }

    async fn clean(
        &self,
        queue: &str,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> QueueResult<Vec<JobId>> {
        if !status.is_terminal() {
            return Err(QueueError::InvalidConfig(format!("cannot clean {} jobs", status)));
        }
        let mut conn = self.connection()?;

        // `(` makes the bound exclusive: strictly older than the cutoff
        let removed: Vec<String> = self
            .clean_script
            .key(self.status_key(queue, status))
            .key(self.key(queue, "priority"))
            .arg(format!("({}", millis(cutoff)))
            .arg(self.job_key_prefix(queue))
            .invoke_async(&mut conn)
            .await?;

        Ok(removed.into_iter().map(JobId::from).collect())
    }

    async fn expired_locks(&self, queue: &str, now: DateTime<Utc>) -> QueueResult<Vec<JobRecord>> {
        let mut conn = self.connection()?;
        let expired: Vec<(String, f64)> = ::redis::cmd("ZRANGEBYSCORE")
            .arg(self.key(queue, "active"))
            .arg("-inf")
            .arg(format!("({}", millis(now)))
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        let ids: Vec<String> = expired.iter().map(|(id, _)| id.clone()).collect();
        let mut records = self.load(&mut conn, queue, &ids).await?;
        for record in &mut records {
            if let Some((_, score)) = expired.iter().find(|(id, _)| id == record.id.as_str()) {
                record.lock_until = from_millis(*score);
            }
        }
        Ok(records)
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        debug!("redis broker closed");
        Ok(())
    }
}
