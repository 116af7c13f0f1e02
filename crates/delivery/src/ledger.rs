//! Pending-delivery ledger.
//!
//! Three structures track a job awaiting confirmation on a device:
//! - `pending:{user}:{device}` — hash of jobId → enqueuedAt millis
//! - `pending:index` — global zset of `user|device|job` scored by expiry
//! - `pending:waiting:{job}` — set of `user|device` still awaiting the job
//!
//! plus `attempts:{user}:{device}:{job}` holding the attempt counter. Every
//! mutation that touches more than one of these runs as a single Lua script,
//! so the ledger and the expiry index can never disagree.

use std::time::Duration;

use chrono::Utc;
use redis::{AsyncCommands, Script};
use redis::aio::ConnectionManager;
use uuid::Uuid;

use courier_common::error::CourierError;

use crate::keys;

/// Identity of one pending entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingKey {
    pub user: Uuid,
    pub device: String,
    pub job_id: String,
}

impl PendingKey {
    pub fn new(user: Uuid, device: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            user,
            device: device.into(),
            job_id: job_id.into(),
        }
    }

    fn member(&self) -> String {
        keys::index_member(&self.user, &self.device, &self.job_id)
    }
}

/// What a removal left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Other devices are still awaiting this job.
    Remaining,
    /// This was the last device; the stored job body was deleted too.
    LastDevice,
}

/// Attempt bookkeeping for one pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptRecord {
    pub count: u32,
    /// Millis timestamp of the first attempt.
    pub first_ms: i64,
    /// Millis timestamp of the most recent attempt.
    pub touched_ms: i64,
}

#[derive(Clone)]
pub struct PendingLedger {
    redis: ConnectionManager,
    pending_ttl: Duration,
    attempts_ttl: Duration,
    add_script: Script,
    remove_script: Script,
    pop_script: Script,
    touch_script: Script,
}

impl PendingLedger {
    pub fn new(redis: ConnectionManager, pending_ttl: Duration) -> Self {
        // Attempt counters must outlive the slowest resolution path by a wide
        // margin; they are deleted explicitly on resolution anyway.
        let attempts_ttl = pending_ttl * 16;
        Self {
            redis,
            pending_ttl,
            attempts_ttl,
            add_script: Script::new(
                r#"
                redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
                redis.call('ZADD', KEYS[2], ARGV[3], ARGV[4])
                redis.call('SADD', KEYS[3], ARGV[5])
                return 1
                "#,
            ),
            remove_script: Script::new(
                r#"
                redis.call('HDEL', KEYS[1], ARGV[1])
                redis.call('ZREM', KEYS[2], ARGV[2])
                redis.call('SREM', KEYS[3], ARGV[3])
                redis.call('DEL', KEYS[4])
                if redis.call('SCARD', KEYS[3]) == 0 then
                    redis.call('DEL', KEYS[3])
                    redis.call('DEL', KEYS[5])
                    redis.call('DEL', KEYS[6])
                    return 1
                end
                return 0
                "#,
            ),
            pop_script: Script::new(
                r#"
                local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
                if #due > 0 then
                    redis.call('ZREM', KEYS[1], unpack(due))
                end
                return due
                "#,
            ),
            touch_script: Script::new(
                r#"
                local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
                redis.call('HSETNX', KEYS[1], 'first', ARGV[1])
                redis.call('HSET', KEYS[1], 'touched', ARGV[1])
                redis.call('PEXPIRE', KEYS[1], ARGV[2])
                return {count, tonumber(redis.call('HGET', KEYS[1], 'first'))}
                "#,
            ),
        }
    }

    /// Record a job as pending on a device and index it for expiry scanning.
    pub async fn add_pending(&self, key: &PendingKey) -> Result<(), CourierError> {
        let mut redis = self.redis.clone();
        let now = Utc::now().timestamp_millis();
        let expires_at = now + self.pending_ttl.as_millis() as i64;

        let _: i64 = self
            .add_script
            .key(keys::pending(&key.user, &key.device))
            .key(keys::PENDING_INDEX)
            .key(keys::waiting(&key.job_id))
            .arg(&key.job_id)
            .arg(now)
            .arg(expires_at)
            .arg(key.member())
            .arg(keys::device_member(&key.user, &key.device))
            .invoke_async(&mut redis)
            .await?;

        Ok(())
    }

    /// Remove a pending entry everywhere it is tracked. When the last waiting
    /// device resolves, the stored job body and the device's dedup marker are
    /// deleted with it.
    pub async fn remove_pending(&self, key: &PendingKey) -> Result<Resolution, CourierError> {
        let mut redis = self.redis.clone();
        let last: i64 = self
            .remove_script
            .key(keys::pending(&key.user, &key.device))
            .key(keys::PENDING_INDEX)
            .key(keys::waiting(&key.job_id))
            .key(keys::attempts(&key.user, &key.device, &key.job_id))
            .key(keys::job(&key.job_id))
            .key(keys::dedup(&key.job_id, &key.device))
            .arg(&key.job_id)
            .arg(key.member())
            .arg(keys::device_member(&key.user, &key.device))
            .invoke_async(&mut redis)
            .await?;

        Ok(if last == 1 {
            Resolution::LastDevice
        } else {
            Resolution::Remaining
        })
    }

    /// Atomically remove and return up to `limit` expired index entries.
    /// Each entry is observed exactly once per expiry cycle; putting an entry
    /// back is the caller's call via [`reschedule`](Self::reschedule).
    pub async fn pop_expired(&self, limit: usize) -> Result<Vec<PendingKey>, CourierError> {
        let mut redis = self.redis.clone();
        let now = Utc::now().timestamp_millis();

        let members: Vec<String> = self
            .pop_script
            .key(keys::PENDING_INDEX)
            .arg(now)
            .arg(limit)
            .invoke_async(&mut redis)
            .await?;

        Ok(members
            .into_iter()
            .filter_map(|m| {
                let parsed = keys::parse_index_member(&m);
                if parsed.is_none() {
                    tracing::warn!(member = %m, "Dropping unparseable expiry index member");
                }
                parsed.map(|(user, device, job_id)| PendingKey {
                    user,
                    device,
                    job_id,
                })
            })
            .collect())
    }

    /// Put an entry back on the expiry index, due again after `delay`.
    pub async fn reschedule(&self, key: &PendingKey, delay: Duration) -> Result<(), CourierError> {
        let mut redis = self.redis.clone();
        let due_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let _: () = redis.zadd(keys::PENDING_INDEX, key.member(), due_at).await?;
        Ok(())
    }

    /// Enqueue timestamp of a pending entry, or `None` once resolved.
    pub async fn is_pending(&self, key: &PendingKey) -> Result<Option<i64>, CourierError> {
        let mut redis = self.redis.clone();
        let enqueued_at: Option<i64> = redis
            .hget(keys::pending(&key.user, &key.device), &key.job_id)
            .await?;
        Ok(enqueued_at)
    }

    /// All pending jobs for a device, as (jobId, enqueuedAt millis).
    pub async fn pending_jobs(
        &self,
        user: &Uuid,
        device: &str,
    ) -> Result<Vec<(String, i64)>, CourierError> {
        let mut redis = self.redis.clone();
        let entries: Vec<(String, i64)> = redis.hgetall(keys::pending(user, device)).await?;
        Ok(entries)
    }

    /// Record one actual delivery attempt (read-modify-write in one script, so
    /// concurrent sweep and flush attempts cannot double-count).
    pub async fn touch_attempt(&self, key: &PendingKey) -> Result<AttemptRecord, CourierError> {
        let mut redis = self.redis.clone();
        let now = Utc::now().timestamp_millis();

        let (count, first_ms): (u32, i64) = self
            .touch_script
            .key(keys::attempts(&key.user, &key.device, &key.job_id))
            .arg(now)
            .arg(self.attempts_ttl.as_millis() as u64)
            .invoke_async(&mut redis)
            .await?;

        Ok(AttemptRecord {
            count,
            first_ms,
            touched_ms: now,
        })
    }

    /// Read the attempt record without incrementing. `None` before the first
    /// actual attempt.
    pub async fn attempt_record(
        &self,
        key: &PendingKey,
    ) -> Result<Option<AttemptRecord>, CourierError> {
        let mut redis = self.redis.clone();
        let fields: Vec<(String, i64)> = redis
            .hgetall(keys::attempts(&key.user, &key.device, &key.job_id))
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let mut record = AttemptRecord {
            count: 0,
            first_ms: 0,
            touched_ms: 0,
        };
        for (field, value) in fields {
            match field.as_str() {
                "count" => record.count = value as u32,
                "first" => record.first_ms = value,
                "touched" => record.touched_ms = value,
                _ => {}
            }
        }
        Ok(Some(record))
    }
}
