//! Background job queue, one per channel namespace.
//!
//! Two structures per namespace: a delayed zset (envelopes scored by their
//! ready time) and a ready list. A promote script moves due envelopes onto
//! the list; consumers LPOP from it on a poll interval. Failed jobs go back
//! to the delayed zset with exponential backoff until the attempt ceiling,
//! then are dropped — durability here is bounded, the job body TTL is the
//! real horizon.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::{AsyncCommands, Script};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use courier_common::error::CourierError;

use crate::keys;
use crate::processor::Processor;

/// What rides on the queue. The job body itself lives in the job store; the
/// envelope only carries identity and retry state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEnvelope {
    pub job_id: String,
    pub attempt: u32,
    pub enqueued_at: i64,
}

impl QueueEnvelope {
    pub fn first(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            attempt: 0,
            enqueued_at: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    redis: ConnectionManager,
    config: QueueConfig,
    promote_script: Script,
}

impl JobQueue {
    pub fn new(redis: ConnectionManager, config: QueueConfig) -> Self {
        Self {
            redis,
            config,
            promote_script: Script::new(
                r#"
                local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
                for i, member in ipairs(due) do
                    redis.call('RPUSH', KEYS[2], member)
                end
                if #due > 0 then
                    redis.call('ZREM', KEYS[1], unpack(due))
                end
                return #due
                "#,
            ),
        }
    }

    /// Park an envelope, due after `delay` (zero = due immediately, still
    /// routed through the delayed zset so ordering stays by ready time).
    pub async fn enqueue(
        &self,
        namespace: &str,
        envelope: &QueueEnvelope,
        delay: Duration,
    ) -> Result<(), CourierError> {
        let mut redis = self.redis.clone();
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let raw = serde_json::to_string(envelope)?;
        let _: () = redis
            .zadd(keys::queue_delayed(namespace), raw, ready_at)
            .await?;
        Ok(())
    }

    /// Move due envelopes to the ready list; returns how many moved.
    pub async fn promote(&self, namespace: &str, limit: usize) -> Result<usize, CourierError> {
        let mut redis = self.redis.clone();
        let moved: usize = self
            .promote_script
            .key(keys::queue_delayed(namespace))
            .key(keys::queue_ready(namespace))
            .arg(Utc::now().timestamp_millis())
            .arg(limit)
            .invoke_async(&mut redis)
            .await?;
        Ok(moved)
    }

    /// Take one ready envelope, if any.
    pub async fn pop_ready(&self, namespace: &str) -> Result<Option<QueueEnvelope>, CourierError> {
        let mut redis = self.redis.clone();
        let raw: Option<String> = redis.lpop(keys::queue_ready(namespace), None).await?;

        match raw {
            None => Ok(None),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(envelope) => Ok(Some(envelope)),
                Err(e) => {
                    tracing::error!(error = %e, "Dropping undecodable queue envelope");
                    Ok(None)
                }
            },
        }
    }

    /// Re-park a failed envelope with backoff, or drop it at the ceiling.
    pub async fn retry_or_drop(
        &self,
        namespace: &str,
        envelope: &QueueEnvelope,
    ) -> Result<(), CourierError> {
        let next_attempt = envelope.attempt + 1;
        if next_attempt >= self.config.max_attempts {
            tracing::error!(
                job_id = %envelope.job_id,
                attempts = self.config.max_attempts,
                "Queue retries exhausted, dropping job"
            );
            return Ok(());
        }

        let delay = queue_backoff(
            self.config.backoff_base,
            self.config.backoff_cap,
            next_attempt,
        );
        let retried = QueueEnvelope {
            job_id: envelope.job_id.clone(),
            attempt: next_attempt,
            enqueued_at: envelope.enqueued_at,
        };

        tracing::warn!(
            job_id = %retried.job_id,
            attempt = retried.attempt,
            delay_ms = delay.as_millis() as u64,
            "Requeueing failed job"
        );
        self.enqueue(namespace, &retried, delay).await
    }
}

/// Polling consumer for one namespace. Several can run per namespace and
/// across processes — promote and pop are both atomic on the store.
pub struct QueueConsumer {
    queue: JobQueue,
    processor: Arc<Processor>,
    namespace: String,
    poll_interval: Duration,
}

/// Due envelopes moved per promote call; keeps one consumer from monopolizing
/// a deep backlog.
const PROMOTE_LIMIT: usize = 64;

impl QueueConsumer {
    pub fn new(
        queue: JobQueue,
        processor: Arc<Processor>,
        namespace: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            processor,
            namespace: namespace.into(),
            poll_interval,
        }
    }

    /// Run until the task is cancelled.
    pub async fn run(self) {
        tracing::info!(namespace = %self.namespace, "Queue consumer started");
        loop {
            match self.tick().await {
                // Drained one envelope — check for more before sleeping.
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    tracing::error!(namespace = %self.namespace, error = %e, "Consumer tick failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn tick(&self) -> Result<bool, CourierError> {
        self.queue.promote(&self.namespace, PROMOTE_LIMIT).await?;

        let Some(envelope) = self.queue.pop_ready(&self.namespace).await? else {
            return Ok(false);
        };

        if let Err(e) = self.processor.process(&envelope).await {
            tracing::warn!(
                job_id = %envelope.job_id,
                attempt = envelope.attempt,
                error = %e,
                "Job processing failed"
            );
            self.queue.retry_or_drop(&self.namespace, &envelope).await?;
        }
        Ok(true)
    }
}

/// `base * 2^(attempt-1)`, capped.
fn queue_backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ms = (base.as_millis() as u64)
        .saturating_mul(1u64 << exp)
        .min(cap.as_millis() as u64);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_backoff_schedule() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        assert_eq!(queue_backoff(base, cap, 1), Duration::from_secs(1));
        assert_eq!(queue_backoff(base, cap, 2), Duration::from_secs(2));
        assert_eq!(queue_backoff(base, cap, 5), Duration::from_secs(16));
        assert_eq!(queue_backoff(base, cap, 10), Duration::from_secs(60));
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = QueueEnvelope::first("job-1");
        let raw = serde_json::to_string(&envelope).unwrap();
        let back: QueueEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.job_id, "job-1");
        assert_eq!(back.attempt, 0);
    }
}
