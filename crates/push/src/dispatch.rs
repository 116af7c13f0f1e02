//! Batch dispatcher.
//!
//! For each dispatch:
//! 1. Chunk tokens to the provider's per-call limit
//! 2. Send each chunk; a transport failure fails the whole dispatch
//! 3. Classify per-token outcomes
//! 4. Purge permanently invalid tokens from the device directory
//! 5. Park retryable tokens on the Redis-backed retry queue with backoff
//!
//! The retry queue is a delayed zset (`pushretry:delayed`): envelopes scored
//! by their next-attempt time, drained by the worker on a timer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::{AsyncCommands, Script};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use courier_common::error::CourierError;

use crate::directory::{DeviceDirectory, DeviceRecord};
use crate::message::PushMessage;
use crate::provider::{PushProvider, TokenOutcome, TokenStatus};

const RETRY_QUEUE_KEY: &str = "pushretry:delayed";

/// Ceiling on the retry backoff regardless of attempt count.
const RETRY_BACKOFF_CAP_MS: u64 = 300_000;

#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Maximum tokens per provider call.
    pub batch_size: usize,
    /// Token-level retry ceiling; exhausted tokens are dropped with an error log.
    pub max_attempts: u32,
    /// Base delay for the retry backoff.
    pub backoff_base: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
        }
    }
}

/// Outcome of one dispatch, by token.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    pub retrying: Vec<String>,
    pub invalid: Vec<String>,
}

/// A parked batch of transiently-failed tokens.
#[derive(Debug, Serialize, Deserialize)]
struct RetryEnvelope {
    tokens: Vec<String>,
    message: PushMessage,
    attempt: u32,
}

pub struct PushDispatcher {
    provider: Arc<dyn PushProvider>,
    directory: Arc<dyn DeviceDirectory>,
    redis: ConnectionManager,
    config: PushConfig,
    pop_due_script: Script,
}

impl PushDispatcher {
    pub fn new(
        provider: Arc<dyn PushProvider>,
        directory: Arc<dyn DeviceDirectory>,
        redis: ConnectionManager,
        config: PushConfig,
    ) -> Self {
        Self {
            provider,
            directory,
            redis,
            config,
            // Atomically claim due envelopes so concurrent drainers never
            // double-send a batch.
            pop_due_script: Script::new(
                r#"
                local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
                if #due > 0 then
                    redis.call('ZREM', KEYS[1], unpack(due))
                end
                return due
                "#,
            ),
        }
    }

    /// Dispatch one message to a set of device records.
    ///
    /// A transport-level provider failure propagates after zero or more chunks
    /// already went out — the caller decides whether the whole job retries
    /// (completed chunks are protected by per-device dedup markers upstream).
    pub async fn dispatch_to(
        &self,
        records: &[DeviceRecord],
        message: &PushMessage,
    ) -> Result<DispatchReport, CourierError> {
        if records.is_empty() {
            return Ok(DispatchReport::default());
        }

        let tokens: Vec<String> = records.iter().map(|r| r.push_token.clone()).collect();
        let mut outcomes = Vec::with_capacity(tokens.len());

        for chunk in tokens.chunks(self.config.batch_size) {
            outcomes.extend(self.provider.send_to_tokens(chunk, message).await?);
        }

        let report = partition_outcomes(&outcomes);
        self.settle(&report, message, 1).await;

        tracing::debug!(
            delivered = report.delivered.len(),
            retrying = report.retrying.len(),
            invalid = report.invalid.len(),
            "Push dispatch complete"
        );

        Ok(report)
    }

    /// Drain due retry envelopes; returns how many were processed.
    pub async fn drain_retries(&self, limit: usize) -> Result<usize, CourierError> {
        let mut redis = self.redis.clone();
        let now = Utc::now().timestamp_millis();

        let due: Vec<String> = self
            .pop_due_script
            .key(RETRY_QUEUE_KEY)
            .arg(now)
            .arg(limit)
            .invoke_async(&mut redis)
            .await?;

        let count = due.len();
        for raw in due {
            let envelope: RetryEnvelope = match serde_json::from_str(&raw) {
                Ok(e) => e,
                Err(e) => {
                    tracing::error!(error = %e, "Dropping undecodable push retry envelope");
                    continue;
                }
            };
            self.retry_envelope(envelope).await;
        }

        Ok(count)
    }

    async fn retry_envelope(&self, envelope: RetryEnvelope) {
        match self
            .provider
            .send_to_tokens(&envelope.tokens, &envelope.message)
            .await
        {
            Ok(outcomes) => {
                let report = partition_outcomes(&outcomes);
                self.settle(&report, &envelope.message, envelope.attempt + 1)
                    .await;
            }
            Err(e) => {
                // Whole-call transport failure: park the batch again as-is.
                tracing::warn!(
                    attempt = envelope.attempt,
                    error = %e,
                    "Push retry transport failure"
                );
                self.schedule_retry(envelope.tokens, envelope.message.clone(), envelope.attempt + 1)
                    .await;
            }
        }
    }

    /// Apply a report's side effects: purge invalid tokens, park retryable ones.
    async fn settle(&self, report: &DispatchReport, message: &PushMessage, next_attempt: u32) {
        if !report.invalid.is_empty() {
            if let Err(e) = self
                .directory
                .remove_devices_by_tokens(&report.invalid)
                .await
            {
                tracing::error!(error = %e, "Failed to purge invalid push tokens");
            }
        }

        if !report.retrying.is_empty() {
            self.schedule_retry(report.retrying.clone(), message.clone(), next_attempt)
                .await;
        }
    }

    async fn schedule_retry(&self, tokens: Vec<String>, message: PushMessage, attempt: u32) {
        if attempt > self.config.max_attempts {
            tracing::error!(
                tokens = tokens.len(),
                attempts = self.config.max_attempts,
                "Push retries exhausted, dropping tokens"
            );
            return;
        }

        let delay = retry_backoff(self.config.backoff_base, attempt);
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let envelope = RetryEnvelope {
            tokens,
            message,
            attempt,
        };

        let raw = match serde_json::to_string(&envelope) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode push retry envelope");
                return;
            }
        };

        let mut redis = self.redis.clone();
        let parked: Result<(), redis::RedisError> =
            redis.zadd(RETRY_QUEUE_KEY, raw, ready_at).await;
        if let Err(e) = parked {
            tracing::error!(error = %e, "Failed to park push retry envelope");
        }
    }
}

/// Split provider outcomes into delivered / retrying / invalid token lists.
fn partition_outcomes(outcomes: &[TokenOutcome]) -> DispatchReport {
    let mut report = DispatchReport::default();
    for outcome in outcomes {
        match &outcome.status {
            TokenStatus::Delivered => report.delivered.push(outcome.token.clone()),
            TokenStatus::Retryable(code) => {
                tracing::debug!(token = %outcome.token, code = %code, "Transient push failure");
                report.retrying.push(outcome.token.clone());
            }
            TokenStatus::Invalid(code) => {
                tracing::info!(token = %outcome.token, code = %code, "Invalid push token");
                report.invalid.push(outcome.token.clone());
            }
        }
    }
    report
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped.
fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ms = (base.as_millis() as u64)
        .saturating_mul(1u64 << exp)
        .min(RETRY_BACKOFF_CAP_MS);
    Duration::from_millis(ms)
}
