//! Dedup markers and the serialized job store.
//!
//! A marker is `SET dedup:{job}:{target} 1 NX PX ttl` — the first successful
//! creation authorizes delivery to that target, later attempts are no-ops.
//! `try_claim` runs every target in one script so a call costs one round trip;
//! each target claims independently (partial claims are expected).

use std::time::Duration;

use redis::{AsyncCommands, Script};
use redis::aio::ConnectionManager;

use courier_common::error::CourierError;
use courier_common::types::NotificationJob;

use crate::keys;

/// Synthetic target for job-level dedup at submission time.
pub const GLOBAL_TARGET: &str = "global";

#[derive(Clone)]
pub struct DedupStore {
    redis: ConnectionManager,
    claim_script: Script,
    dedup_ttl: Duration,
    job_ttl: Duration,
}

impl DedupStore {
    pub fn new(redis: ConnectionManager, dedup_ttl: Duration, job_ttl: Duration) -> Self {
        Self {
            redis,
            claim_script: Script::new(
                r#"
                local claimed = {}
                for i, key in ipairs(KEYS) do
                    if redis.call('SET', key, '1', 'NX', 'PX', ARGV[1]) then
                        claimed[#claimed + 1] = i
                    end
                end
                return claimed
                "#,
            ),
            dedup_ttl,
            job_ttl,
        }
    }

    /// Claim markers for the given targets; returns only the subset that was
    /// newly claimed. An empty return means every target was a duplicate.
    pub async fn try_claim(
        &self,
        job_id: &str,
        targets: &[String],
    ) -> Result<Vec<String>, CourierError> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let mut redis = self.redis.clone();
        let mut invocation = self.claim_script.prepare_invoke();
        for target in targets {
            invocation.key(keys::dedup(job_id, target));
        }
        invocation.arg(self.dedup_ttl.as_millis() as u64);

        let claimed_indexes: Vec<usize> = invocation.invoke_async(&mut redis).await?;

        Ok(claimed_indexes
            .into_iter()
            .filter_map(|i| targets.get(i - 1).cloned())
            .collect())
    }

    /// Roll back claims, e.g. when a push transport call failed before any
    /// token was handed to the provider's delivery pipeline.
    pub async fn release(&self, job_id: &str, targets: &[String]) -> Result<(), CourierError> {
        if targets.is_empty() {
            return Ok(());
        }
        let mut redis = self.redis.clone();
        let marker_keys: Vec<String> = targets.iter().map(|t| keys::dedup(job_id, t)).collect();
        let _: () = redis.del(marker_keys).await?;
        Ok(())
    }

    /// Persist the job body under its TTL.
    pub async fn store_job(&self, job: &NotificationJob) -> Result<(), CourierError> {
        let mut redis = self.redis.clone();
        let body = serde_json::to_string(job)?;
        let _: () = redis
            .set_ex(keys::job(&job.job_id), body, self.job_ttl.as_secs())
            .await?;
        Ok(())
    }

    /// Fetch a stored job. A missing or undecodable body is "job unavailable"
    /// — the caller drops the associated pending record rather than retrying
    /// forever.
    pub async fn fetch_job(&self, job_id: &str) -> Result<Option<NotificationJob>, CourierError> {
        let mut redis = self.redis.clone();
        let body: Option<String> = redis.get(keys::job(job_id)).await?;

        match body {
            None => Ok(None),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(job) => Ok(Some(job)),
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "Stored job body undecodable, treating as missing");
                    Ok(None)
                }
            },
        }
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<(), CourierError> {
        let mut redis = self.redis.clone();
        let _: () = redis.del(keys::job(job_id)).await?;
        Ok(())
    }
}
