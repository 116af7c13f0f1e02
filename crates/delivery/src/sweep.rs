//! Reconciliation sweep — the long-tail repair loop.
//!
//! On each tick, under a store-wide lock so only one sweep runs fleet-wide:
//! 1. Pop a bounded batch of expired ledger entries
//! 2. Resolve each under the per-entry lock shared with the reconnect flush:
//!    re-check pending, drop stale jobs, skip records the flush touched
//!    moments ago, force-resolve exhausted records with one last push, and
//!    otherwise either confirm (device back online), push (grace elapsed),
//!    or wait (grace still running).
//!
//! Wait cycles reschedule the entry without incrementing its attempt count —
//! only actual delivery attempts count toward the ceiling.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;

use courier_common::error::CourierError;
use courier_common::types::NotificationJob;
use courier_push::{DeviceDirectory, PushDispatcher, PushMessage};

use crate::dedup::DedupStore;
use crate::ledger::{PendingKey, PendingLedger};
use crate::lock::LockManager;
use crate::presence::PresenceRegistry;

const SWEEP_LOCK: &str = "sweep";
const RESOLVE_LOCK_TTL: Duration = Duration::from_secs(10);
const RESOLVE_LOCK_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Tick interval; also the sweep lock TTL.
    pub interval: Duration,
    /// Maximum entries resolved per cycle.
    pub batch: usize,
    /// Entries resolved concurrently within a cycle.
    pub concurrency: usize,
    /// Attempt ceiling before force-resolution.
    pub max_attempts: u32,
    /// Offline grace window before the push fallback fires.
    pub grace: Duration,
}

#[derive(Clone)]
pub struct Sweep {
    ledger: PendingLedger,
    jobs: DedupStore,
    presence: PresenceRegistry,
    locks: LockManager,
    dispatcher: Arc<PushDispatcher>,
    directory: Arc<dyn DeviceDirectory>,
    config: SweepConfig,
}

/// Resolution chosen for one expired entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepAction {
    /// Touched moments ago (live flush in flight) — check back next cycle.
    TooFresh,
    /// Attempt ceiling reached — one final push, then resolve unconditionally.
    Exhausted,
    /// Device is back online; the reconnect flush owns live delivery,
    /// this is just cleanup.
    ResolveOnline,
    /// Offline past the grace window — push and resolve.
    PushAndResolve,
    /// Offline but still inside the grace window — wait, not an attempt.
    WaitGrace,
}

/// Resolution order: freshness, ceiling, presence, grace.
fn decide(
    now_ms: i64,
    online: bool,
    attempt_count: u32,
    max_attempts: u32,
    touched_ms: i64,
    first_pending_ms: i64,
    half_interval_ms: i64,
    grace_ms: i64,
) -> SweepAction {
    if now_ms - touched_ms < half_interval_ms {
        SweepAction::TooFresh
    } else if attempt_count >= max_attempts {
        SweepAction::Exhausted
    } else if online {
        SweepAction::ResolveOnline
    } else if now_ms - first_pending_ms >= grace_ms {
        SweepAction::PushAndResolve
    } else {
        SweepAction::WaitGrace
    }
}

impl Sweep {
    pub fn new(
        ledger: PendingLedger,
        jobs: DedupStore,
        presence: PresenceRegistry,
        locks: LockManager,
        dispatcher: Arc<PushDispatcher>,
        directory: Arc<dyn DeviceDirectory>,
        config: SweepConfig,
    ) -> Self {
        Self {
            ledger,
            jobs,
            presence,
            locks,
            dispatcher,
            directory,
            config,
        }
    }

    /// Tick forever. Run this in its own task per process; the store-wide
    /// lock keeps cycles mutually exclusive across the fleet.
    pub async fn run(self) {
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Reconciliation sweep started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.locks.acquire(SWEEP_LOCK, self.config.interval).await {
                Ok(Some(guard)) => {
                    if let Err(e) = self.cycle().await {
                        tracing::error!(error = %e, "Sweep cycle failed");
                    }
                    if let Err(e) = guard.release().await {
                        tracing::warn!(error = %e, "Sweep lock release failed");
                    }
                }
                Ok(None) => {
                    tracing::debug!("Sweep already running elsewhere, skipping tick");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Sweep lock acquisition failed");
                }
            }
        }
    }

    /// One reconciliation pass over the expiry index. `run` wraps this in the
    /// timer loop under the store-wide lock.
    pub async fn cycle(&self) -> Result<(), CourierError> {
        let entries = self.ledger.pop_expired(self.config.batch).await?;
        if entries.is_empty() {
            return Ok(());
        }
        tracing::debug!(entries = entries.len(), "Sweep cycle resolving entries");

        let mut tasks: JoinSet<()> = JoinSet::new();
        for entry in entries {
            while tasks.len() >= self.config.concurrency {
                tasks.join_next().await;
            }
            let sweep = self.clone();
            tasks.spawn(async move {
                if let Err(e) = sweep.resolve_entry(&entry).await {
                    tracing::warn!(
                        user = %entry.user,
                        device = %entry.device,
                        job_id = %entry.job_id,
                        error = %e,
                        "Sweep resolution failed"
                    );
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn resolve_entry(&self, key: &PendingKey) -> Result<(), CourierError> {
        let lock_name = resolve_lock_name(key);
        let Some(guard) = self
            .locks
            .acquire_waiting(&lock_name, RESOLVE_LOCK_TTL, RESOLVE_LOCK_WAIT)
            .await?
        else {
            // Flush path owns this entry right now; look again next cycle.
            self.ledger.reschedule(key, self.config.interval).await?;
            return Ok(());
        };

        let outcome = self.resolve_locked(key).await;
        if let Err(e) = guard.release().await {
            tracing::warn!(error = %e, "Resolution lock release failed");
        }
        outcome
    }

    async fn resolve_locked(&self, key: &PendingKey) -> Result<(), CourierError> {
        // Re-check: the flush (or another resolution) may have won already.
        let Some(enqueued_at) = self.ledger.is_pending(key).await? else {
            return Ok(());
        };

        let Some(job) = self.jobs.fetch_job(&key.job_id).await? else {
            tracing::warn!(
                job_id = %key.job_id,
                user = %key.user,
                device = %key.device,
                "Stale pending record, job body gone — dropping"
            );
            self.ledger.remove_pending(key).await?;
            return Ok(());
        };

        let attempts = self.ledger.attempt_record(key).await?;
        let attempt_count = attempts.map(|a| a.count).unwrap_or(0);
        let touched_ms = attempts.map(|a| a.touched_ms).unwrap_or(enqueued_at);
        let online = self.presence.handle_for(&key.user, &key.device).await?.is_some();
        let now = Utc::now().timestamp_millis();

        let action = decide(
            now,
            online,
            attempt_count,
            self.config.max_attempts,
            touched_ms,
            enqueued_at,
            self.config.interval.as_millis() as i64 / 2,
            self.config.grace.as_millis() as i64,
        );

        match action {
            SweepAction::TooFresh | SweepAction::WaitGrace => {
                self.ledger.reschedule(key, self.config.interval).await?;
            }
            SweepAction::ResolveOnline => {
                self.ledger.remove_pending(key).await?;
                tracing::debug!(
                    job_id = %key.job_id,
                    device = %key.device,
                    "Device back online, resolved without push"
                );
            }
            SweepAction::Exhausted => {
                tracing::warn!(
                    job_id = %key.job_id,
                    user = %key.user,
                    device = %key.device,
                    attempts = attempt_count,
                    "Attempt ceiling reached, forcing final push"
                );
                if let Err(e) = self.push_single(&job, key).await {
                    tracing::error!(job_id = %key.job_id, error = %e, "Final push failed");
                }
                self.ledger.remove_pending(key).await?;
            }
            SweepAction::PushAndResolve => {
                self.ledger.touch_attempt(key).await?;
                match self.push_single(&job, key).await {
                    Ok(()) => {
                        self.ledger.remove_pending(key).await?;
                    }
                    Err(e) => {
                        // Transient push failure — the attempt counted,
                        // the next cycle tries again up to the ceiling.
                        tracing::warn!(
                            job_id = %key.job_id,
                            error = %e,
                            "Fallback push failed, retrying next cycle"
                        );
                        self.ledger.reschedule(key, self.config.interval).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Push to exactly the pending entry's device. No dedup claim here — the
    /// push completes the delivery the processor already claimed.
    async fn push_single(&self, job: &NotificationJob, key: &PendingKey) -> Result<(), CourierError> {
        let records = self.directory.devices_for_users(&[key.user]).await?;
        let Some(record) = records.into_iter().find(|r| r.device_id == key.device) else {
            tracing::debug!(
                user = %key.user,
                device = %key.device,
                "No push token for device, nothing to send"
            );
            return Ok(());
        };

        let message = PushMessage::from_job(job);
        self.dispatcher.dispatch_to(&[record], &message).await?;
        Ok(())
    }
}

pub(crate) fn resolve_lock_name(key: &PendingKey) -> String {
    format!("resolve:{}:{}:{}", key.user, key.device, key.job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HALF_INTERVAL: i64 = 15_000;
    const GRACE: i64 = 45_000;
    const MAX: u32 = 6;

    fn decide_at(now: i64, online: bool, count: u32, touched: i64, first: i64) -> SweepAction {
        decide(now, online, count, MAX, touched, first, HALF_INTERVAL, GRACE)
    }

    #[test]
    fn test_too_fresh_beats_everything() {
        // Even an exhausted record is skipped while the flush just touched it.
        let action = decide_at(100_000, false, MAX, 90_000, 0);
        assert_eq!(action, SweepAction::TooFresh);
    }

    #[test]
    fn test_exhausted_forces_resolution_regardless_of_presence() {
        let action = decide_at(100_000, true, MAX, 0, 0);
        assert_eq!(action, SweepAction::Exhausted);
    }

    #[test]
    fn test_online_resolves_without_push() {
        let action = decide_at(100_000, true, 2, 0, 0);
        assert_eq!(action, SweepAction::ResolveOnline);
    }

    #[test]
    fn test_offline_past_grace_pushes() {
        let action = decide_at(100_000, false, 2, 0, 100_000 - GRACE);
        assert_eq!(action, SweepAction::PushAndResolve);
    }

    #[test]
    fn test_offline_inside_grace_waits() {
        let action = decide_at(100_000, false, 2, 0, 100_000 - GRACE + 1);
        assert_eq!(action, SweepAction::WaitGrace);
    }

    #[test]
    fn test_wait_paths_never_consume_attempts() {
        // Both non-attempt outcomes are pure waits; the attempt ceiling must
        // be reachable only through PushAndResolve / flush increments.
        assert_eq!(decide_at(100_000, false, 0, 99_999, 0), SweepAction::TooFresh);
        assert_eq!(
            decide_at(100_000, false, 0, 0, 99_000),
            SweepAction::WaitGrace
        );
    }
}
