//! Connection lifecycle — the socket tier calls in here.
//!
//! On (re)connect: register presence under the per-user lock, announce the
//! 0→1 online transition, then — outside the lock — drain the device's
//! pending ledger over the fresh connection. On disconnect: grace-delayed
//! conditional presence removal, so a quick reconnect never flaps the
//! user's online state.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use courier_common::error::CourierError;

use crate::dedup::DedupStore;
use crate::gateway::{LivePublisher, job_frame_payload};
use crate::ledger::{PendingKey, PendingLedger, Resolution};
use crate::lock::LockManager;
use crate::presence::{PresenceRegistry, PresenceTransition};
use crate::sweep::resolve_lock_name;

const PRESENCE_LOCK_TTL: Duration = Duration::from_secs(5);
const PRESENCE_LOCK_WAIT: Duration = Duration::from_secs(3);
const RESOLVE_LOCK_TTL: Duration = Duration::from_secs(10);
const RESOLVE_LOCK_WAIT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct ConnectionLifecycle {
    presence: PresenceRegistry,
    ledger: PendingLedger,
    jobs: DedupStore,
    locks: LockManager,
    publisher: Arc<dyn LivePublisher>,
    presence_grace: Duration,
}

impl ConnectionLifecycle {
    pub fn new(
        presence: PresenceRegistry,
        ledger: PendingLedger,
        jobs: DedupStore,
        locks: LockManager,
        publisher: Arc<dyn LivePublisher>,
        presence_grace: Duration,
    ) -> Self {
        Self {
            presence,
            ledger,
            jobs,
            locks,
            publisher,
            presence_grace,
        }
    }

    /// Register a device's connection and flush its pending deliveries.
    /// Call before accepting further traffic from the connection.
    pub async fn on_connect(
        &self,
        user: Uuid,
        device: &str,
        conn_id: &str,
    ) -> Result<(), CourierError> {
        let lock_name = format!("presence:{user}");
        let guard = self
            .locks
            .acquire_waiting(&lock_name, PRESENCE_LOCK_TTL, PRESENCE_LOCK_WAIT)
            .await?;
        if guard.is_none() {
            // Registration itself is atomic; proceed rather than refuse the
            // connection, at the cost of a possibly duplicated online event.
            tracing::warn!(user = %user, "Presence lock unavailable on connect");
        }

        let transition = self.presence.add_connection(&user, device, conn_id).await;
        if let Some(guard) = guard {
            if let Err(e) = guard.release().await {
                tracing::warn!(error = %e, "Presence lock release failed");
            }
        }

        if transition? == PresenceTransition::CameOnline {
            if let Err(e) = self.publisher.publish_presence(&user, true).await {
                tracing::warn!(user = %user, error = %e, "Online event publish failed");
            }
        }

        tracing::debug!(user = %user, device, conn_id, "Device connected");
        self.flush_pending(user, device, conn_id).await
    }

    /// Schedule grace-delayed removal of the device's presence entry. The
    /// removal is conditional on the connection id, so a reconnect that
    /// already registered a newer handle wins.
    pub fn on_disconnect(&self, user: Uuid, device: String, conn_id: String) {
        let lifecycle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(lifecycle.presence_grace).await;
            match lifecycle
                .presence
                .remove_connection(&user, &device, &conn_id)
                .await
            {
                Ok(PresenceTransition::WentOffline) => {
                    if let Err(e) = lifecycle.publisher.publish_presence(&user, false).await {
                        tracing::warn!(user = %user, error = %e, "Offline event publish failed");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(user = %user, device, error = %e, "Presence removal failed");
                }
            }
        });
    }

    /// Drain the device's pending ledger over a fresh connection.
    async fn flush_pending(
        &self,
        user: Uuid,
        device: &str,
        conn_id: &str,
    ) -> Result<(), CourierError> {
        let entries = self.ledger.pending_jobs(&user, device).await?;
        if entries.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            user = %user,
            device,
            pending = entries.len(),
            "Flushing pending deliveries on reconnect"
        );

        for (job_id, _enqueued_at) in entries {
            let key = PendingKey::new(user, device, &job_id);
            let lock_name = resolve_lock_name(&key);
            let Some(guard) = self
                .locks
                .acquire_waiting(&lock_name, RESOLVE_LOCK_TTL, RESOLVE_LOCK_WAIT)
                .await?
            else {
                tracing::debug!(job_id = %job_id, "Resolution lock busy, leaving entry to the sweep");
                continue;
            };

            if let Err(e) = self.flush_one(&key, conn_id).await {
                tracing::warn!(job_id = %key.job_id, error = %e, "Pending flush failed");
            }
            if let Err(e) = guard.release().await {
                tracing::warn!(error = %e, "Resolution lock release failed");
            }
        }
        Ok(())
    }

    async fn flush_one(&self, key: &PendingKey, conn_id: &str) -> Result<(), CourierError> {
        // The sweep may have resolved it between listing and locking.
        if self.ledger.is_pending(key).await?.is_none() {
            return Ok(());
        }

        let Some(job) = self.jobs.fetch_job(&key.job_id).await? else {
            // Job body already purged — the record is stale, just clear it.
            tracing::warn!(job_id = %key.job_id, "Pending job purged, clearing stale record");
            self.ledger.remove_pending(key).await?;
            return Ok(());
        };

        let attempt = self.ledger.touch_attempt(key).await?;
        let confirmed = self
            .publisher
            .emit_to_device(
                &job.channel_target.namespace,
                conn_id,
                &job.event.to_string(),
                &job_frame_payload(&job),
            )
            .await?;

        if confirmed {
            let resolution = self.ledger.remove_pending(key).await?;
            tracing::debug!(
                job_id = %key.job_id,
                attempt = attempt.count,
                last_device = resolution == Resolution::LastDevice,
                "Pending delivery flushed live"
            );
        }
        // Unconfirmed: the record stays, the sweep follows up.
        Ok(())
    }
}
