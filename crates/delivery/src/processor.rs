//! Background processor — executes one queued job per invocation.
//!
//! Strategy dispatch:
//! - `WS_ONLY`: rooms + every online device, nothing else
//! - `PUSH_ONLY`: directory tokens for every recipient, no live emission
//! - `WS_THEN_PUSH`: live first; immediate push only for users with zero
//!   active devices right now. A device that took the frame without
//!   confirming gets a pending-ledger entry instead of a push — "socket
//!   accepted the frame" is not proof of client receipt, the sweep follows up.
//!
//! Per-target live failures are logged and never abort sibling deliveries.
//! Push transport failures propagate so the queue retries the whole job;
//! completed sends stay behind their per-device dedup markers.

use std::sync::Arc;

use uuid::Uuid;

use courier_common::error::CourierError;
use courier_common::types::{DeliveryStrategy, NotificationJob};
use courier_push::{DeviceDirectory, DeviceRecord, PushDispatcher, PushMessage};

use crate::dedup::DedupStore;
use crate::gateway::{LivePublisher, job_frame_payload};
use crate::ledger::{PendingKey, PendingLedger};
use crate::presence::PresenceRegistry;
use crate::queue::QueueEnvelope;

pub struct Processor {
    presence: PresenceRegistry,
    jobs: DedupStore,
    ledger: PendingLedger,
    publisher: Arc<dyn LivePublisher>,
    dispatcher: Arc<PushDispatcher>,
    directory: Arc<dyn DeviceDirectory>,
}

impl Processor {
    pub fn new(
        presence: PresenceRegistry,
        jobs: DedupStore,
        ledger: PendingLedger,
        publisher: Arc<dyn LivePublisher>,
        dispatcher: Arc<PushDispatcher>,
        directory: Arc<dyn DeviceDirectory>,
    ) -> Self {
        Self {
            presence,
            jobs,
            ledger,
            publisher,
            dispatcher,
            directory,
        }
    }

    /// Process one queued envelope. An `Err` sends the whole job back through
    /// the queue's retry/backoff.
    pub async fn process(&self, envelope: &QueueEnvelope) -> Result<(), CourierError> {
        let Some(job) = self.jobs.fetch_job(&envelope.job_id).await? else {
            tracing::warn!(job_id = %envelope.job_id, "Queued job unavailable, skipping");
            return Ok(());
        };

        tracing::debug!(
            job_id = %job.job_id,
            event = %job.event,
            strategy = ?job.strategy,
            attempt = envelope.attempt,
            "Processing job"
        );

        match job.strategy {
            DeliveryStrategy::WsOnly => self.deliver_ws_only(&job).await,
            DeliveryStrategy::PushOnly => self.deliver_push_only(&job).await,
            DeliveryStrategy::WsThenPush => self.deliver_ws_then_push(&job).await,
        }
    }

    async fn deliver_ws_only(&self, job: &NotificationJob) -> Result<(), CourierError> {
        self.broadcast_rooms(job).await;

        for user in &job.recipients {
            let devices = self.presence.active_devices(user).await?;
            if devices.is_empty() {
                continue;
            }
            let claimed = self.jobs.try_claim(&job.job_id, &devices).await?;
            for device in &claimed {
                self.emit_live(job, user, device, false).await;
            }
        }
        Ok(())
    }

    async fn deliver_push_only(&self, job: &NotificationJob) -> Result<(), CourierError> {
        let recipients: Vec<Uuid> = job.recipients.iter().copied().collect();
        let records = self.directory.devices_for_users(&recipients).await?;
        self.push_claimed(job, records).await
    }

    async fn deliver_ws_then_push(&self, job: &NotificationJob) -> Result<(), CourierError> {
        self.broadcast_rooms(job).await;

        let mut offline_users = Vec::new();
        for user in &job.recipients {
            let devices = self.presence.active_devices(user).await?;
            if devices.is_empty() {
                offline_users.push(*user);
                continue;
            }
            let claimed = self.jobs.try_claim(&job.job_id, &devices).await?;
            for device in &claimed {
                self.emit_live(job, user, device, true).await;
            }
        }

        if offline_users.is_empty() {
            return Ok(());
        }
        let records = self.directory.devices_for_users(&offline_users).await?;
        self.push_claimed(job, records).await
    }

    /// Emit to one device; with `track`, an unconfirmed emission becomes a
    /// pending-ledger entry for the sweep. Never fails the job.
    async fn emit_live(&self, job: &NotificationJob, user: &Uuid, device: &str, track: bool) {
        let namespace = &job.channel_target.namespace;
        let event = job.event.to_string();
        let payload = job_frame_payload(job);

        let confirmed = match self.presence.handle_for(user, device).await {
            Ok(Some(conn_id)) => {
                match self
                    .publisher
                    .emit_to_device(namespace, &conn_id, &event, &payload)
                    .await
                {
                    Ok(confirmed) => confirmed,
                    Err(e) => {
                        tracing::warn!(
                            user = %user,
                            device,
                            job_id = %job.job_id,
                            error = %e,
                            "Live emission failed"
                        );
                        false
                    }
                }
            }
            // Device dropped between the presence listing and the emit.
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(user = %user, device, error = %e, "Presence lookup failed");
                false
            }
        };

        if track && !confirmed {
            let key = PendingKey::new(*user, device, &job.job_id);
            if let Err(e) = self.ledger.add_pending(&key).await {
                tracing::error!(
                    user = %user,
                    device,
                    job_id = %job.job_id,
                    error = %e,
                    "Failed to record pending delivery"
                );
            }
        }
    }

    /// Claim per-device dedup markers for the records, push the claimed
    /// subset. A transport failure releases this batch's claims before
    /// propagating, so the queue retry can claim again.
    async fn push_claimed(
        &self,
        job: &NotificationJob,
        records: Vec<DeviceRecord>,
    ) -> Result<(), CourierError> {
        if records.is_empty() {
            return Ok(());
        }

        let targets: Vec<String> = records.iter().map(|r| r.device_id.clone()).collect();
        let claimed = self.jobs.try_claim(&job.job_id, &targets).await?;
        let to_push: Vec<DeviceRecord> = records
            .into_iter()
            .filter(|r| claimed.contains(&r.device_id))
            .collect();
        if to_push.is_empty() {
            return Ok(());
        }

        let message = PushMessage::from_job(job);
        match self.dispatcher.dispatch_to(&to_push, &message).await {
            Ok(report) => {
                tracing::info!(
                    job_id = %job.job_id,
                    delivered = report.delivered.len(),
                    retrying = report.retrying.len(),
                    invalid = report.invalid.len(),
                    "Push batch dispatched"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(release_err) = self.jobs.release(&job.job_id, &claimed).await {
                    tracing::error!(
                        job_id = %job.job_id,
                        error = %release_err,
                        "Failed to release dedup claims after transport failure"
                    );
                }
                Err(e)
            }
        }
    }

    async fn broadcast_rooms(&self, job: &NotificationJob) {
        let event = job.event.to_string();
        let payload = job_frame_payload(job);
        for room in &job.channel_target.room_ids {
            if let Err(e) = self
                .publisher
                .emit_to_room(&job.channel_target.namespace, room, &event, &payload)
                .await
            {
                tracing::warn!(room = %room, job_id = %job.job_id, error = %e, "Room broadcast failed");
            }
        }
    }
}
