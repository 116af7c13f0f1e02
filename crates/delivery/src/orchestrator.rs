//! Delivery orchestrator — the single inbound API for domain collaborators.
//!
//! `submit` never delivers anything itself:
//! 1. Drop jobs with no targets at all
//! 2. Filter recipients muted for the job's event kind
//! 3. Arbitrate room broadcast vs per-user delivery
//! 4. Claim the job-level dedup marker (duplicates drop silently)
//! 5. Persist the job body under its TTL
//! 6. Park an envelope on the namespace queue, honoring the caller's delay
//!
//! Delivery outcome is deliberately not observable here — callers only learn
//! whether the job was accepted, deduplicated away, or had no targets.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use uuid::Uuid;

use courier_common::error::CourierError;
use courier_common::types::{EventKind, NotificationJob};

use crate::dedup::{DedupStore, GLOBAL_TARGET};
use crate::mutes::MuteStore;
use crate::queue::{JobQueue, QueueEnvelope};

/// What became of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    /// Same `job_id` was already submitted within the dedup TTL window.
    Duplicate,
    /// No recipients and no rooms (possibly after mute filtering).
    NoTargets,
}

pub struct Orchestrator {
    dedup: DedupStore,
    mutes: MuteStore,
    queue: JobQueue,
}

impl Orchestrator {
    pub fn new(dedup: DedupStore, mutes: MuteStore, queue: JobQueue) -> Self {
        Self {
            dedup,
            mutes,
            queue,
        }
    }

    pub async fn submit(
        &self,
        mut job: NotificationJob,
        delay: Duration,
    ) -> Result<Submission, CourierError> {
        if job.recipients.is_empty() && job.channel_target.room_ids.is_empty() {
            return Ok(Submission::NoTargets);
        }

        let had_recipients = !job.recipients.is_empty();
        let mut muted_by_user = BTreeMap::new();
        for user in &job.recipients {
            muted_by_user.insert(*user, self.mutes.muted_kinds(user).await?);
        }
        let kept = filter_muted(&job.recipients, job.event, &muted_by_user);
        if kept.len() < job.recipients.len() {
            tracing::debug!(
                job_id = %job.job_id,
                event = %job.event,
                muted = job.recipients.len() - kept.len(),
                "Filtered muted recipients"
            );
        }
        job.recipients = kept;

        apply_target_priority(&mut job, had_recipients);

        if job.recipients.is_empty() && job.channel_target.room_ids.is_empty() {
            return Ok(Submission::NoTargets);
        }

        let claimed = self
            .dedup
            .try_claim(&job.job_id, &[GLOBAL_TARGET.to_string()])
            .await?;
        if claimed.is_empty() {
            tracing::debug!(job_id = %job.job_id, "Duplicate submission, dropping");
            return Ok(Submission::Duplicate);
        }

        self.dedup.store_job(&job).await?;

        let envelope = QueueEnvelope::first(&job.job_id);
        self.queue
            .enqueue(&job.channel_target.namespace, &envelope, delay)
            .await?;

        tracing::info!(
            job_id = %job.job_id,
            event = %job.event,
            recipients = job.recipients.len(),
            rooms = job.channel_target.room_ids.len(),
            delay_ms = delay.as_millis() as u64,
            "Job accepted"
        );
        Ok(Submission::Accepted)
    }
}

/// Arbitrate room broadcast against per-user delivery when a job requests
/// both. Per-user delivery wins while recipients remain; when mute filtering
/// (or the caller) left none, the room broadcast carries the job alone.
fn apply_target_priority(job: &mut NotificationJob, had_recipients: bool) {
    if !had_recipients || job.channel_target.room_ids.is_empty() {
        return;
    }
    if job.recipients.is_empty() {
        // Room-only from here on; nothing to do, recipients are already gone.
        return;
    }
    job.channel_target.room_ids.clear();
}

/// Recipients not muted for `event`, given each user's muted kinds.
fn filter_muted(
    recipients: &BTreeSet<Uuid>,
    event: EventKind,
    muted_by_user: &BTreeMap<Uuid, BTreeSet<EventKind>>,
) -> BTreeSet<Uuid> {
    recipients
        .iter()
        .filter(|user| {
            muted_by_user
                .get(*user)
                .is_none_or(|kinds| !kinds.contains(&event))
        })
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::types::DeliveryStrategy;

    fn job_with(recipients: usize, rooms: usize) -> NotificationJob {
        let users: Vec<Uuid> = (0..recipients).map(|_| Uuid::new_v4()).collect();
        let mut job = NotificationJob::new(
            "job-1",
            users,
            EventKind::FollowNew,
            DeliveryStrategy::WsThenPush,
        );
        job.channel_target.room_ids = (0..rooms).map(|i| format!("room-{i}")).collect();
        job
    }

    #[test]
    fn test_user_delivery_wins_over_rooms() {
        let mut job = job_with(2, 1);
        apply_target_priority(&mut job, true);
        assert_eq!(job.recipients.len(), 2);
        assert!(job.channel_target.room_ids.is_empty());
    }

    #[test]
    fn test_rooms_survive_when_all_recipients_muted_away() {
        let mut job = job_with(0, 2);
        // Had recipients originally, mute filtering removed them all.
        apply_target_priority(&mut job, true);
        assert_eq!(job.channel_target.room_ids.len(), 2);
    }

    #[test]
    fn test_room_only_job_untouched() {
        let mut job = job_with(0, 1);
        apply_target_priority(&mut job, false);
        assert_eq!(job.channel_target.room_ids.len(), 1);
    }

    #[test]
    fn test_filter_muted_removes_only_matching_kind() {
        let muted_user = Uuid::new_v4();
        let free_user = Uuid::new_v4();
        let recipients: BTreeSet<Uuid> = [muted_user, free_user].into_iter().collect();
        let muted_by_user: BTreeMap<Uuid, BTreeSet<EventKind>> =
            [(muted_user, [EventKind::StoryNew].into_iter().collect())]
                .into_iter()
                .collect();

        let filtered = filter_muted(&recipients, EventKind::StoryNew, &muted_by_user);
        assert!(!filtered.contains(&muted_user));
        assert!(filtered.contains(&free_user));

        // Other kinds still reach the muted user.
        let filtered = filter_muted(&recipients, EventKind::ChatMessage, &muted_by_user);
        assert!(filtered.contains(&muted_user));
    }
}
