use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use courier_common::types::{NotificationJob, PushPriority};

/// Provider-facing message, built once per job and shared by every batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub data: BTreeMap<String, String>,
    pub priority: PushPriority,
    pub collapse_key: String,
}

impl PushMessage {
    /// Build the push representation of a job.
    ///
    /// The job id and event name ride along in `data` so the client can
    /// deduplicate against frames it already received on the live channel.
    pub fn from_job(job: &NotificationJob) -> Self {
        let mut data = job.payload.data.clone();
        data.insert("job_id".to_string(), job.job_id.clone());
        data.insert("event".to_string(), job.event.to_string());

        Self {
            title: job.payload.title.clone(),
            body: job.payload.body.clone(),
            icon: job.payload.icon.clone(),
            data,
            priority: job.event.push_priority(),
            collapse_key: job.event.collapse_key().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::types::{DeliveryStrategy, EventKind};
    use uuid::Uuid;

    #[test]
    fn test_from_job_carries_identity_in_data() {
        let mut job = NotificationJob::new(
            "job-7",
            [Uuid::new_v4()],
            EventKind::ChatMessage,
            DeliveryStrategy::WsThenPush,
        );
        job.payload.title = Some("New message".to_string());
        job.payload.data.insert("thread".to_string(), "t-1".to_string());

        let msg = PushMessage::from_job(&job);
        assert_eq!(msg.data["job_id"], "job-7");
        assert_eq!(msg.data["event"], "chat:message");
        assert_eq!(msg.data["thread"], "t-1");
        assert_eq!(msg.priority, PushPriority::High);
        assert_eq!(msg.collapse_key, "chat");
    }

    #[test]
    fn test_from_job_normal_priority_for_stories() {
        let job = NotificationJob::new(
            "job-8",
            [Uuid::new_v4()],
            EventKind::StoryNew,
            DeliveryStrategy::PushOnly,
        );
        let msg = PushMessage::from_job(&job);
        assert_eq!(msg.priority, PushPriority::Normal);
        assert_eq!(msg.collapse_key, "story");
    }
}
