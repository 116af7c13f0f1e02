use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Domain event kinds that can trigger a notification.
///
/// The wire form uses `category:action` names (e.g. `follow:new`) — these are
/// the event names emitted on the live channel and stored in mute sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    // Social graph
    #[serde(rename = "follow:new")]
    FollowNew,
    #[serde(rename = "follow:accepted")]
    FollowAccepted,

    // Rides
    #[serde(rename = "ride:requested")]
    RideRequested,
    #[serde(rename = "ride:status")]
    RideStatus,
    #[serde(rename = "ride:arrived")]
    RideArrived,

    // Chat
    #[serde(rename = "chat:message")]
    ChatMessage,

    // Stories
    #[serde(rename = "story:new")]
    StoryNew,
    #[serde(rename = "story:reaction")]
    StoryReaction,
}

impl EventKind {
    pub const ALL: &[EventKind] = &[
        EventKind::FollowNew,
        EventKind::FollowAccepted,
        EventKind::RideRequested,
        EventKind::RideStatus,
        EventKind::RideArrived,
        EventKind::ChatMessage,
        EventKind::StoryNew,
        EventKind::StoryReaction,
    ];

    /// Push priority for this event kind. Ride and chat events are
    /// time-sensitive and delivered at high priority; the rest ride normal.
    pub fn push_priority(&self) -> PushPriority {
        match self {
            EventKind::RideRequested
            | EventKind::RideStatus
            | EventKind::RideArrived
            | EventKind::ChatMessage => PushPriority::High,
            EventKind::FollowNew
            | EventKind::FollowAccepted
            | EventKind::StoryNew
            | EventKind::StoryReaction => PushPriority::Normal,
        }
    }

    /// Collapse key grouping for the push provider — later pushes in the same
    /// group may replace earlier undelivered ones on the device.
    pub fn collapse_key(&self) -> &'static str {
        match self {
            EventKind::FollowNew | EventKind::FollowAccepted => "follow",
            EventKind::RideRequested | EventKind::RideStatus | EventKind::RideArrived => "ride",
            EventKind::ChatMessage => "chat",
            EventKind::StoryNew | EventKind::StoryReaction => "story",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::FollowNew => write!(f, "follow:new"),
            EventKind::FollowAccepted => write!(f, "follow:accepted"),
            EventKind::RideRequested => write!(f, "ride:requested"),
            EventKind::RideStatus => write!(f, "ride:status"),
            EventKind::RideArrived => write!(f, "ride:arrived"),
            EventKind::ChatMessage => write!(f, "chat:message"),
            EventKind::StoryNew => write!(f, "story:new"),
            EventKind::StoryReaction => write!(f, "story:reaction"),
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "follow:new" => Ok(EventKind::FollowNew),
            "follow:accepted" => Ok(EventKind::FollowAccepted),
            "ride:requested" => Ok(EventKind::RideRequested),
            "ride:status" => Ok(EventKind::RideStatus),
            "ride:arrived" => Ok(EventKind::RideArrived),
            "chat:message" => Ok(EventKind::ChatMessage),
            "story:new" => Ok(EventKind::StoryNew),
            "story:reaction" => Ok(EventKind::StoryReaction),
            other => Err(format!("unknown event kind '{other}'")),
        }
    }
}

/// Push delivery priority, mapped from `EventKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPriority {
    Normal,
    High,
}

/// Channel strategy for a notification job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStrategy {
    /// Live channel only — no push, no pending bookkeeping.
    WsOnly,
    /// Push only — device tokens resolved via the directory.
    PushOnly,
    /// Live first; immediate push only for recipients with zero active
    /// devices, the sweep covering unconfirmed live emissions.
    WsThenPush,
}

/// Where a job is emitted on the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTarget {
    /// Queue/channel namespace the job is processed under.
    pub namespace: String,
    /// Rooms to broadcast to, in addition to (or instead of) per-user delivery.
    #[serde(default)]
    pub room_ids: Vec<String>,
}

impl Default for ChannelTarget {
    fn default() -> Self {
        Self {
            namespace: "notifications".to_string(),
            room_ids: Vec::new(),
        }
    }
}

/// User-visible notification content plus free-form data entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// A logical notification to deliver to a set of users.
///
/// Immutable once stored; the serialized copy lives in the shared store under
/// a TTL and is purged at expiry regardless of delivery state. `job_id` is
/// caller-supplied and globally unique per logical event — it is the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationJob {
    pub job_id: String,
    pub recipients: BTreeSet<Uuid>,
    pub event: EventKind,
    #[serde(default)]
    pub channel_target: ChannelTarget,
    #[serde(default)]
    pub payload: JobPayload,
    pub strategy: DeliveryStrategy,
    pub created_at: DateTime<Utc>,
}

impl NotificationJob {
    pub fn new(
        job_id: impl Into<String>,
        recipients: impl IntoIterator<Item = Uuid>,
        event: EventKind,
        strategy: DeliveryStrategy,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            recipients: recipients.into_iter().collect(),
            event,
            channel_target: ChannelTarget::default(),
            payload: JobPayload::default(),
            strategy,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_wire_roundtrip() {
        for kind in EventKind::ALL {
            let wire = kind.to_string();
            assert_eq!(wire.parse::<EventKind>().unwrap(), *kind);
        }
    }

    #[test]
    fn test_event_kind_serde_uses_wire_names() {
        let json = serde_json::to_string(&EventKind::FollowNew).unwrap();
        assert_eq!(json, "\"follow:new\"");
        let back: EventKind = serde_json::from_str("\"ride:status\"").unwrap();
        assert_eq!(back, EventKind::RideStatus);
    }

    #[test]
    fn test_push_priority_map() {
        assert_eq!(EventKind::RideArrived.push_priority(), PushPriority::High);
        assert_eq!(EventKind::ChatMessage.push_priority(), PushPriority::High);
        assert_eq!(EventKind::FollowNew.push_priority(), PushPriority::Normal);
        assert_eq!(EventKind::StoryNew.push_priority(), PushPriority::Normal);
    }

    #[test]
    fn test_strategy_wire_form() {
        let json = serde_json::to_string(&DeliveryStrategy::WsThenPush).unwrap();
        assert_eq!(json, "\"WS_THEN_PUSH\"");
    }

    #[test]
    fn test_job_roundtrip() {
        let user = Uuid::new_v4();
        let mut job = NotificationJob::new("evt-1", [user], EventKind::ChatMessage, DeliveryStrategy::WsThenPush);
        job.payload.title = Some("New message".to_string());
        job.payload.data.insert("thread".to_string(), "t-9".to_string());
        job.channel_target.room_ids.push("room-1".to_string());

        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: NotificationJob = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.job_id, "evt-1");
        assert!(decoded.recipients.contains(&user));
        assert_eq!(decoded.event, EventKind::ChatMessage);
        assert_eq!(decoded.payload.data["thread"], "t-9");
    }
}
