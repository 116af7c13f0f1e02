//! Live-channel seam.
//!
//! The socket tier is an external collaborator; delivery only needs "emit
//! this frame to that connection or room, tell me if the client acked".
//! `RedisLivePublisher` is the detached-worker implementation: frames go out
//! over Redis pub/sub for socket hosts to fan out, so device emissions are
//! never confirmed and the pending ledger carries the delivery guarantee. An
//! embedded socket host can implement the trait with a real ack instead.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_common::error::CourierError;
use courier_common::types::NotificationJob;

/// Payload of the frame a client receives for a job. Carries the job id so
/// the client can ack and deduplicate against a later push for the same job.
pub fn job_frame_payload(job: &NotificationJob) -> serde_json::Value {
    serde_json::json!({
        "job_id": job.job_id,
        "event": job.event,
        "title": job.payload.title,
        "body": job.payload.body,
        "icon": job.payload.icon,
        "data": job.payload.data,
    })
}

/// One frame for the socket tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveFrame {
    pub target: FrameTarget,
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameTarget {
    Connection { conn_id: String },
    Room { room: String },
}

#[async_trait]
pub trait LivePublisher: Send + Sync {
    /// Emit to one connection. `Ok(true)` means the client acknowledged
    /// receipt; `Ok(false)` means the frame was sent (or forwarded) without
    /// confirmation.
    async fn emit_to_device(
        &self,
        namespace: &str,
        conn_id: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<bool, CourierError>;

    /// Broadcast to a room. Best effort, never confirmed.
    async fn emit_to_room(
        &self,
        namespace: &str,
        room: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), CourierError>;

    /// Presence transition event for the messaging layer.
    async fn publish_presence(&self, user: &Uuid, online: bool) -> Result<(), CourierError>;
}

/// Pub/sub fan-out publisher for detached worker processes.
#[derive(Clone)]
pub struct RedisLivePublisher {
    redis: ConnectionManager,
}

impl RedisLivePublisher {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    async fn publish(&self, channel: String, frame: &LiveFrame) -> Result<(), CourierError> {
        let mut redis = self.redis.clone();
        let raw = serde_json::to_string(frame)?;
        let _: () = redis.publish(channel, raw).await?;
        Ok(())
    }
}

#[async_trait]
impl LivePublisher for RedisLivePublisher {
    async fn emit_to_device(
        &self,
        namespace: &str,
        conn_id: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<bool, CourierError> {
        let frame = LiveFrame {
            target: FrameTarget::Connection {
                conn_id: conn_id.to_string(),
            },
            event: event.to_string(),
            payload: payload.clone(),
        };
        self.publish(format!("live:{namespace}"), &frame).await?;
        // Pub/sub cannot observe the client ack.
        Ok(false)
    }

    async fn emit_to_room(
        &self,
        namespace: &str,
        room: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), CourierError> {
        let frame = LiveFrame {
            target: FrameTarget::Room {
                room: room.to_string(),
            },
            event: event.to_string(),
            payload: payload.clone(),
        };
        self.publish(format!("live:{namespace}"), &frame).await
    }

    async fn publish_presence(&self, user: &Uuid, online: bool) -> Result<(), CourierError> {
        let event = if online {
            "presence:online"
        } else {
            "presence:offline"
        };
        let frame = LiveFrame {
            target: FrameTarget::Room {
                room: format!("user:{user}"),
            },
            event: event.to_string(),
            payload: serde_json::json!({ "user_id": user }),
        };
        self.publish("live:presence".to_string(), &frame).await
    }
}
