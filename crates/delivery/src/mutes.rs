//! Per-user mute sets.
//!
//! `mute:{user}` is a hash of event kind → expiry millis (0 = muted until
//! unmuted). Read at submission time only; entries found expired on read are
//! deleted in passing.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use courier_common::error::CourierError;
use courier_common::types::EventKind;

use crate::keys;

#[derive(Clone)]
pub struct MuteStore {
    redis: ConnectionManager,
}

impl MuteStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Event kinds this user has muted right now.
    pub async fn muted_kinds(&self, user: &Uuid) -> Result<BTreeSet<EventKind>, CourierError> {
        let mut redis = self.redis.clone();
        let key = keys::mute(user);
        let entries: Vec<(String, i64)> = redis.hgetall(&key).await?;

        let now = Utc::now().timestamp_millis();
        let mut muted = BTreeSet::new();

        for (field, expires_at) in entries {
            if expires_at != 0 && expires_at <= now {
                let _: () = redis.hdel(&key, &field).await?;
                continue;
            }
            match field.parse::<EventKind>() {
                Ok(kind) => {
                    muted.insert(kind);
                }
                Err(_) => {
                    tracing::warn!(user = %user, field = %field, "Dropping unknown mute entry");
                    let _: () = redis.hdel(&key, &field).await?;
                }
            }
        }

        Ok(muted)
    }

    /// Mute an event kind, optionally until a point in time.
    pub async fn mute(
        &self,
        user: &Uuid,
        kind: EventKind,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), CourierError> {
        let mut redis = self.redis.clone();
        let expires_at = until.map(|t| t.timestamp_millis()).unwrap_or(0);
        let _: () = redis
            .hset(keys::mute(user), kind.to_string(), expires_at)
            .await?;
        Ok(())
    }

    pub async fn unmute(&self, user: &Uuid, kind: EventKind) -> Result<(), CourierError> {
        let mut redis = self.redis.clone();
        let _: () = redis.hdel(keys::mute(user), kind.to_string()).await?;
        Ok(())
    }
}
