//! Presence registry — per-user map of device → live connection id.
//!
//! Ephemeral by design: nothing here survives a store flush, clients rebuild
//! it by reconnecting. At most one connection id per (user, device); HSET
//! overwrite means a newer handle always supersedes an older one.

use redis::{AsyncCommands, Script};
use redis::aio::ConnectionManager;
use uuid::Uuid;

use courier_common::error::CourierError;

use crate::keys;

/// Change in a user's online state caused by a presence mutation.
///
/// Online/offline events fire only on the 0↔1 active-device transitions,
/// not on every connect or disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    CameOnline,
    WentOffline,
    NoChange,
}

#[derive(Clone)]
pub struct PresenceRegistry {
    redis: ConnectionManager,
    add_script: Script,
    remove_script: Script,
}

impl PresenceRegistry {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            add_script: Script::new(
                r#"
                local before = redis.call('HLEN', KEYS[1])
                redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
                return before
                "#,
            ),
            // Drop the device only while it still holds the handle that
            // disconnected; a newer handle for the same device must survive.
            remove_script: Script::new(
                r#"
                if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
                    redis.call('HDEL', KEYS[1], ARGV[1])
                    return redis.call('HLEN', KEYS[1])
                end
                return -1
                "#,
            ),
        }
    }

    /// Register (or supersede) a device's live connection.
    pub async fn add_connection(
        &self,
        user: &Uuid,
        device: &str,
        conn_id: &str,
    ) -> Result<PresenceTransition, CourierError> {
        let mut redis = self.redis.clone();
        let devices_before: i64 = self
            .add_script
            .key(keys::presence(user))
            .arg(device)
            .arg(conn_id)
            .invoke_async(&mut redis)
            .await?;

        Ok(if devices_before == 0 {
            PresenceTransition::CameOnline
        } else {
            PresenceTransition::NoChange
        })
    }

    /// Remove a device's connection, but only if `conn_id` is still its
    /// current handle (a reconnect that already replaced it wins).
    pub async fn remove_connection(
        &self,
        user: &Uuid,
        device: &str,
        conn_id: &str,
    ) -> Result<PresenceTransition, CourierError> {
        let mut redis = self.redis.clone();
        let devices_left: i64 = self
            .remove_script
            .key(keys::presence(user))
            .arg(device)
            .arg(conn_id)
            .invoke_async(&mut redis)
            .await?;

        Ok(if devices_left == 0 {
            PresenceTransition::WentOffline
        } else {
            PresenceTransition::NoChange
        })
    }

    /// Devices of this user with a live connection right now.
    pub async fn active_devices(&self, user: &Uuid) -> Result<Vec<String>, CourierError> {
        let mut redis = self.redis.clone();
        let devices: Vec<String> = redis.hkeys(keys::presence(user)).await?;
        Ok(devices)
    }

    /// Current connection id for a device, if any.
    pub async fn handle_for(
        &self,
        user: &Uuid,
        device: &str,
    ) -> Result<Option<String>, CourierError> {
        let mut redis = self.redis.clone();
        let handle: Option<String> = redis.hget(keys::presence(user), device).await?;
        Ok(handle)
    }
}
