//! TTL-bounded distributed locks over the shared store.
//!
//! `SET key token NX PX ttl` to acquire; release deletes the key only while
//! it still holds the acquirer's token. The TTL guarantees liveness — a
//! crashed holder's lock frees itself, so no resolution path can deadlock.

use std::time::Duration;

use redis::Script;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use courier_common::error::CourierError;

use crate::keys;

const ACQUIRE_POLL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct LockManager {
    redis: ConnectionManager,
    release_script: Script,
}

impl LockManager {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            release_script: Script::new(
                r#"
                if redis.call('GET', KEYS[1]) == ARGV[1] then
                    return redis.call('DEL', KEYS[1])
                end
                return 0
                "#,
            ),
        }
    }

    /// Single acquisition attempt. `None` when another holder has the lock.
    pub async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, CourierError> {
        let key = keys::lock(name);
        let token = Uuid::new_v4().to_string();
        let mut redis = self.redis.clone();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut redis)
            .await?;

        Ok(acquired.map(|_| LockGuard {
            redis: self.redis.clone(),
            release_script: self.release_script.clone(),
            key,
            token,
            released: false,
        }))
    }

    /// Acquire with a bounded wait, polling until `wait` elapses.
    pub async fn acquire_waiting(
        &self,
        name: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<LockGuard>, CourierError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(guard) = self.acquire(name, ttl).await? {
                return Ok(Some(guard));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(ACQUIRE_POLL).await;
        }
    }
}

/// Held lock. Prefer explicit `release()`; `Drop` falls back to a spawned
/// best-effort release so an early return cannot pin the key until TTL.
pub struct LockGuard {
    redis: ConnectionManager,
    release_script: Script,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub async fn release(mut self) -> Result<(), CourierError> {
        self.released = true;
        let mut redis = self.redis.clone();
        let _: i64 = self
            .release_script
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut redis)
            .await?;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut redis = self.redis.clone();
        let script = self.release_script.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        // Outside a runtime the TTL is the fallback.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _: Result<i64, _> =
                    script.key(&key).arg(&token).invoke_async(&mut redis).await;
            });
        }
    }
}
