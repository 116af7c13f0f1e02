//! Integration tests for the push dispatcher.
//!
//! Requires a running Redis with `REDIS_URL` env var set (defaults to
//! `redis://localhost:6379`). The database is flushed between tests — point
//! this at a dedicated test instance and run single-threaded:
//!
//! ```bash
//! REDIS_URL="redis://localhost:6379/15" \
//!   cargo test -p courier-push --test integration -- --ignored --test-threads=1 --nocapture
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use courier_common::error::CourierError;
use courier_common::types::{DeliveryStrategy, EventKind, NotificationJob};
use courier_push::{
    DeviceDirectory, DeviceRecord, PushConfig, PushDispatcher, PushMessage, PushProvider,
    TokenOutcome, TokenStatus,
};

async fn setup() -> ConnectionManager {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let client = redis::Client::open(url).unwrap();
    let mut conn = ConnectionManager::new(client).await.unwrap();
    let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();
    conn
}

fn message() -> PushMessage {
    let job = NotificationJob::new(
        "job-push",
        [Uuid::new_v4()],
        EventKind::RideStatus,
        DeliveryStrategy::PushOnly,
    );
    PushMessage::from_job(&job)
}

fn record(device: &str) -> DeviceRecord {
    DeviceRecord {
        user_id: Uuid::new_v4(),
        device_id: device.to_string(),
        push_token: format!("token-{device}"),
    }
}

/// Scripted provider: per-token outcomes for the first call, everything
/// delivered afterwards. Records every batch it sees.
struct ScriptedProvider {
    first_call: Mutex<HashMap<String, TokenStatus>>,
    batches: Mutex<Vec<Vec<String>>>,
}

impl ScriptedProvider {
    fn new(first_call: HashMap<String, TokenStatus>) -> Arc<Self> {
        Arc::new(Self {
            first_call: Mutex::new(first_call),
            batches: Mutex::new(Vec::new()),
        })
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(|b| b.len()).collect()
    }
}

#[async_trait]
impl PushProvider for ScriptedProvider {
    async fn send_to_tokens(
        &self,
        tokens: &[String],
        _message: &PushMessage,
    ) -> Result<Vec<TokenOutcome>, CourierError> {
        self.batches.lock().unwrap().push(tokens.to_vec());
        let mut scripted = self.first_call.lock().unwrap();
        Ok(tokens
            .iter()
            .map(|t| TokenOutcome {
                token: t.clone(),
                status: scripted.remove(t).unwrap_or(TokenStatus::Delivered),
            })
            .collect())
    }
}

/// Directory fake recording purges.
struct PurgeRecordingDirectory {
    purged: Mutex<Vec<String>>,
}

impl PurgeRecordingDirectory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            purged: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DeviceDirectory for PurgeRecordingDirectory {
    async fn devices_for_users(&self, _users: &[Uuid]) -> Result<Vec<DeviceRecord>, CourierError> {
        Ok(Vec::new())
    }

    async fn remove_devices_by_tokens(&self, tokens: &[String]) -> Result<u64, CourierError> {
        self.purged.lock().unwrap().extend(tokens.iter().cloned());
        Ok(tokens.len() as u64)
    }
}

fn config() -> PushConfig {
    PushConfig {
        batch_size: 2,
        max_attempts: 2,
        backoff_base: Duration::ZERO,
    }
}

#[tokio::test]
#[ignore]
async fn test_dispatch_chunks_to_batch_size() {
    let redis = setup().await;
    let provider = ScriptedProvider::new(HashMap::new());
    let directory = PurgeRecordingDirectory::new();
    let dispatcher = PushDispatcher::new(provider.clone(), directory, redis, config());

    let records: Vec<DeviceRecord> = (0..5).map(|i| record(&format!("d{i}"))).collect();
    let report = dispatcher.dispatch_to(&records, &message()).await.unwrap();

    assert_eq!(report.delivered.len(), 5);
    assert_eq!(provider.batch_sizes(), vec![2, 2, 1]);
}

#[tokio::test]
#[ignore]
async fn test_invalid_tokens_are_purged_from_directory() {
    let redis = setup().await;
    let provider = ScriptedProvider::new(
        [(
            "token-bad".to_string(),
            TokenStatus::Invalid("unregistered".to_string()),
        )]
        .into_iter()
        .collect(),
    );
    let directory = PurgeRecordingDirectory::new();
    let dispatcher = PushDispatcher::new(provider, directory.clone(), redis, config());

    let records = vec![record("good"), record("bad")];
    let report = dispatcher.dispatch_to(&records, &message()).await.unwrap();

    assert_eq!(report.delivered, vec!["token-good"]);
    assert_eq!(report.invalid, vec!["token-bad"]);
    assert_eq!(*directory.purged.lock().unwrap(), vec!["token-bad"]);
}

#[tokio::test]
#[ignore]
async fn test_retryable_tokens_drain_through_backoff_queue() {
    let redis = setup().await;
    let provider = ScriptedProvider::new(
        [(
            "token-flaky".to_string(),
            TokenStatus::Retryable("unavailable".to_string()),
        )]
        .into_iter()
        .collect(),
    );
    let directory = PurgeRecordingDirectory::new();
    let dispatcher = PushDispatcher::new(provider.clone(), directory, redis, config());

    let report = dispatcher
        .dispatch_to(&[record("flaky")], &message())
        .await
        .unwrap();
    assert_eq!(report.retrying, vec!["token-flaky"]);

    // Zero backoff base: the envelope is due immediately
    let drained = dispatcher.drain_retries(10).await.unwrap();
    assert_eq!(drained, 1);
    assert_eq!(provider.batch_sizes(), vec![1, 1]);

    // Second call was scripted to deliver; queue is empty now
    assert_eq!(dispatcher.drain_retries(10).await.unwrap(), 0);
}
