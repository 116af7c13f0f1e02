use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use courier_common::config::AppConfig;
use courier_common::{db, redis_pool};
use courier_delivery::dedup::DedupStore;
use courier_delivery::gateway::RedisLivePublisher;
use courier_delivery::ledger::PendingLedger;
use courier_delivery::lock::LockManager;
use courier_delivery::presence::PresenceRegistry;
use courier_delivery::processor::Processor;
use courier_delivery::queue::{JobQueue, QueueConfig, QueueConsumer};
use courier_delivery::sweep::{Sweep, SweepConfig};
use courier_push::{
    DeviceDirectory, HttpPushProvider, NoopPushProvider, PgDeviceDirectory, PushConfig,
    PushDispatcher, PushProvider,
};

/// Envelopes drained per push-retry poll.
const PUSH_RETRY_DRAIN_LIMIT: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "courier_worker=info,courier_delivery=info,courier_push=info".into()
            }),
        )
        .json()
        .init();

    tracing::info!("Courier worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to the shared store and the device directory
    let redis = redis_pool::create_redis_pool(&config.redis_url).await?;
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;

    // Push subsystem
    let provider: Arc<dyn PushProvider> = match (&config.push_endpoint, &config.push_api_key) {
        (Some(endpoint), Some(api_key)) => {
            tracing::info!(endpoint = %endpoint, "Push provider configured");
            Arc::new(HttpPushProvider::new(endpoint.clone(), api_key.clone()))
        }
        _ => {
            tracing::warn!("PUSH_ENDPOINT / PUSH_API_KEY not set, push delivery disabled");
            Arc::new(NoopPushProvider)
        }
    };
    let directory: Arc<dyn DeviceDirectory> = Arc::new(PgDeviceDirectory::new(pool));
    let dispatcher = Arc::new(PushDispatcher::new(
        provider,
        directory.clone(),
        redis.clone(),
        PushConfig {
            batch_size: config.push_batch_size,
            max_attempts: config.push_max_attempts,
            backoff_base: Duration::from_millis(config.push_backoff_base_ms),
        },
    ));

    // Delivery core
    let presence = PresenceRegistry::new(redis.clone());
    let jobs = DedupStore::new(
        redis.clone(),
        Duration::from_secs(config.dedup_ttl_secs),
        Duration::from_secs(config.job_ttl_secs),
    );
    let ledger = PendingLedger::new(redis.clone(), Duration::from_millis(config.pending_ttl_ms));
    let locks = LockManager::new(redis.clone());
    let publisher = Arc::new(RedisLivePublisher::new(redis.clone()));
    let queue = JobQueue::new(
        redis.clone(),
        QueueConfig {
            max_attempts: config.queue_max_attempts,
            backoff_base: Duration::from_millis(config.queue_backoff_base_ms),
            backoff_cap: Duration::from_millis(config.queue_backoff_cap_ms),
        },
    );
    let processor = Arc::new(Processor::new(
        presence.clone(),
        jobs.clone(),
        ledger.clone(),
        publisher,
        dispatcher.clone(),
        directory.clone(),
    ));

    let mut tasks: JoinSet<()> = JoinSet::new();

    // Queue consumers
    for namespace in &config.queue_namespaces {
        for _ in 0..config.workers_per_namespace {
            let consumer = QueueConsumer::new(
                queue.clone(),
                processor.clone(),
                namespace.clone(),
                Duration::from_millis(config.queue_poll_interval_ms),
            );
            tasks.spawn(consumer.run());
        }
    }
    tracing::info!(
        namespaces = config.queue_namespaces.len(),
        per_namespace = config.workers_per_namespace,
        "Queue consumers started"
    );

    // Reconciliation sweep
    let sweep = Sweep::new(
        ledger,
        jobs,
        presence,
        locks,
        dispatcher.clone(),
        directory,
        SweepConfig {
            interval: Duration::from_millis(config.sweep_interval_ms),
            batch: config.sweep_batch,
            concurrency: config.sweep_concurrency,
            max_attempts: config.sweep_max_attempts,
            grace: Duration::from_millis(config.reconnect_grace_ms),
        },
    );
    tasks.spawn(sweep.run());

    // Push retry drainer
    let retry_poll = Duration::from_millis(config.push_retry_poll_interval_ms);
    tasks.spawn(async move {
        loop {
            if let Err(e) = dispatcher.drain_retries(PUSH_RETRY_DRAIN_LIMIT).await {
                tracing::error!(error = %e, "Push retry drain failed");
            }
            tokio::time::sleep(retry_poll).await;
        }
    });

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        _ = tasks.join_next() => {
            tracing::error!("A worker task exited unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Courier worker stopped.");
    Ok(())
}
