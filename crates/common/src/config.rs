use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection string (presence, dedup, ledger, queues, locks)
    pub redis_url: String,

    /// PostgreSQL connection string (device directory)
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Push provider HTTP endpoint; push is disabled when unset
    pub push_endpoint: Option<String>,

    /// Push provider API key
    pub push_api_key: Option<String>,

    /// Maximum tokens per provider call (default: 500)
    pub push_batch_size: usize,

    /// Attempt ceiling for token-level transient push retries (default: 3)
    pub push_max_attempts: u32,

    /// Base delay for the push retry queue backoff in milliseconds (default: 5000)
    pub push_backoff_base_ms: u64,

    /// Poll interval for the push retry drainer in milliseconds (default: 1000)
    pub push_retry_poll_interval_ms: u64,

    /// Channel namespaces the worker consumes, comma separated (default: "notifications")
    pub queue_namespaces: Vec<String>,

    /// Queue consumer poll interval in milliseconds (default: 250)
    pub queue_poll_interval_ms: u64,

    /// Whole-job retry ceiling on the background queue (default: 5)
    pub queue_max_attempts: u32,

    /// Base delay for queue retry backoff in milliseconds (default: 1000)
    pub queue_backoff_base_ms: u64,

    /// Cap for queue retry backoff in milliseconds (default: 60000)
    pub queue_backoff_cap_ms: u64,

    /// Consumers spawned per namespace (default: 2)
    pub workers_per_namespace: usize,

    /// Reconciliation sweep interval in milliseconds (default: 30000)
    pub sweep_interval_ms: u64,

    /// Maximum expired ledger entries resolved per sweep cycle (default: 200)
    pub sweep_batch: usize,

    /// Concurrent entry resolutions within a sweep cycle (default: 8)
    pub sweep_concurrency: usize,

    /// Attempt ceiling before a pending record is force-resolved (default: 6)
    pub sweep_max_attempts: u32,

    /// Delay before a pending ledger entry surfaces in the expiry index, in
    /// milliseconds (default: 60000)
    pub pending_ttl_ms: u64,

    /// Offline grace window before falling back to push, in milliseconds
    /// (default: 45000)
    pub reconnect_grace_ms: u64,

    /// Delay before a disconnected device is dropped from presence, in
    /// milliseconds (default: 10000)
    pub presence_grace_ms: u64,

    /// TTL for stored job bodies in seconds (default: 86400)
    pub job_ttl_secs: u64,

    /// TTL for dedup markers in seconds (default: 86400)
    pub dedup_ttl_secs: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            redis_url: env_string("REDIS_URL", "redis://localhost:6379"),
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", 20)?,
            push_endpoint: std::env::var("PUSH_ENDPOINT").ok(),
            push_api_key: std::env::var("PUSH_API_KEY").ok(),
            push_batch_size: env_parse("PUSH_BATCH_SIZE", 500)?,
            push_max_attempts: env_parse("PUSH_MAX_ATTEMPTS", 3)?,
            push_backoff_base_ms: env_parse("PUSH_BACKOFF_BASE_MS", 5000)?,
            push_retry_poll_interval_ms: env_parse("PUSH_RETRY_POLL_INTERVAL_MS", 1000)?,
            queue_namespaces: env_string("QUEUE_NAMESPACES", "notifications")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            queue_poll_interval_ms: env_parse("QUEUE_POLL_INTERVAL_MS", 250)?,
            queue_max_attempts: env_parse("QUEUE_MAX_ATTEMPTS", 5)?,
            queue_backoff_base_ms: env_parse("QUEUE_BACKOFF_BASE_MS", 1000)?,
            queue_backoff_cap_ms: env_parse("QUEUE_BACKOFF_CAP_MS", 60000)?,
            workers_per_namespace: env_parse("WORKERS_PER_NAMESPACE", 2)?,
            sweep_interval_ms: env_parse("SWEEP_INTERVAL_MS", 30000)?,
            sweep_batch: env_parse("SWEEP_BATCH", 200)?,
            sweep_concurrency: env_parse("SWEEP_CONCURRENCY", 8)?,
            sweep_max_attempts: env_parse("SWEEP_MAX_ATTEMPTS", 6)?,
            pending_ttl_ms: env_parse("PENDING_TTL_MS", 60000)?,
            reconnect_grace_ms: env_parse("RECONNECT_GRACE_MS", 45000)?,
            presence_grace_ms: env_parse("PRESENCE_GRACE_MS", 10000)?,
            job_ttl_secs: env_parse("JOB_TTL_SECS", 86400)?,
            dedup_ttl_secs: env_parse("DEDUP_TTL_SECS", 86400)?,
        })
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}
