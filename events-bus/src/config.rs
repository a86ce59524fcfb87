use std::env;
use std::time::Duration;

/// Runtime configuration for the event bus.
///
/// Defaults suit a single-process deployment against a local Redis. Every
/// field can be overridden through `EVENT_BUS_*` environment variables via
/// [`BusConfig::from_env`], or programmatically with the `with_*` builders.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Redis connection string.
    pub redis_url: String,
    /// Deployment environment, part of every stream name (`events:prod`).
    pub environment: String,
    /// Leading segment of all stream names.
    pub stream_prefix: String,
    /// Approximate cap on the main event stream.
    pub main_maxlen: usize,
    /// Approximate cap on the dead-letter stream.
    pub dlq_maxlen: usize,
    /// Approximate cap on the audit stream.
    pub audit_maxlen: usize,
    /// Entries requested per blocking read.
    pub read_batch_size: usize,
    /// How long one blocking read waits before returning empty. Also bounds
    /// how long a worker takes to observe a shutdown request.
    pub block_timeout: Duration,
    /// Pause after a failed read before retrying.
    pub read_backoff: Duration,
    /// Pending entries idle longer than this are claimed from their previous
    /// consumer and redelivered.
    pub claim_min_idle: Duration,
    /// How often each worker scans for claimable entries.
    pub claim_interval: Duration,
    /// Competing consumers spawned per consumer group.
    pub workers_per_group: usize,
    /// Connection attempts before `connect` gives up.
    pub max_connect_attempts: u32,
    /// Base pause between connection attempts, scaled by attempt number.
    pub connect_backoff: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            environment: "dev".to_string(),
            stream_prefix: "events".to_string(),
            main_maxlen: 10_000,
            dlq_maxlen: 1_000,
            audit_maxlen: 50_000,
            read_batch_size: 10,
            block_timeout: Duration::from_secs(1),
            read_backoff: Duration::from_secs(1),
            claim_min_idle: Duration::from_secs(30),
            claim_interval: Duration::from_secs(10),
            workers_per_group: 1,
            max_connect_attempts: 5,
            connect_backoff: Duration::from_millis(500),
        }
    }
}

impl BusConfig {
    /// Build a config from `EVENT_BUS_*` environment variables, falling back
    /// to the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: env::var("EVENT_BUS_REDIS_URL").unwrap_or(defaults.redis_url),
            environment: env::var("EVENT_BUS_ENVIRONMENT").unwrap_or(defaults.environment),
            stream_prefix: env::var("EVENT_BUS_STREAM_PREFIX").unwrap_or(defaults.stream_prefix),
            main_maxlen: env_usize("EVENT_BUS_MAIN_MAXLEN", defaults.main_maxlen),
            dlq_maxlen: env_usize("EVENT_BUS_DLQ_MAXLEN", defaults.dlq_maxlen),
            audit_maxlen: env_usize("EVENT_BUS_AUDIT_MAXLEN", defaults.audit_maxlen),
            read_batch_size: env_usize("EVENT_BUS_READ_BATCH_SIZE", defaults.read_batch_size),
            block_timeout: env_millis("EVENT_BUS_BLOCK_TIMEOUT_MS", defaults.block_timeout),
            read_backoff: env_millis("EVENT_BUS_READ_BACKOFF_MS", defaults.read_backoff),
            claim_min_idle: env_millis("EVENT_BUS_CLAIM_MIN_IDLE_MS", defaults.claim_min_idle),
            claim_interval: env_millis("EVENT_BUS_CLAIM_INTERVAL_MS", defaults.claim_interval),
            workers_per_group: env_usize("EVENT_BUS_WORKERS_PER_GROUP", defaults.workers_per_group)
                .max(1),
            max_connect_attempts: defaults.max_connect_attempts,
            connect_backoff: defaults.connect_backoff,
        }
    }

    pub fn with_redis_url(mut self, redis_url: &str) -> Self {
        self.redis_url = redis_url.to_string();
        self
    }

    pub fn with_environment(mut self, environment: &str) -> Self {
        self.environment = environment.to_string();
        self
    }

    pub fn with_stream_prefix(mut self, stream_prefix: &str) -> Self {
        self.stream_prefix = stream_prefix.to_string();
        self
    }

    pub fn with_workers_per_group(mut self, workers: usize) -> Self {
        self.workers_per_group = workers.max(1);
        self
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
