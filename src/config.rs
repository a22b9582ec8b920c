//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::queue::{Partition, PartitionWeights};

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay before retry `n` is `schedule[n - 1]`; the last entry
    /// repeats once the schedule runs out.
    pub schedule: Vec<Duration>,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Upper bound of the uniform jitter, as a fraction of the base delay.
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            schedule: [60, 300, 1800, 7200, 7200]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            max_retries: 5,
            jitter_ratio: 0.10,
        }
    }
}

/// Circuit breaker configuration, shared by every dependency.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before a trial.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// libsql database file.
    pub db_path: PathBuf,
    /// Operator HTTP port.
    pub http_port: u16,
    /// Concurrent execution slots in the worker pool.
    pub worker_slots: usize,
    /// Partitions this process drains.
    pub partitions: Vec<Partition>,
    pub partition_weights: PartitionWeights,
    /// Idle wait between dequeue attempts when nothing wakes the pool.
    pub poll_interval: Duration,
    /// Cancels the handler cooperatively.
    pub soft_time_limit: Duration,
    /// Drops the handler future.
    pub hard_time_limit: Duration,
    /// Lease length; renewed every third of it while a job runs.
    pub lease_ttl: Duration,
    /// Minimum age of the last transition before recovery touches a job.
    pub stale_after: Duration,
    /// Period of the recovery reaper. `None` runs recovery only at startup.
    pub recovery_interval: Option<Duration>,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/jobwarden.db"),
            http_port: 8080,
            worker_slots: 4,
            partitions: Partition::ALL.to_vec(),
            partition_weights: PartitionWeights::default(),
            poll_interval: Duration::from_millis(500),
            soft_time_limit: Duration::from_secs(1500), // 25 minutes
            hard_time_limit: Duration::from_secs(1800), // 30 minutes
            lease_ttl: Duration::from_secs(60),
            stale_after: Duration::from_secs(120),
            recovery_interval: Some(Duration::from_secs(60)),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl JobsConfig {
    /// Build from `JOBWARDEN_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `from_env` uses the process
    /// environment; tests pass a map.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = lookup("JOBWARDEN_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(port) = parse::<u16>(&lookup, "JOBWARDEN_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(slots) = parse::<usize>(&lookup, "JOBWARDEN_WORKERS")? {
            config.worker_slots = slots;
        }
        if let Some(ms) = parse::<u64>(&lookup, "JOBWARDEN_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "JOBWARDEN_SOFT_LIMIT_SECS")? {
            config.soft_time_limit = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "JOBWARDEN_HARD_LIMIT_SECS")? {
            config.hard_time_limit = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "JOBWARDEN_LEASE_TTL_SECS")? {
            config.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "JOBWARDEN_STALE_AFTER_SECS")? {
            config.stale_after = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "JOBWARDEN_RECOVERY_INTERVAL_SECS")? {
            config.recovery_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(threshold) = parse::<u32>(&lookup, "JOBWARDEN_BREAKER_THRESHOLD")? {
            config.breaker.failure_threshold = threshold;
        }
        if let Some(secs) = parse::<u64>(&lookup, "JOBWARDEN_BREAKER_COOLDOWN_SECS")? {
            config.breaker.cooldown = Duration::from_secs(secs);
        }
        if let Some(max) = parse::<u32>(&lookup, "JOBWARDEN_MAX_RETRIES")? {
            config.retry.max_retries = max;
        }
        if let Some(raw) = lookup("JOBWARDEN_PARTITIONS") {
            config.partitions = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<Partition>().map_err(|message| ConfigError::InvalidValue {
                        key: "JOBWARDEN_PARTITIONS".to_string(),
                        message,
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(raw) = lookup("JOBWARDEN_PARTITION_WEIGHTS") {
            config.partition_weights = parse_weights(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_slots == 0 {
            return Err(invalid("JOBWARDEN_WORKERS", "at least one worker slot is required"));
        }
        if self.partitions.is_empty() {
            return Err(invalid("JOBWARDEN_PARTITIONS", "subscribe to at least one partition"));
        }
        if self.soft_time_limit >= self.hard_time_limit {
            return Err(invalid(
                "JOBWARDEN_SOFT_LIMIT_SECS",
                "soft time limit must be below the hard time limit",
            ));
        }
        if self.lease_ttl >= self.stale_after {
            return Err(invalid(
                "JOBWARDEN_STALE_AFTER_SECS",
                "stale threshold must exceed the lease TTL",
            ));
        }
        if self.retry.schedule.is_empty() {
            return Err(invalid("retry.schedule", "schedule must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(invalid("retry.jitter_ratio", "must be within 0.0..=1.0"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("JOBWARDEN_BREAKER_THRESHOLD", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            })
        })
        .transpose()
}

/// `generation,media,default,batch`, e.g. `8,4,2,1`.
fn parse_weights(raw: &str) -> Result<PartitionWeights, ConfigError> {
    let key = "JOBWARDEN_PARTITION_WEIGHTS";
    let values: Vec<u32> = raw
        .split(',')
        .map(|s| {
            s.trim()
                .parse::<u32>()
                .map_err(|e| invalid(key, &format!("{s:?}: {e}")))
        })
        .collect::<Result<_, _>>()?;

    match values.as_slice() {
        [generation, media, default, batch] => Ok(PartitionWeights {
            generation: *generation,
            media: *media,
            default: *default,
            batch: *batch,
        }),
        _ => Err(invalid(key, "expected four comma-separated weights")),
    }
}
