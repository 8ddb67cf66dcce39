use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub host: IpAddr,
    pub port: u16,
    pub log_level: String,
    pub worker_count: usize,
    pub poll_interval: Duration,
    /// Claims older than this are reclaimed. Zero disables reclamation.
    pub processing_timeout: Duration,
    pub queue: QueueConfig,
}

/// Tunables of the queue core itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Max items claimed per poll.
    pub batch_limit: usize,
    /// Backoff unit in milliseconds.
    pub base_delay_ms: u64,
    /// Ceiling used when the producer does not give one.
    pub default_max_retries: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_limit: 10,
            base_delay_ms: 1000,
            default_max_retries: 3,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay_ms == 0 {
            return Err("base delay must be at least 1ms".to_string());
        }
        if self.default_max_retries < 1 {
            return Err("default max retries must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let database_url = env.required("DATABASE_URL")?;
        let database_max_connections = env.parse_or("EVENTQ_DATABASE_MAX_CONNECTIONS", 10)?;

        let host: IpAddr = env.parse_or("EVENTQ_HOST", IpAddr::from([0, 0, 0, 0]))?;
        let port: u16 = env.parse_or("EVENTQ_PORT", 3000)?;
        let log_level = env.or("EVENTQ_LOG_LEVEL", "info");

        let worker_count: usize = env.parse_or("EVENTQ_WORKER_COUNT", 4)?;
        if worker_count == 0 {
            return Err("EVENTQ_WORKER_COUNT must be at least 1".to_string());
        }
        let poll_interval = Duration::from_millis(env.parse_or("EVENTQ_POLL_INTERVAL_MS", 1000)?);
        let processing_timeout =
            Duration::from_secs(env.parse_or("EVENTQ_PROCESSING_TIMEOUT_SECS", 300)?);

        let defaults = QueueConfig::default();
        let queue = QueueConfig {
            batch_limit: env.parse_or("EVENTQ_BATCH_LIMIT", defaults.batch_limit)?,
            base_delay_ms: env.parse_or("EVENTQ_BASE_DELAY_MS", defaults.base_delay_ms)?,
            default_max_retries: env
                .parse_or("EVENTQ_DEFAULT_MAX_RETRIES", defaults.default_max_retries)?,
        };
        queue.validate().map_err(|e| format!("Invalid queue configuration: {e}"))?;

        Ok(Config {
            database_url,
            database_max_connections,
            host,
            port,
            log_level,
            worker_count,
            poll_interval,
            processing_timeout,
            queue,
        })
    }

    pub fn reclaim_enabled(&self) -> bool {
        !self.processing_timeout.is_zero()
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, key: &str) -> Result<String, String> {
        (self.lookup)(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| format!("Missing required environment variable: {key}"))
    }

    fn or(&self, key: &str, default: &str) -> String {
        (self.lookup)(key).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, String>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| format!("Invalid {key}: {e}")),
            None => Ok(default),
        }
    }
}
