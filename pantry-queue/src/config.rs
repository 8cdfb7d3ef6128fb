use std::env;
use std::time::Duration;

use crate::{QueueError, QueueResult, BackoffPolicy};

/// Connection settings for the shared broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Logical database index
    pub db: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

impl BrokerConfig {
    /// Read `REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD` and `REDIS_DB`, falling back to defaults
    pub fn from_env() -> QueueResult<Self> {
        let defaults = Self::default();

        let host = env::var("REDIS_HOST").unwrap_or(defaults.host);
        let port = parse_env("REDIS_PORT")?.unwrap_or(defaults.port);
        let password = env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty());
        let db = parse_env("REDIS_DB")?.unwrap_or(defaults.db);

        Ok(Self { host, port, password, db })
    }

    /// Connection URL in `redis://[:password@]host:port/db` form
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Static configuration of one named queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    /// Maximum simultaneously active jobs
    pub concurrency: usize,
    pub default_attempts: u32,
    pub default_backoff: BackoffPolicy,
    /// Upper bound for computed backoff delays
    pub max_backoff: Option<Duration>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: 1,
            default_attempts: 3,
            default_backoff: BackoffPolicy::default(),
            max_backoff: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.default_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.default_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = Some(cap);
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.name.trim().is_empty() {
            return Err(QueueError::InvalidConfig("queue name must not be empty".to_string()));
        }
        if self.concurrency == 0 {
            return Err(QueueError::InvalidConfig(format!("queue {}: concurrency must be at least 1", self.name)));
        }
        if self.default_attempts == 0 {
            return Err(QueueError::InvalidConfig(format!("queue {}: attempts must be at least 1", self.name)));
        }
        Ok(())
    }
}

/// Configuration for the whole registry, fixed at startup
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub queues: Vec<QueueConfig>,
    /// Count sampling period; `None` disables the background sampler
    pub metrics_interval: Option<Duration>,
    /// How long an idle worker waits before polling again
    pub poll_interval: Duration,
    /// Lock granted on claim and renewed while a job runs
    pub lock_duration: Duration,
    /// Stalled job scan period; `None` disables the scan
    pub stalled_interval: Option<Duration>,
    /// Key namespace of the Redis broker built by `QueueRegistry::redis`
    pub key_prefix: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            metrics_interval: Some(Duration::from_secs(60)),
            poll_interval: Duration::from_secs(1),
            lock_duration: Duration::from_secs(30),
            stalled_interval: Some(Duration::from_secs(30)),
            key_prefix: "pantry".to_string(),
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// The five queues the recipe backend runs
    pub fn recipe_defaults() -> Self {
        Self::default()
            .with_queue(
                QueueConfig::new("media")
                    .with_concurrency(2)
                    .with_attempts(3)
                    .with_backoff(BackoffPolicy::exponential(5000)),
            )
            .with_queue(
                QueueConfig::new("notifications")
                    .with_concurrency(10)
                    .with_attempts(5)
                    .with_backoff(BackoffPolicy::exponential(2000)),
            )
            .with_queue(
                QueueConfig::new("email")
                    .with_concurrency(5)
                    .with_attempts(5)
                    .with_backoff(BackoffPolicy::exponential(3000)),
            )
            .with_queue(
                QueueConfig::new("analytics")
                    .with_concurrency(3)
                    .with_attempts(3)
                    .with_backoff(BackoffPolicy::fixed(10_000)),
            )
            .with_queue(
                QueueConfig::new("search")
                    .with_concurrency(3)
                    .with_attempts(3)
                    .with_backoff(BackoffPolicy::exponential(1000)),
            )
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn with_metrics_interval(mut self, interval: Option<Duration>) -> Self {
        self.metrics_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lock_duration(mut self, lock: Duration) -> Self {
        self.lock_duration = lock;
        self
    }

    pub fn with_stalled_interval(mut self, interval: Option<Duration>) -> Self {
        self.stalled_interval = interval;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Apply `QUEUE_<NAME>_CONCURRENCY` overrides from the environment
    pub fn apply_env_overrides(mut self) -> QueueResult<Self> {
        for queue in &mut self.queues {
            let key = format!("QUEUE_{}_CONCURRENCY", queue.name.to_uppercase().replace('-', "_"));
            if let Some(concurrency) = parse_env(&key)? {
                queue.concurrency = concurrency;
            }
        }
        Ok(self)
    }

    pub fn validate(&self) -> QueueResult<()> {
        let mut seen = std::collections::HashSet::new();
        for queue in &self.queues {
            queue.validate()?;
            if !seen.insert(queue.name.as_str()) {
                return Err(QueueError::InvalidConfig(format!("queue {} declared twice", queue.name)));
            }
        }
        if self.lock_duration.is_zero() {
            return Err(QueueError::InvalidConfig("lock duration must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> QueueResult<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| QueueError::InvalidConfig(format!("{} has invalid value {:?}", key, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_includes_password_when_set() {
        let mut config = BrokerConfig::default();
        assert_eq!(config.url(), "redis://127.0.0.1:6379/0");

        config.password = Some("s3cret".to_string());
        config.db = 2;
        assert_eq!(config.url(), "redis://:s3cret@127.0.0.1:6379/2");
    }

    #[test]
    fn recipe_defaults_are_valid() {
        let config = RegistryConfig::recipe_defaults();
        config.validate().unwrap();
        let names: Vec<_> = config.queues.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, ["media", "notifications", "email", "analytics", "search"]);
        assert_eq!(config.metrics_interval, Some(Duration::from_secs(60)));
    }

    #[test]
    fn rejects_zero_concurrency_and_duplicates() {
        let zero = RegistryConfig::new().with_queue(QueueConfig::new("media").with_concurrency(0));
        assert!(matches!(zero.validate(), Err(QueueError::InvalidConfig(_))));

        let dup = RegistryConfig::new()
            .with_queue(QueueConfig::new("email"))
            .with_queue(QueueConfig::new("email"));
        assert!(matches!(dup.validate(), Err(QueueError::InvalidConfig(_))));
    }

    #[test]
    fn env_overrides_concurrency() {
        env::set_var("QUEUE_SEARCH_CONCURRENCY", "7");
        let config = RegistryConfig::recipe_defaults().apply_env_overrides().unwrap();
        env::remove_var("QUEUE_SEARCH_CONCURRENCY");

        let search = config.queues.iter().find(|q| q.name == "search").unwrap();
        assert_eq!(search.concurrency, 7);
    }

    #[test]
    fn invalid_env_value_is_config_error() {
        env::set_var("QUEUE_ANALYTICS_CONCURRENCY", "lots");
        let result = RegistryConfig::recipe_defaults().apply_env_overrides();
        env::remove_var("QUEUE_ANALYTICS_CONCURRENCY");

        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
    }
}
