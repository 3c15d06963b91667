// Engine configuration. Defaults suit local development; every field can be
// overridden from the environment for ops-friendly deployments.
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 6379;
const DEFAULT_POOL_SIZE: usize = 5;
const DEFAULT_POOL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MESSAGE_TTL_SECS: u64 = 3600;
const DEFAULT_SUBSCRIPTION_TTL_SECS: u64 = 3600;
const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_CLEANUP_BATCH_SIZE: usize = 50;
const DEFAULT_PUBSUB_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_PUBSUB_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_NAMESPACE: &str = "faye";

const CLEANUP_BATCH_MIN: usize = 1;
const CLEANUP_BATCH_MAX: usize = 1000;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Redis endpoint.
    pub host: String,
    pub port: u16,
    pub database: u32,
    pub password: Option<String>,
    pub ssl: bool,
    // Command-pool sizing.
    pub pool_size: usize,
    pub pool_timeout: Duration,
    // Per-operation deadlines.
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    // Retry policy for transient command failures.
    pub max_retries: u32,
    pub retry_delay: Duration,
    // Session liveness window (TTL on the client hash).
    pub client_timeout: u64,
    // TTL applied once per message queue.
    pub message_ttl: u64,
    // TTL applied once per subscription key.
    pub subscription_ttl: u64,
    // GC period; zero disables the timer.
    pub gc_interval: Duration,
    // Items per orphan-cleanup batch; clamped to [1, 1000] at use.
    pub cleanup_batch_size: usize,
    // Subscriber reconnect policy.
    pub pubsub_max_reconnect_attempts: u32,
    pub pubsub_reconnect_delay: Duration,
    // Prefix for every Redis key.
    pub namespace: String,
    pub log_level: LogLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            database: 0,
            password: None,
            ssl: false,
            pool_size: DEFAULT_POOL_SIZE,
            pool_timeout: DEFAULT_POOL_TIMEOUT,
            connect_timeout: DEFAULT_IO_TIMEOUT,
            read_timeout: DEFAULT_IO_TIMEOUT,
            write_timeout: DEFAULT_IO_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            client_timeout: DEFAULT_CLIENT_TIMEOUT_SECS,
            message_ttl: DEFAULT_MESSAGE_TTL_SECS,
            subscription_ttl: DEFAULT_SUBSCRIPTION_TTL_SECS,
            gc_interval: DEFAULT_GC_INTERVAL,
            cleanup_batch_size: DEFAULT_CLEANUP_BATCH_SIZE,
            pubsub_max_reconnect_attempts: DEFAULT_PUBSUB_MAX_RECONNECT_ATTEMPTS,
            pubsub_reconnect_delay: DEFAULT_PUBSUB_RECONNECT_DELAY,
            namespace: DEFAULT_NAMESPACE.to_string(),
            log_level: LogLevel::Info,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `PALAVER_*` environment variables. Unparseable
    /// values fall back to the default for that field.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("PALAVER_REDIS_HOST") {
            config.host = value;
        }
        if let Some(value) = env_parse::<u16>("PALAVER_REDIS_PORT") {
            config.port = value;
        }
        if let Some(value) = env_parse::<u32>("PALAVER_REDIS_DATABASE") {
            config.database = value;
        }
        if let Ok(value) = std::env::var("PALAVER_REDIS_PASSWORD") {
            config.password = Some(value);
        }
        if let Ok(value) = std::env::var("PALAVER_REDIS_SSL") {
            config.ssl = matches!(value.as_str(), "1" | "true" | "yes");
        }
        if let Some(value) = env_parse::<usize>("PALAVER_POOL_SIZE").filter(|v| *v > 0) {
            config.pool_size = value;
        }
        if let Some(value) = env_parse_secs("PALAVER_POOL_TIMEOUT_SECS") {
            config.pool_timeout = value;
        }
        if let Some(value) = env_parse_secs("PALAVER_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = value;
        }
        if let Some(value) = env_parse_secs("PALAVER_READ_TIMEOUT_SECS") {
            config.read_timeout = value;
        }
        if let Some(value) = env_parse_secs("PALAVER_WRITE_TIMEOUT_SECS") {
            config.write_timeout = value;
        }
        if let Some(value) = env_parse::<u32>("PALAVER_MAX_RETRIES") {
            config.max_retries = value;
        }
        if let Some(value) = env_parse_secs("PALAVER_RETRY_DELAY_SECS") {
            config.retry_delay = value;
        }
        if let Some(value) = env_parse::<u64>("PALAVER_CLIENT_TIMEOUT_SECS") {
            config.client_timeout = value;
        }
        if let Some(value) = env_parse::<u64>("PALAVER_MESSAGE_TTL_SECS") {
            config.message_ttl = value;
        }
        if let Some(value) = env_parse::<u64>("PALAVER_SUBSCRIPTION_TTL_SECS") {
            config.subscription_ttl = value;
        }
        if let Some(value) = env_parse::<u64>("PALAVER_GC_INTERVAL_SECS") {
            config.gc_interval = Duration::from_secs(value);
        }
        if let Some(value) = env_parse::<usize>("PALAVER_CLEANUP_BATCH_SIZE") {
            config.cleanup_batch_size = value;
        }
        if let Some(value) = env_parse::<u32>("PALAVER_PUBSUB_MAX_RECONNECT_ATTEMPTS") {
            config.pubsub_max_reconnect_attempts = value;
        }
        if let Some(value) = env_parse_secs("PALAVER_PUBSUB_RECONNECT_DELAY_SECS") {
            config.pubsub_reconnect_delay = value;
        }
        if let Ok(value) = std::env::var("PALAVER_NAMESPACE") {
            if !value.is_empty() {
                config.namespace = value;
            }
        }
        if let Some(value) = std::env::var("PALAVER_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.log_level = value;
        }
        config
    }

    /// Batch size honored by the orphan cleaner, clamped to [1, 1000].
    pub fn effective_cleanup_batch_size(&self) -> usize {
        self.cleanup_batch_size
            .clamp(CLEANUP_BATCH_MIN, CLEANUP_BATCH_MAX)
    }

    pub fn gc_enabled(&self) -> bool {
        !self.gc_interval.is_zero()
    }

    pub(crate) fn connection_info(&self) -> redis::ConnectionInfo {
        let addr = if self.ssl {
            redis::ConnectionAddr::TcpTls {
                host: self.host.clone(),
                port: self.port,
                insecure: false,
                tls_params: None,
            }
        } else {
            redis::ConnectionAddr::Tcp(self.host.clone(), self.port)
        };
        redis::ConnectionInfo {
            addr,
            redis: redis::RedisConnectionInfo {
                db: i64::from(self.database),
                username: None,
                password: self.password.clone(),
                ..Default::default()
            },
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

fn env_parse_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Silent,
    Error,
    Info,
    Debug,
}

impl LogLevel {
    /// The `EnvFilter` directive this level maps onto.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Silent => "off",
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        match input {
            "silent" | "off" => Ok(LogLevel::Silent),
            "error" => Ok(LogLevel::Error),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 6379);
        assert_eq!(config.database, 0);
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.pool_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert_eq!(config.client_timeout, 60);
        assert_eq!(config.message_ttl, 3600);
        assert_eq!(config.subscription_ttl, 3600);
        assert_eq!(config.gc_interval, Duration::from_secs(60));
        assert_eq!(config.cleanup_batch_size, 50);
        assert_eq!(config.pubsub_max_reconnect_attempts, 10);
        assert_eq!(config.pubsub_reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.namespace, "faye");
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn cleanup_batch_size_is_clamped() {
        let mut config = EngineConfig::default();
        config.cleanup_batch_size = 0;
        assert_eq!(config.effective_cleanup_batch_size(), 1);
        config.cleanup_batch_size = 50_000;
        assert_eq!(config.effective_cleanup_batch_size(), 1000);
        config.cleanup_batch_size = 200;
        assert_eq!(config.effective_cleanup_batch_size(), 200);
    }

    #[test]
    fn zero_gc_interval_disables_the_timer() {
        let mut config = EngineConfig::default();
        config.gc_interval = Duration::ZERO;
        assert!(!config.gc_enabled());
    }

    #[test]
    fn log_level_parses_known_names() {
        assert_eq!("silent".parse(), Ok(LogLevel::Silent));
        assert_eq!("error".parse(), Ok(LogLevel::Error));
        assert_eq!("info".parse(), Ok(LogLevel::Info));
        assert_eq!("debug".parse(), Ok(LogLevel::Debug));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn connection_info_carries_database_and_password() {
        let mut config = EngineConfig::default();
        config.database = 2;
        config.password = Some("secret".into());
        let info = config.connection_info();
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.password.as_deref(), Some("secret"));
    }
}
