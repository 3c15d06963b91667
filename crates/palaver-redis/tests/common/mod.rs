// Shared helpers for the Redis-backed integration tests. Every test run gets
// its own key namespace so suites can share one Redis instance without
// stepping on each other.
#![allow(dead_code)]

use palaver_redis::{Engine, EngineConfig, LogLevel};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::from_env();
    config.namespace = format!("palaver-test-{}", Uuid::new_v4());
    config.log_level = LogLevel::Silent;
    config.retry_delay = Duration::from_millis(50);
    config
}

pub async fn engine(config: &EngineConfig) -> Arc<Engine> {
    Engine::new(config.clone()).await.expect("engine")
}

/// Raw connection to the same Redis, for out-of-band setup and assertions.
pub async fn raw_connection(config: &EngineConfig) -> redis::aio::MultiplexedConnection {
    let url = format!(
        "redis://{}:{}/{}",
        config.host, config.port, config.database
    );
    redis::Client::open(url)
        .expect("client")
        .get_multiplexed_async_connection()
        .await
        .expect("connection")
}

/// Poll `check` until it returns true or the deadline passes.
pub async fn eventually<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = std::time::Instant::now();
    loop {
        if check().await {
            return true;
        }
        if started.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
