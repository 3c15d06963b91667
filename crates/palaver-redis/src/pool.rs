//! Redis command-connection pool.
//!
//! # Purpose
//! Owns a fixed number of multiplexed command connections and runs every
//! command closure inside a retry loop that absorbs transient connectivity
//! failures. The dedicated pub/sub connection is created here too, but it is
//! neither pooled nor retried; the coordinator owns its reconnect policy.
use redis::aio::MultiplexedConnection;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

const SCAN_COUNT: usize = 100;

pub struct ConnectionPool {
    client: redis::Client,
    // Idle connections, bounded by the permit count.
    idle: Mutex<Vec<MultiplexedConnection>>,
    permits: Semaphore,
    pool_timeout: Duration,
    connect_timeout: Duration,
    response_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = redis::Client::open(config.connection_info())?;
        Ok(Self {
            client,
            idle: Mutex::new(Vec::with_capacity(config.pool_size)),
            permits: Semaphore::new(config.pool_size.max(1)),
            pool_timeout: config.pool_timeout,
            connect_timeout: config.connect_timeout,
            // The multiplexed connection exposes one response deadline; read
            // and write budgets jointly bound it.
            response_timeout: config.read_timeout + config.write_timeout,
            max_retries: config.max_retries.max(1),
            retry_delay: config.retry_delay,
            closed: AtomicBool::new(false),
        })
    }

    /// Run `op` against one pooled connection, retrying transient failures
    /// with exponential backoff. A non-retryable error, or exhaustion of
    /// `max_retries`, surfaces as the final error.
    pub async fn with_connection<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::PoolClosed);
        }
        let _permit = tokio::time::timeout(self.pool_timeout, self.permits.acquire())
            .await
            .map_err(|_| EngineError::PoolTimeout(self.pool_timeout))?
            .map_err(|_| EngineError::PoolClosed)?;

        let mut attempt = 1u32;
        loop {
            match self.checkout().await {
                Ok(conn) => match op(conn.clone()).await {
                    Ok(value) => {
                        self.check_in(conn);
                        return Ok(value);
                    }
                    Err(err) if EngineError::is_transient(&err) => {
                        // The connection is suspect; let it drop.
                        if attempt >= self.max_retries {
                            return Err(EngineError::RetriesExhausted {
                                attempts: attempt,
                                source: err,
                            });
                        }
                        debug!(attempt, error = %err, "transient redis error, retrying");
                        tokio::time::sleep(backoff_delay(self.retry_delay, attempt)).await;
                        attempt += 1;
                    }
                    Err(err) => {
                        // Command-level failure; the connection is fine.
                        self.check_in(conn);
                        return Err(EngineError::Redis(err));
                    }
                },
                Err(err) if EngineError::is_transient(&err) && attempt < self.max_retries => {
                    debug!(attempt, error = %err, "redis connect failed, retrying");
                    tokio::time::sleep(backoff_delay(self.retry_delay, attempt)).await;
                    attempt += 1;
                }
                Err(err) if attempt >= self.max_retries && EngineError::is_transient(&err) => {
                    return Err(EngineError::RetriesExhausted {
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => return Err(EngineError::Redis(err)),
            }
        }
    }

    /// Liveness probe: a single PING, no retries. Reports `false` on the
    /// error classes `with_connection` would retry or surface.
    pub async fn connected(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut conn = match self.checkout().await {
            Ok(conn) => conn,
            Err(_) => return false,
        };
        let pong: redis::RedisResult<String> =
            redis::cmd("PING").query_async(&mut conn).await;
        if pong.is_ok() {
            self.check_in(conn);
        }
        pong.is_ok()
    }

    /// Dedicated pub/sub connection for the subscriber worker. Not pooled,
    /// not retried here.
    pub async fn pubsub(&self) -> redis::RedisResult<redis::aio::PubSub> {
        if self.closed.load(Ordering::SeqCst) {
            return Err((redis::ErrorKind::ClientError, "connection pool is closed").into());
        }
        self.client.get_async_pubsub().await
    }

    /// Stop handing out connections and drop the idle set. In-flight
    /// operations finish; later calls report `PoolClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.permits.close();
        self.idle.lock().expect("pool lock").clear();
    }

    async fn checkout(&self) -> redis::RedisResult<MultiplexedConnection> {
        if let Some(conn) = self.idle.lock().expect("pool lock").pop() {
            return Ok(conn);
        }
        self.client
            .get_multiplexed_async_connection_with_timeouts(
                self.response_timeout,
                self.connect_timeout,
            )
            .await
    }

    fn check_in(&self, conn: MultiplexedConnection) {
        if !self.closed.load(Ordering::SeqCst) {
            self.idle.lock().expect("pool lock").push(conn);
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("pool_timeout", &self.pool_timeout)
            .field("max_retries", &self.max_retries)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// `base · 2^(attempt-1)`, saturating.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

/// Cursor-scan every key matching `pattern` on one connection.
pub(crate) async fn scan_keys(
    conn: &mut MultiplexedConnection,
    pattern: &str,
) -> redis::RedisResult<Vec<String>> {
    let mut keys = Vec::new();
    let mut cursor: u64 = 0;
    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await?;
        keys.extend(batch);
        if next == 0 {
            return Ok(keys);
        }
        cursor = next;
    }
}
