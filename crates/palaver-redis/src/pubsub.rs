//! Cross-process fan-out coordinator.
//!
//! # Purpose
//! One background worker owns the dedicated pub/sub connection, holds a
//! single pattern subscription on `{ns}:publish:*`, and demultiplexes every
//! incoming publication to one registered handler. The worker does nothing
//! else: receive, parse, hand off. Business logic stays on the caller's side
//! of the handler.
//!
//! # Reconnection
//! A failed connect/subscribe backs off exponentially with jitter, capped at
//! 60s, and gives up after `pubsub_max_reconnect_attempts` consecutive
//! failures, a fatal-for-fanout condition reported via the log. A successful
//! subscribe resets the failure counter.
use futures::StreamExt;
use palaver_common::Message;
use rand::Rng;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::keys::Keys;
use crate::pool::{ConnectionPool, backoff_delay};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

type Handler = Arc<dyn Fn(String, Message) + Send + Sync>;

pub struct PubSubCoordinator {
    pool: Arc<ConnectionPool>,
    keys: Keys,
    handler: Arc<Mutex<Option<Handler>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
}

impl PubSubCoordinator {
    pub fn new(
        pool: Arc<ConnectionPool>,
        keys: Keys,
        max_reconnect_attempts: u32,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            pool,
            keys,
            handler: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            max_reconnect_attempts,
            reconnect_delay,
        }
    }

    /// Register the message handler. The slot is single-occupancy: a second
    /// registration replaces the first, with a warning, so a message is never
    /// processed twice.
    pub fn on_message(&self, handler: impl Fn(String, Message) + Send + Sync + 'static) {
        let mut slot = self.handler.lock().expect("handler lock");
        if slot.is_some() {
            warn!("replacing registered pub/sub message handler");
        }
        *slot = Some(Arc::new(handler));
    }

    /// Publish the encoded message on the channel's pub/sub key, lazily
    /// starting the subscriber worker first.
    pub async fn publish(&self, channel_name: &str, message: &Message) -> Result<()> {
        self.ensure_worker();
        let key = self.keys.publish(channel_name);
        let payload = serde_json::to_string(message)?;
        self.pool
            .with_connection(|mut conn| {
                let key = key.clone();
                let payload = payload.clone();
                async move {
                    redis::cmd("PUBLISH")
                        .arg(&key)
                        .arg(&payload)
                        .query_async::<i64>(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(())
    }

    /// Stop the worker, close the dedicated connection, and clear the
    /// handler slot. In-flight publishes report failure through the pool.
    pub fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().expect("worker lock").take() {
            // Aborting drops the dedicated connection; close errors are moot.
            handle.abort();
        }
        *self.handler.lock().expect("handler lock") = None;
    }

    /// Whether the subscriber worker is (still) trying to serve the pattern
    /// subscription. Goes false on `disconnect` or reconnect exhaustion.
    pub fn subscriber_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock().expect("worker lock");
        if worker.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let pool = Arc::clone(&self.pool);
        let keys = self.keys.clone();
        let handler = Arc::clone(&self.handler);
        let running = Arc::clone(&self.running);
        let max_attempts = self.max_reconnect_attempts;
        let base_delay = self.reconnect_delay;
        *worker = Some(tokio::spawn(run_subscriber(
            pool,
            keys,
            handler,
            running,
            max_attempts,
            base_delay,
        )));
    }
}

impl std::fmt::Debug for PubSubCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubCoordinator")
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("reconnect_delay", &self.reconnect_delay)
            .finish_non_exhaustive()
    }
}

enum SubscriberExit {
    // Stop flag observed; wind down quietly.
    Stopped,
    // Healthy subscription lost its stream; reconnect with a fresh counter.
    Disconnected,
    // Connect or subscribe failed; counts toward the reconnect ceiling.
    ConnectFailed(redis::RedisError),
}

async fn run_subscriber(
    pool: Arc<ConnectionPool>,
    keys: Keys,
    handler: Arc<Mutex<Option<Handler>>>,
    running: Arc<AtomicBool>,
    max_attempts: u32,
    base_delay: Duration,
) {
    let mut attempts: u32 = 0;
    while running.load(Ordering::SeqCst) {
        match subscribe_and_listen(&pool, &keys, &handler, &running).await {
            SubscriberExit::Stopped => return,
            SubscriberExit::Disconnected => {
                attempts = 0;
                warn!("pub/sub stream ended, reconnecting");
            }
            SubscriberExit::ConnectFailed(err) => {
                attempts += 1;
                if attempts >= max_attempts {
                    error!(
                        attempts,
                        error = %err,
                        "pub/sub reconnect attempts exhausted; cross-process fan-out is down"
                    );
                    running.store(false, Ordering::SeqCst);
                    return;
                }
                warn!(attempts, error = %err, "pub/sub connect failed, backing off");
            }
        }
        tokio::time::sleep(with_jitter(reconnect_backoff(base_delay, attempts.max(1)))).await;
    }
}

async fn subscribe_and_listen(
    pool: &ConnectionPool,
    keys: &Keys,
    handler: &Mutex<Option<Handler>>,
    running: &AtomicBool,
) -> SubscriberExit {
    let mut pubsub = match pool.pubsub().await {
        Ok(pubsub) => pubsub,
        Err(err) => return SubscriberExit::ConnectFailed(err),
    };
    if let Err(err) = pubsub.psubscribe(keys.publish_pattern()).await {
        return SubscriberExit::ConnectFailed(err);
    }
    info!(pattern = %keys.publish_pattern(), "pub/sub subscriber listening");

    let mut stream = pubsub.on_message();
    while let Some(incoming) = stream.next().await {
        if !running.load(Ordering::SeqCst) {
            return SubscriberExit::Stopped;
        }
        let channel_key = incoming.get_channel_name().to_string();
        let payload: String = match incoming.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(channel = %channel_key, error = %err, "unreadable pub/sub payload");
                continue;
            }
        };
        handle_raw(keys, handler, &channel_key, &payload);
    }
    if running.load(Ordering::SeqCst) {
        SubscriberExit::Disconnected
    } else {
        SubscriberExit::Stopped
    }
}

// Receive -> parse -> hand off; nothing heavier belongs on the worker.
fn handle_raw(keys: &Keys, handler: &Mutex<Option<Handler>>, channel_key: &str, payload: &str) {
    let Some(channel_name) = keys.strip_publish(channel_key) else {
        warn!(channel = channel_key, "pub/sub message outside our namespace");
        return;
    };
    let message: Message = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(err) => {
            warn!(channel = channel_name, error = %err, "dropping malformed pub/sub message");
            return;
        }
    };
    metrics::counter!("palaver_pubsub_messages_received_total").increment(1);
    let registered = handler.lock().expect("handler lock").clone();
    match registered {
        Some(handler) => {
            // A panicking handler must not take the subscriber down with it.
            if catch_unwind(AssertUnwindSafe(|| handler(channel_name.to_string(), message)))
                .is_err()
            {
                error!(channel = channel_name, "pub/sub message handler panicked");
            }
        }
        None => {
            debug!(channel = channel_name, "no handler registered, message dropped");
        }
    }
}

/// Deterministic part of the reconnect delay: `base · 2^(attempt-1)`, capped.
fn reconnect_backoff(base: Duration, attempt: u32) -> Duration {
    backoff_delay(base, attempt).min(MAX_RECONNECT_DELAY)
}

/// Up to +30% of random jitter, still capped.
fn with_jitter(delay: Duration) -> Duration {
    let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..0.3));
    (delay + jitter).min(MAX_RECONNECT_DELAY)
}
