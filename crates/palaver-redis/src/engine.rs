//! Engine composition: publish fan-out, local-echo deduplication, client
//! lifecycle, and the garbage-collection timer.
//!
//! # Failure policy
//! No public operation returns an error. Redis failures are logged and folded
//! into the result (`false`, `None`, an empty list), so a transient blip
//! never tears through the protocol layer; the periodic GC reconciles any
//! state a half-applied write leaves behind.
use futures::future::join_all;
use palaver_common::Message;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::echo::{EchoSet, epoch_secs};
use crate::error::Result;
use crate::keys::Keys;
use crate::logging;
use crate::pool::ConnectionPool;
use crate::pubsub::PubSubCoordinator;
use crate::queue::MessageQueue;
use crate::registry::ClientRegistry;
use crate::subscription::SubscriptionManager;

pub struct Engine {
    config: EngineConfig,
    pool: Arc<ConnectionPool>,
    registry: ClientRegistry,
    subscriptions: SubscriptionManager,
    queue: MessageQueue,
    pubsub: PubSubCoordinator,
    echo: EchoSet,
    gc: Mutex<Option<JoinHandle<()>>>,
    server_id: String,
}

impl Engine {
    /// Build an engine over the given Redis endpoint. The pub/sub handler is
    /// registered here, once; the subscriber worker itself starts lazily with
    /// the first publish.
    pub async fn new(config: EngineConfig) -> Result<Arc<Self>> {
        logging::init(config.log_level);
        let keys = Keys::new(config.namespace.clone());
        let pool = Arc::new(ConnectionPool::new(&config)?);
        let server_id = Uuid::new_v4().to_string();
        let engine = Arc::new(Self {
            registry: ClientRegistry::new(
                Arc::clone(&pool),
                keys.clone(),
                config.client_timeout,
                server_id.clone(),
            ),
            subscriptions: SubscriptionManager::new(
                Arc::clone(&pool),
                keys.clone(),
                config.subscription_ttl,
                config.effective_cleanup_batch_size(),
            ),
            queue: MessageQueue::new(Arc::clone(&pool), keys.clone(), config.message_ttl),
            pubsub: PubSubCoordinator::new(
                Arc::clone(&pool),
                keys,
                config.pubsub_max_reconnect_attempts,
                config.pubsub_reconnect_delay,
            ),
            echo: EchoSet::new(),
            gc: Mutex::new(None),
            pool,
            config,
            server_id,
        });

        // Receive -> hand off to the runtime; the subscriber worker carries no
        // business logic. A missing runtime only happens during shutdown.
        let weak = Arc::downgrade(&engine);
        engine.pubsub.on_message(move |channel_name, message| {
            let Some(engine) = weak.upgrade() else { return };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        engine.receive_remote(channel_name, message).await;
                    });
                }
                Err(_) => {
                    debug!(channel = %channel_name, "runtime stopped; dropping pub/sub message");
                }
            }
        });
        info!(server_id = %engine.server_id, "engine ready");
        Ok(engine)
    }

    /// Mint a new client session; `None` when Redis is unavailable. The GC
    /// timer starts lazily with the first client.
    pub async fn create_client(self: &Arc<Self>) -> Option<String> {
        loop {
            let client_id = Uuid::new_v4().to_string();
            match self.registry.create(&client_id).await {
                Ok(true) => {
                    self.start_gc();
                    debug!(client_id = %client_id, "client created");
                    return Some(client_id);
                }
                // Id collision; mint another.
                Ok(false) => continue,
                Err(err) => {
                    error!(error = %err, "client creation failed");
                    return None;
                }
            }
        }
    }

    /// Tear a client down: subscriptions first, then its queue, then the
    /// registry entry.
    pub async fn destroy_client(&self, client_id: &str) -> bool {
        let unsubscribed = log_failure(
            self.subscriptions.unsubscribe_all(client_id).await,
            "unsubscribe_all",
        );
        let cleared = log_failure(self.queue.clear(client_id).await, "queue clear");
        let destroyed = match self.registry.destroy(client_id).await {
            Ok(destroyed) => destroyed,
            Err(err) => {
                error!(client_id, error = %err, "registry destroy failed");
                false
            }
        };
        unsubscribed && cleared && destroyed
    }

    pub async fn client_exists(&self, client_id: &str) -> bool {
        match self.registry.exists(client_id).await {
            Ok(exists) => exists,
            Err(err) => {
                error!(client_id, error = %err, "existence check failed");
                false
            }
        }
    }

    /// Heartbeat: refresh the session TTL and every subscription key's TTL.
    /// The message queue's TTL is deliberately left alone.
    pub async fn ping(&self, client_id: &str) {
        log_failure(self.registry.ping(client_id).await, "registry ping");
        log_failure(
            self.subscriptions
                .refresh_client_subscriptions_ttl(client_id)
                .await,
            "subscription ttl refresh",
        );
    }

    pub async fn subscribe(&self, client_id: &str, channel_name: &str) -> bool {
        log_failure(
            self.subscriptions.subscribe(client_id, channel_name).await,
            "subscribe",
        )
    }

    pub async fn unsubscribe(&self, client_id: &str, channel_name: &str) -> bool {
        log_failure(
            self.subscriptions.unsubscribe(client_id, channel_name).await,
            "unsubscribe",
        )
    }

    /// Publish to every channel: the pub/sub fan-out and the local enqueue
    /// for the current subscriber snapshot run concurrently per channel, and
    /// the single aggregated result is the AND over every operation.
    pub async fn publish(&self, mut message: Message, channels: &[String]) -> bool {
        let message_id = message.ensure_id().to_string();
        self.echo.record(&message_id, epoch_secs());
        metrics::counter!("palaver_publish_total").increment(1);
        metrics::histogram!("palaver_publish_channels").record(channels.len() as f64);

        let outcomes = join_all(channels.iter().map(|channel_name| {
            let message = &message;
            async move {
                let (sent, queued) = tokio::join!(
                    self.fanout_remote(channel_name, message),
                    self.enqueue_for_subscribers(channel_name, message),
                );
                sent && queued
            }
        }))
        .await;

        let ok = outcomes.into_iter().all(|success| success);
        if !ok {
            metrics::counter!("palaver_publish_failed_total").increment(1);
        }
        ok
    }

    /// Drain the client's queue, oldest first.
    pub async fn empty_queue(&self, client_id: &str) -> Vec<Message> {
        match self.queue.dequeue_all(client_id).await {
            Ok(messages) => messages,
            Err(err) => {
                error!(client_id, error = %err, "queue drain failed");
                Vec::new()
            }
        }
    }

    /// One GC cycle: sweep the local-echo set, reap expired clients, then
    /// reconcile orphaned subscription state against the survivors. Always
    /// completes; returns the number of clients reaped.
    pub async fn cleanup_expired(&self) -> usize {
        let swept = self.echo.sweep(epoch_secs());
        if swept > 0 {
            debug!(swept, "swept aged local-echo entries");
        }

        let reaped = match self.registry.cleanup_expired().await {
            Ok(reaped) => reaped,
            Err(err) => {
                error!(error = %err, "client expiry sweep failed");
                0
            }
        };
        metrics::counter!("palaver_gc_clients_reaped_total").increment(reaped as u64);

        // Without a trustworthy active set, orphan cleanup would reclaim
        // live state; skip this cycle instead.
        match self.registry.all().await {
            Ok(active) => {
                let active: HashSet<String> = active.into_iter().collect();
                log_failure(
                    self.subscriptions.cleanup_orphaned_data(&active).await,
                    "orphan cleanup",
                );
            }
            Err(err) => warn!(error = %err, "skipping orphan cleanup, active set unavailable"),
        }
        reaped
    }

    /// Stop the GC timer, the subscriber worker, and the pool. Operations
    /// still in flight resolve with failure results.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.gc.lock().expect("gc lock").take() {
            handle.abort();
        }
        self.pubsub.disconnect();
        self.pool.close();
        info!(server_id = %self.server_id, "engine disconnected");
    }

    /// This engine instance's identity, recorded on every client it creates.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn fanout_remote(&self, channel_name: &str, message: &Message) -> bool {
        match self.pubsub.publish(channel_name, message).await {
            Ok(()) => true,
            Err(err) => {
                error!(channel = channel_name, error = %err, "pub/sub publish failed");
                false
            }
        }
    }

    async fn enqueue_for_subscribers(&self, channel_name: &str, message: &Message) -> bool {
        let subscribers = match self.subscriptions.subscribers(channel_name).await {
            Ok(subscribers) => subscribers,
            Err(err) => {
                error!(channel = channel_name, error = %err, "subscriber lookup failed");
                return false;
            }
        };
        if subscribers.is_empty() {
            return true;
        }
        match self.queue.enqueue_batch(&subscribers, message).await {
            Ok(()) => true,
            Err(err) => {
                error!(channel = channel_name, error = %err, "batched enqueue failed");
                false
            }
        }
    }

    /// A publication arriving over the shared pub/sub bus. Our own echo is
    /// probed (not consumed) so one publish fanned out to many channels is
    /// dropped every time it comes back.
    async fn receive_remote(&self, channel_name: String, message: Message) {
        if let Some(message_id) = message.id.as_deref() {
            if self.echo.contains(message_id) {
                metrics::counter!("palaver_pubsub_echoes_dropped_total").increment(1);
                debug!(channel = %channel_name, "dropped local echo");
                return;
            }
        }
        if !self.enqueue_for_subscribers(&channel_name, &message).await {
            error!(channel = %channel_name, "remote delivery failed");
        }
    }

    fn start_gc(self: &Arc<Self>) {
        if !self.config.gc_enabled() {
            return;
        }
        let mut slot = self.gc.lock().expect("gc lock");
        if slot.is_some() {
            return;
        }
        let period = self.config.gc_interval;
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so cycles are spaced
            // one full period apart.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else { return };
                engine.cleanup_expired().await;
            }
        }));
        debug!(period_secs = period.as_secs(), "gc timer started");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("server_id", &self.server_id)
            .field("namespace", &self.config.namespace)
            .finish_non_exhaustive()
    }
}

fn log_failure(result: Result<()>, what: &str) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            error!(error = %err, "{what} failed");
            false
        }
    }
}
