//! Subscription graph: the `client ↔ channel` bipartite sets, the wildcard
//! pattern set, and the orphan reconciler.
//!
//! # Design notes
//! Both directions of the graph are stored (`subscriptions:{cid}` and
//! `channels:{ch}`) for O(1) lookup either way, kept consistent by running
//! every subscribe/unsubscribe as one server-side script. The TTL-if-absent
//! rule lives in the same scripts so a hot subscription is neither
//! immortalized nor re-aged by repeated re-subscription.
use futures::future::join_all;
use palaver_common::channel;
use redis::AsyncCommands;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::yield_now;
use tracing::{debug, info};

use crate::echo::epoch_secs;
use crate::error::Result;
use crate::keys::Keys;
use crate::pattern::PatternCache;
use crate::pool::ConnectionPool;
use crate::scripts;

const SCAN_BATCH: usize = 100;

#[derive(Debug)]
pub struct SubscriptionManager {
    pool: Arc<ConnectionPool>,
    keys: Keys,
    subscription_ttl: u64,
    cleanup_batch_size: usize,
    patterns: PatternCache,
}

impl SubscriptionManager {
    pub fn new(
        pool: Arc<ConnectionPool>,
        keys: Keys,
        subscription_ttl: u64,
        cleanup_batch_size: usize,
    ) -> Self {
        Self {
            pool,
            keys,
            subscription_ttl,
            cleanup_batch_size,
            patterns: PatternCache::new(),
        }
    }

    /// Link `client_id` and `channel` in both directions, write the
    /// per-subscription record, and register the pattern when the channel is
    /// a wildcard. All of it runs atomically, with TTLs applied only where
    /// absent.
    pub async fn subscribe(&self, client_id: &str, channel_name: &str) -> Result<()> {
        let is_pattern = channel::is_pattern(channel_name);
        let ttl = self.subscription_ttl;
        let now = epoch_secs();
        let script_keys = self.subscription_keys(client_id, channel_name);
        self.pool
            .with_connection(|mut conn| {
                let script_keys = script_keys.clone();
                let channel_name = channel_name.to_string();
                let client_id = client_id.to_string();
                async move {
                    let mut invocation = scripts::SUBSCRIBE.prepare_invoke();
                    for key in &script_keys {
                        invocation.key(key);
                    }
                    invocation
                        .arg(&channel_name)
                        .arg(&client_id)
                        .arg(ttl)
                        .arg(now)
                        .arg(if is_pattern { "1" } else { "0" })
                        .invoke_async::<i64>(&mut conn)
                        .await
                }
            })
            .await?;
        debug!(client_id, channel = channel_name, "subscribed");
        Ok(())
    }

    /// Unlink both directions and delete the per-subscription record. A
    /// wildcard whose subscriber set emptied is retired from the pattern set
    /// and its compiled regex evicted.
    pub async fn unsubscribe(&self, client_id: &str, channel_name: &str) -> Result<()> {
        let is_pattern = channel::is_pattern(channel_name);
        let script_keys = self.subscription_keys(client_id, channel_name);
        let retired: i64 = self
            .pool
            .with_connection(|mut conn| {
                let script_keys = script_keys.clone();
                let channel_name = channel_name.to_string();
                let client_id = client_id.to_string();
                async move {
                    let mut invocation = scripts::UNSUBSCRIBE.prepare_invoke();
                    for key in &script_keys {
                        invocation.key(key);
                    }
                    invocation
                        .arg(&channel_name)
                        .arg(&client_id)
                        .arg(if is_pattern { "1" } else { "0" })
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;
        if retired == 1 {
            self.patterns.evict(channel_name);
        }
        debug!(client_id, channel = channel_name, "unsubscribed");
        Ok(())
    }

    /// Unsubscribe from every channel the client holds. Every per-channel
    /// removal runs to completion before this resolves, and it resolves
    /// exactly once with the first failure if any.
    pub async fn unsubscribe_all(&self, client_id: &str) -> Result<()> {
        let channels = self.client_subscriptions(client_id).await?;
        let results = join_all(
            channels
                .iter()
                .map(|channel_name| self.unsubscribe(client_id, channel_name)),
        )
        .await;
        results.into_iter().collect()
    }

    /// Channels the client is currently subscribed to.
    pub async fn client_subscriptions(&self, client_id: &str) -> Result<Vec<String>> {
        let key = self.keys.subscriptions(client_id);
        self.pool
            .with_connection(|mut conn| {
                let key = key.clone();
                async move { conn.smembers(&key).await }
            })
            .await
    }

    /// Deduplicated union of exact subscribers and subscribers of every
    /// pattern matching `channel_name`.
    pub async fn subscribers(&self, channel_name: &str) -> Result<Vec<String>> {
        let key = self.keys.channel(channel_name);
        let exact: Vec<String> = self
            .pool
            .with_connection(|mut conn| {
                let key = key.clone();
                async move { conn.smembers(&key).await }
            })
            .await?;
        let via_patterns = self.pattern_subscribers(channel_name).await?;
        let mut seen: HashSet<String> = HashSet::with_capacity(exact.len() + via_patterns.len());
        let mut union = Vec::new();
        for client_id in exact.into_iter().chain(via_patterns) {
            if seen.insert(client_id.clone()) {
                union.push(client_id);
            }
        }
        Ok(union)
    }

    /// Subscribers reached through wildcard patterns: enumerate the pattern
    /// set, match in-process, then fetch every matching subscriber set in one
    /// pipelined round-trip.
    pub async fn pattern_subscribers(&self, channel_name: &str) -> Result<Vec<String>> {
        let patterns_key = self.keys.patterns();
        let patterns: Vec<String> = self
            .pool
            .with_connection(|mut conn| {
                let patterns_key = patterns_key.clone();
                async move { conn.smembers(&patterns_key).await }
            })
            .await?;
        let matching: Vec<String> = patterns
            .into_iter()
            .filter(|pattern| self.patterns.matches(channel_name, pattern))
            .collect();
        if matching.is_empty() {
            return Ok(Vec::new());
        }
        let member_sets: Vec<Vec<String>> = self
            .pool
            .with_connection(|mut conn| {
                let matching = matching.clone();
                async move {
                    let mut pipe = redis::pipe();
                    for pattern in &matching {
                        pipe.smembers(self.keys.channel(pattern));
                    }
                    pipe.query_async(&mut conn).await
                }
            })
            .await?;
        let mut seen = HashSet::new();
        let mut subscribers = Vec::new();
        for client_id in member_sets.into_iter().flatten() {
            if seen.insert(client_id.clone()) {
                subscribers.push(client_id);
            }
        }
        Ok(subscribers)
    }

    /// Does `channel_name` match the wildcard `pattern`?
    pub fn matches(&self, channel_name: &str, pattern: &str) -> bool {
        self.patterns.matches(channel_name, pattern)
    }

    /// Unconditional TTL refresh for an active client's subscription keys.
    /// Called from ping; unlike subscribe this path always re-arms.
    pub async fn refresh_client_subscriptions_ttl(&self, client_id: &str) -> Result<()> {
        let channels = self.client_subscriptions(client_id).await?;
        let subscriptions_key = self.keys.subscriptions(client_id);
        let ttl = self.subscription_ttl as i64;
        self.pool
            .with_connection(|mut conn| {
                let subscriptions_key = subscriptions_key.clone();
                let channels = channels.clone();
                let client_id = client_id.to_string();
                async move {
                    let mut pipe = redis::pipe();
                    pipe.expire(&subscriptions_key, ttl).ignore();
                    for channel_name in &channels {
                        pipe.expire(self.keys.channel(channel_name), ttl).ignore();
                        pipe.expire(self.keys.subscription(&client_id, channel_name), ttl)
                            .ignore();
                    }
                    pipe.query_async::<()>(&mut conn).await
                }
            })
            .await?;
        Ok(())
    }

    /// Reconcile crash-orphaned subscription state against the set of
    /// currently active clients. Five phases, each batched, yielding the
    /// scheduler (and the pool) between batches so a large sweep cannot
    /// monopolise either.
    pub async fn cleanup_orphaned_data(&self, active: &HashSet<String>) -> Result<()> {
        let batch_size = self.cleanup_batch_size.clamp(1, 1000);

        // Phase 1: find subscription sets whose owner is gone.
        let orphans: Vec<String> = self
            .scan_batches(&self.keys.subscriptions_pattern())
            .await?
            .iter()
            .filter_map(|key| self.keys.strip_subscriptions(key))
            .filter(|client_id| !active.contains(*client_id))
            .map(str::to_string)
            .collect();

        // Phase 2: tear each orphan down: its channel memberships, its
        // per-subscription records, and its message queue.
        let mut reclaimed = 0usize;
        for chunk in orphans.chunks(batch_size) {
            for client_id in chunk {
                let channels = self.client_subscriptions(client_id).await?;
                self.pool
                    .with_connection(|mut conn| {
                        let channels = channels.clone();
                        let client_id = client_id.clone();
                        async move {
                            let mut pipe = redis::pipe();
                            pipe.del(self.keys.subscriptions(&client_id)).ignore();
                            for channel_name in &channels {
                                pipe.del(self.keys.subscription(&client_id, channel_name))
                                    .ignore();
                                pipe.srem(self.keys.channel(channel_name), &client_id)
                                    .ignore();
                            }
                            pipe.del(self.keys.messages(&client_id)).ignore();
                            pipe.query_async::<()>(&mut conn).await
                        }
                    })
                    .await?;
                reclaimed += 1;
            }
            yield_now().await;
        }

        // Phase 3: message queues with no active owner.
        let dead_queues: Vec<String> = self
            .scan_batches(&self.keys.messages_pattern())
            .await?
            .into_iter()
            .filter(|key| {
                self.keys
                    .strip_messages(key)
                    .is_some_and(|client_id| !active.contains(client_id))
            })
            .collect();
        for chunk in dead_queues.chunks(batch_size) {
            self.pool
                .with_connection(|mut conn| {
                    let chunk: Vec<String> = chunk.to_vec();
                    async move {
                        let mut pipe = redis::pipe();
                        for key in &chunk {
                            pipe.del(key).ignore();
                        }
                        pipe.query_async::<()>(&mut conn).await
                    }
                })
                .await?;
            yield_now().await;
        }

        // Phase 4: subscriber sets that emptied out.
        let channel_keys = self.scan_batches(&self.keys.channels_pattern()).await?;
        for chunk in channel_keys.chunks(batch_size) {
            let sizes: Vec<i64> = self
                .pool
                .with_connection(|mut conn| {
                    let chunk: Vec<String> = chunk.to_vec();
                    async move {
                        let mut pipe = redis::pipe();
                        for key in &chunk {
                            pipe.scard(key);
                        }
                        pipe.query_async(&mut conn).await
                    }
                })
                .await?;
            let empty: Vec<String> = chunk
                .iter()
                .zip(&sizes)
                .filter(|(_, size)| **size == 0)
                .map(|(key, _)| key.clone())
                .collect();
            if !empty.is_empty() {
                self.pool
                    .with_connection(|mut conn| {
                        let empty = empty.clone();
                        async move {
                            let mut pipe = redis::pipe();
                            for key in &empty {
                                pipe.del(key).ignore();
                            }
                            pipe.query_async::<()>(&mut conn).await
                        }
                    })
                    .await?;
            }
            yield_now().await;
        }

        // Phase 5: patterns whose subscriber set is gone, plus their cached
        // regexes; every removal path must evict the cache.
        let patterns_key = self.keys.patterns();
        let patterns: Vec<String> = self
            .pool
            .with_connection(|mut conn| {
                let patterns_key = patterns_key.clone();
                async move { conn.smembers(&patterns_key).await }
            })
            .await?;
        for chunk in patterns.chunks(batch_size) {
            let sizes: Vec<i64> = self
                .pool
                .with_connection(|mut conn| {
                    let chunk: Vec<String> = chunk.to_vec();
                    async move {
                        let mut pipe = redis::pipe();
                        for pattern in &chunk {
                            pipe.scard(self.keys.channel(pattern));
                        }
                        pipe.query_async(&mut conn).await
                    }
                })
                .await?;
            let dead: Vec<String> = chunk
                .iter()
                .zip(&sizes)
                .filter(|(_, size)| **size == 0)
                .map(|(pattern, _)| pattern.clone())
                .collect();
            if !dead.is_empty() {
                self.pool
                    .with_connection(|mut conn| {
                        let patterns_key = patterns_key.clone();
                        let dead = dead.clone();
                        async move {
                            let mut pipe = redis::pipe();
                            for pattern in &dead {
                                pipe.srem(&patterns_key, pattern).ignore();
                                pipe.del(self.keys.channel(pattern)).ignore();
                            }
                            pipe.query_async::<()>(&mut conn).await
                        }
                    })
                    .await?;
                for pattern in &dead {
                    self.patterns.evict(pattern);
                }
            }
            yield_now().await;
        }

        if reclaimed > 0 {
            info!(clients = reclaimed, "reclaimed orphaned subscription state");
            metrics::counter!("palaver_gc_orphans_reclaimed_total").increment(reclaimed as u64);
        }
        Ok(())
    }

    // The four keys a subscription touches, in script KEYS order.
    fn subscription_keys(&self, client_id: &str, channel_name: &str) -> [String; 4] {
        [
            self.keys.subscriptions(client_id),
            self.keys.channel(channel_name),
            self.keys.subscription(client_id, channel_name),
            self.keys.patterns(),
        ]
    }

    /// SCAN in cursor batches, releasing the pooled connection and yielding
    /// the scheduler between batches.
    async fn scan_batches(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .pool
                .with_connection(|mut conn| {
                    let pattern = pattern.to_string();
                    async move {
                        redis::cmd("SCAN")
                            .arg(cursor)
                            .arg("MATCH")
                            .arg(&pattern)
                            .arg("COUNT")
                            .arg(SCAN_BATCH)
                            .query_async(&mut conn)
                            .await
                    }
                })
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
            yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn manager() -> SubscriptionManager {
        let pool = Arc::new(ConnectionPool::new(&EngineConfig::default()).expect("pool"));
        SubscriptionManager::new(pool, Keys::new("faye"), 3600, 50)
    }

    #[test]
    fn subscription_keys_follow_schema_order() {
        let manager = manager();
        let keys = manager.subscription_keys("c1", "/chat/*");
        assert_eq!(keys[0], "faye:subscriptions:c1");
        assert_eq!(keys[1], "faye:channels:/chat/*");
        assert_eq!(keys[2], "faye:subscription:c1:/chat/*");
        assert_eq!(keys[3], "faye:patterns");
    }

    #[test]
    fn matcher_is_exposed_for_diagnostics() {
        let manager = manager();
        assert!(manager.matches("/chat/r1/private", "/chat/**"));
        assert!(!manager.matches("/other", "/chat/**"));
    }
}
