//! Client registry: lifecycle, heartbeat, and index of active sessions.
//!
//! A client exists iff its hash has been refreshed within `client_timeout`.
//! The `clients:index` Set may transiently hold ids whose hash already
//! expired; `cleanup_expired` reconciles per cycle, and every tenth cycle the
//! index is rebuilt wholesale from the surviving hashes to catch ids that
//! slipped past the per-cycle pass (e.g. an index add that outlived a crash).
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

use crate::echo::epoch_secs;
use crate::error::Result;
use crate::keys::Keys;
use crate::pool::{ConnectionPool, scan_keys};

const EXISTENCE_CHECK_BATCH: usize = 100;
const REPAIR_EVERY_N_CYCLES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub client_id: String,
    pub created_at: u64,
    pub last_ping: u64,
    pub server_id: String,
}

#[derive(Debug)]
pub struct ClientRegistry {
    pool: Arc<ConnectionPool>,
    keys: Keys,
    client_timeout: u64,
    server_id: String,
    cleanup_runs: AtomicU32,
}

impl ClientRegistry {
    pub fn new(
        pool: Arc<ConnectionPool>,
        keys: Keys,
        client_timeout: u64,
        server_id: String,
    ) -> Self {
        Self {
            pool,
            keys,
            client_timeout,
            server_id,
            cleanup_runs: AtomicU32::new(0),
        }
    }

    /// Write the client hash, index membership, and liveness TTL in one
    /// transaction. `false` means the id was already taken.
    pub async fn create(&self, client_id: &str) -> Result<bool> {
        let hash = self.keys.client(client_id);
        let index = self.keys.client_index();
        let now = epoch_secs();
        let timeout = self.client_timeout;
        let server_id = self.server_id.clone();
        let (added,): (i64,) = self
            .pool
            .with_connection(|mut conn| {
                let hash = hash.clone();
                let index = index.clone();
                let client_id = client_id.to_string();
                let server_id = server_id.clone();
                async move {
                    let stamp = now.to_string();
                    redis::pipe()
                        .atomic()
                        .hset_multiple(
                            &hash,
                            &[
                                ("client_id", client_id.as_str()),
                                ("created_at", stamp.as_str()),
                                ("last_ping", stamp.as_str()),
                                ("server_id", server_id.as_str()),
                            ],
                        )
                        .ignore()
                        .sadd(&index, &client_id)
                        .expire(&hash, timeout as i64)
                        .ignore()
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(added == 1)
    }

    /// Remove the hash and the index membership in one transaction.
    pub async fn destroy(&self, client_id: &str) -> Result<bool> {
        let hash = self.keys.client(client_id);
        let index = self.keys.client_index();
        let (deleted, removed): (i64, i64) = self
            .pool
            .with_connection(|mut conn| {
                let hash = hash.clone();
                let index = index.clone();
                let client_id = client_id.to_string();
                async move {
                    redis::pipe()
                        .atomic()
                        .del(&hash)
                        .srem(&index, &client_id)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(deleted > 0 || removed > 0)
    }

    pub async fn exists(&self, client_id: &str) -> Result<bool> {
        let hash = self.keys.client(client_id);
        self.pool
            .with_connection(|mut conn| {
                let hash = hash.clone();
                async move { conn.exists(&hash).await }
            })
            .await
    }

    /// Heartbeat: refresh `last_ping` and re-arm the liveness TTL.
    pub async fn ping(&self, client_id: &str) -> Result<()> {
        let hash = self.keys.client(client_id);
        let now = epoch_secs();
        let timeout = self.client_timeout;
        self.pool
            .with_connection(|mut conn| {
                let hash = hash.clone();
                async move {
                    redis::pipe()
                        .atomic()
                        .hset(&hash, "last_ping", now.to_string())
                        .ignore()
                        .expire(&hash, timeout as i64)
                        .ignore()
                        .query_async::<()>(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(())
    }

    pub async fn get(&self, client_id: &str) -> Result<Option<ClientRecord>> {
        let hash = self.keys.client(client_id);
        let fields: HashMap<String, String> = self
            .pool
            .with_connection(|mut conn| {
                let hash = hash.clone();
                async move { conn.hgetall(&hash).await }
            })
            .await?;
        Ok(record_from_hash(&fields))
    }

    /// Member ids currently in the index, expired or not.
    pub async fn all(&self) -> Result<Vec<String>> {
        let index = self.keys.client_index();
        self.pool
            .with_connection(|mut conn| {
                let index = index.clone();
                async move { conn.smembers(&index).await }
            })
            .await
    }

    /// Reap index entries whose hash expired; returns how many were reaped.
    /// Every tenth cycle also rebuilds the index from the surviving hashes.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let ids = self.all().await?;
        let mut stale = Vec::new();
        for batch in ids.chunks(EXISTENCE_CHECK_BATCH) {
            let alive: Vec<bool> = self
                .pool
                .with_connection(|mut conn| {
                    let batch: Vec<String> = batch.to_vec();
                    async move {
                        let mut pipe = redis::pipe();
                        for id in &batch {
                            pipe.exists(self.keys.client(id));
                        }
                        pipe.query_async(&mut conn).await
                    }
                })
                .await?;
            stale.extend(
                batch
                    .iter()
                    .zip(alive)
                    .filter(|(_, exists)| !exists)
                    .map(|(id, _)| id.clone()),
            );
        }

        if !stale.is_empty() {
            let index = self.keys.client_index();
            self.pool
                .with_connection(|mut conn| {
                    let index = index.clone();
                    let stale = stale.clone();
                    async move {
                        let mut pipe = redis::pipe();
                        for id in &stale {
                            pipe.srem(&index, id).ignore();
                            pipe.del(self.keys.client(id)).ignore();
                        }
                        pipe.query_async::<()>(&mut conn).await
                    }
                })
                .await?;
            debug!(count = stale.len(), "reaped expired clients from index");
        }

        if self.due_for_repair() {
            self.repair_index().await?;
        }
        Ok(stale.len())
    }

    // Rolling counter; fires every REPAIR_EVERY_N_CYCLES calls and resets.
    fn due_for_repair(&self) -> bool {
        let runs = self.cleanup_runs.fetch_add(1, Ordering::SeqCst) + 1;
        if runs >= REPAIR_EVERY_N_CYCLES {
            self.cleanup_runs.store(0, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Rebuild `clients:index` from the hashes that actually exist.
    async fn repair_index(&self) -> Result<()> {
        let pattern = self.keys.clients_pattern();
        let index = self.keys.client_index();
        let ids: Vec<String> = self
            .pool
            .with_connection(|mut conn| {
                let pattern = pattern.clone();
                async move { scan_keys(&mut conn, &pattern).await }
            })
            .await?
            .iter()
            .filter_map(|key| self.keys.strip_client(key))
            .map(str::to_string)
            .collect();

        self.pool
            .with_connection(|mut conn| {
                let index = index.clone();
                let ids = ids.clone();
                async move {
                    let mut pipe = redis::pipe();
                    pipe.atomic().del(&index).ignore();
                    if !ids.is_empty() {
                        pipe.sadd(&index, ids).ignore();
                    }
                    pipe.query_async::<()>(&mut conn).await
                }
            })
            .await?;
        info!(clients = ids.len(), "rebuilt client index");
        Ok(())
    }
}

fn record_from_hash(fields: &HashMap<String, String>) -> Option<ClientRecord> {
    if fields.is_empty() {
        return None;
    }
    Some(ClientRecord {
        client_id: fields.get("client_id").cloned().unwrap_or_default(),
        created_at: parse_epoch(fields.get("created_at")),
        last_ping: parse_epoch(fields.get("last_ping")),
        server_id: fields.get("server_id").cloned().unwrap_or_default(),
    })
}

fn parse_epoch(field: Option<&String>) -> u64 {
    field.and_then(|value| value.parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn registry() -> ClientRegistry {
        let pool = Arc::new(ConnectionPool::new(&EngineConfig::default()).expect("pool"));
        ClientRegistry::new(pool, Keys::new("faye"), 60, "server-1".into())
    }

    #[test]
    fn repair_fires_every_tenth_cycle() {
        let registry = registry();
        let due: Vec<bool> = (0..20).map(|_| registry.due_for_repair()).collect();
        let fired: Vec<usize> = due
            .iter()
            .enumerate()
            .filter(|(_, fired)| **fired)
            .map(|(cycle, _)| cycle + 1)
            .collect();
        assert_eq!(fired, vec![10, 20]);
    }

    #[test]
    fn record_parses_hash_fields() {
        let mut fields = HashMap::new();
        fields.insert("client_id".to_string(), "c1".to_string());
        fields.insert("created_at".to_string(), "100".to_string());
        fields.insert("last_ping".to_string(), "160".to_string());
        fields.insert("server_id".to_string(), "s1".to_string());
        let record = record_from_hash(&fields).expect("record");
        assert_eq!(record.client_id, "c1");
        assert_eq!(record.created_at, 100);
        assert_eq!(record.last_ping, 160);
        assert_eq!(record.server_id, "s1");
    }

    #[test]
    fn empty_hash_is_no_record() {
        assert_eq!(record_from_hash(&HashMap::new()), None);
    }
}
