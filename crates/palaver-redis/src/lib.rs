//! Redis-backed distributed engine for a Bayeux-style pub/sub server.
//!
//! Multiple front-end processes share client identity, subscriptions, and
//! queued messages through one Redis instance: a client connected to any
//! front-end receives every message published to its channels from any
//! front-end. Cross-process delivery rides a single `{ns}:publish:*` pattern
//! subscription per process, with the publisher's own echo dropped through an
//! in-process id set.
//!
//! ```no_run
//! use palaver_common::Message;
//! use palaver_redis::{Engine, EngineConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> palaver_redis::Result<()> {
//! let engine = Engine::new(EngineConfig::default()).await?;
//! let client_id = engine.create_client().await.expect("redis reachable");
//! engine.subscribe(&client_id, "/chat/**").await;
//! engine
//!     .publish(
//!         Message::new("/chat/lobby", json!({"text": "hi"})),
//!         &["/chat/lobby".to_string()],
//!     )
//!     .await;
//! let inbox = engine.empty_queue(&client_id).await;
//! assert_eq!(inbox.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
mod echo;
mod engine;
mod error;
mod keys;
mod logging;
mod pattern;
mod pool;
mod pubsub;
mod queue;
mod registry;
mod scripts;
mod subscription;

pub use config::{EngineConfig, LogLevel};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use keys::Keys;
pub use pool::ConnectionPool;
pub use pubsub::PubSubCoordinator;
pub use queue::MessageQueue;
pub use registry::{ClientRecord, ClientRegistry};
pub use subscription::SubscriptionManager;
