// Shared boundary types for the palaver messaging backend.
// The protocol layer hands these to the engine; the engine serializes them
// to JSON whenever they cross Redis.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A Bayeux-style message as seen at the engine boundary.
///
/// Only `channel` is required. `data` defaults to JSON `null`, and any field
/// the protocol layer attaches beyond the known ones (`ext`, `advice`, ...)
/// is preserved through the flattened map so it survives the Redis hop
/// untouched.
///
/// ```
/// use palaver_common::Message;
/// use serde_json::json;
///
/// let mut message = Message::new("/chat/lobby", json!({"text": "hi"}));
/// let id = message.ensure_id().to_string();
/// assert_eq!(message.id.as_deref(), Some(id.as_str()));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub channel: String,
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    // Unknown protocol fields round-trip through here.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(channel: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            data,
            client_id: None,
            id: None,
            extra: Map::new(),
        }
    }

    /// Assign a fresh UUIDv4 id if the message has none, returning the id.
    pub fn ensure_id(&mut self) -> &str {
        if self.id.is_none() {
            self.id = Some(Uuid::new_v4().to_string());
        }
        self.id.as_deref().expect("id just ensured")
    }
}

pub mod channel {
    //! Channel-name helpers shared by the engine and the protocol layer.

    /// A channel containing `*` is a wildcard pattern, not a concrete topic.
    pub fn is_pattern(name: &str) -> bool {
        name.contains('*')
    }

    /// Segments of a channel name, excluding the empty leading segment
    /// produced by the conventional `/` prefix.
    pub fn segments(name: &str) -> impl Iterator<Item = &str> {
        name.split('/').filter(|segment| !segment.is_empty())
    }
}
