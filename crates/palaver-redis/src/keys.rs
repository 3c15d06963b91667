// Redis key schema. Every key is namespace-prefixed so multiple deployments
// can share one Redis instance, and the shapes below are load-bearing:
// engines from different processes interoperate by agreeing on them exactly.
//
//   {ns}:clients:{cid}              hash    client record, TTL client_timeout
//   {ns}:clients:index              set     known client ids
//   {ns}:subscriptions:{cid}        set     channels the client subscribed to
//   {ns}:channels:{channel}         set     client ids subscribed to the channel
//   {ns}:subscription:{cid}:{ch}    hash    per-subscription record
//   {ns}:patterns                   set     wildcard channels
//   {ns}:messages:{cid}             list    queued JSON messages, TTL message_ttl
//   {ns}:publish:{channel}          pub/sub fan-out key

#[derive(Debug, Clone)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn client(&self, client_id: &str) -> String {
        format!("{}:clients:{client_id}", self.namespace)
    }

    pub fn client_index(&self) -> String {
        format!("{}:clients:index", self.namespace)
    }

    pub fn subscriptions(&self, client_id: &str) -> String {
        format!("{}:subscriptions:{client_id}", self.namespace)
    }

    pub fn channel(&self, channel: &str) -> String {
        format!("{}:channels:{channel}", self.namespace)
    }

    pub fn subscription(&self, client_id: &str, channel: &str) -> String {
        format!("{}:subscription:{client_id}:{channel}", self.namespace)
    }

    pub fn patterns(&self) -> String {
        format!("{}:patterns", self.namespace)
    }

    pub fn messages(&self, client_id: &str) -> String {
        format!("{}:messages:{client_id}", self.namespace)
    }

    pub fn publish(&self, channel: &str) -> String {
        format!("{}:publish:{channel}", self.namespace)
    }

    // Scan/subscribe patterns over the families above.

    pub fn publish_pattern(&self) -> String {
        format!("{}:publish:*", self.namespace)
    }

    pub fn clients_pattern(&self) -> String {
        format!("{}:clients:*", self.namespace)
    }

    pub fn subscriptions_pattern(&self) -> String {
        format!("{}:subscriptions:*", self.namespace)
    }

    pub fn channels_pattern(&self) -> String {
        format!("{}:channels:*", self.namespace)
    }

    pub fn messages_pattern(&self) -> String {
        format!("{}:messages:*", self.namespace)
    }

    /// Recover the logical channel from a pub/sub key received off the wire.
    pub fn strip_publish<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.namespace)
            .and_then(|rest| rest.strip_prefix(":publish:"))
    }

    /// Recover the client id from a `clients:{cid}` key, skipping the index.
    pub fn strip_client<'a>(&self, key: &'a str) -> Option<&'a str> {
        let id = key
            .strip_prefix(&self.namespace)
            .and_then(|rest| rest.strip_prefix(":clients:"))?;
        (id != "index").then_some(id)
    }

    pub fn strip_subscriptions<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.namespace)
            .and_then(|rest| rest.strip_prefix(":subscriptions:"))
    }

    pub fn strip_channel<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.namespace)
            .and_then(|rest| rest.strip_prefix(":channels:"))
    }

    pub fn strip_messages<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.namespace)
            .and_then(|rest| rest.strip_prefix(":messages:"))
    }
}
