use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Dedup key for an inbound message. Provider-assigned when the relay gives
/// us a message id, synthesized otherwise. Synthesized keys carry a `syn-`
/// prefix so the two namespaces cannot collide.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey(pub String);

impl MessageKey {
    pub fn from_provider(message_id: impl Into<String>) -> Self {
        Self(message_id.into())
    }

    /// Derive a key from the payload itself so redelivery of the same
    /// message hashes to the same key. The timestamp is truncated to the
    /// second: relays that retry within the delivery window do not carry
    /// fresh timestamps at sub-second precision.
    pub fn synthesize(
        group_id: &str,
        sender: &str,
        body: &str,
        received_at: DateTime<Utc>,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(group_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(sender.as_bytes());
        hasher.update(&[0]);
        hasher.update(body.as_bytes());
        hasher.update(&[0]);
        hasher.update(received_at.trunc_subsecs(0).to_rfc3339().as_bytes());
        Self(format!("syn-{}", hasher.finalize().to_hex()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An inbound message before it has been durably stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewInboundMessage {
    pub provider_message_id: Option<String>,
    pub group_id: String,
    pub group_name: String,
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl NewInboundMessage {
    pub fn dedup_key(&self) -> MessageKey {
        match self.provider_message_id.as_deref() {
            Some(id) if !id.trim().is_empty() => MessageKey::from_provider(id.trim()),
            _ => MessageKey::synthesize(
                &self.group_id,
                &self.sender,
                &self.body,
                self.received_at,
            ),
        }
    }
}

/// A durably stored inbound message. Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub dedup_key: MessageKey,
    pub group_id: String,
    pub group_name: String,
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}
