use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use leadline_core::domain::message::NewInboundMessage;

/// Raw message-delivery payload as the relay posts it. Field names follow
/// the WorkTool callback shape.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DeliveryPayload {
    #[serde(rename = "messageId")]
    pub message_id: Option<String>,
    #[serde(rename = "groupId")]
    pub group_id: Option<String>,
    #[serde(rename = "groupName")]
    pub group_name: Option<String>,
    #[serde(rename = "receivedName")]
    pub sender: Option<String>,
    #[serde(rename = "rawSpoken")]
    pub text: Option<String>,
    /// Relays send this as a bool or the strings "true"/"false".
    #[serde(rename = "atMe")]
    pub at_me: Option<Value>,
    /// Epoch seconds when the sender sent the message, if the relay
    /// carries it; ingestion time otherwise.
    pub timestamp: Option<i64>,
}

impl DeliveryPayload {
    pub fn at_bot(&self) -> bool {
        match &self.at_me {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(raw)) => raw.trim().eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn sent_at(&self, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or(fallback)
    }

    pub fn into_message(self, received_at: DateTime<Utc>) -> NewInboundMessage {
        let received_at = self.sent_at(received_at);
        NewInboundMessage {
            provider_message_id: self.message_id,
            group_id: self.group_id.unwrap_or_default(),
            group_name: self.group_name.unwrap_or_default(),
            sender: self.sender.unwrap_or_default(),
            body: self.text.unwrap_or_default(),
            received_at,
        }
    }
}

#[derive(Clone, Debug)]
pub enum WebhookEvent {
    /// Connectivity probe; answered with the static handshake payload.
    HandshakeProbe,
    Delivery { message: NewInboundMessage, at_bot: bool },
}

#[derive(Clone, Debug)]
pub struct WebhookEnvelope {
    pub envelope_id: String,
    pub event: WebhookEvent,
}

impl WebhookEnvelope {
    pub fn delivery(
        envelope_id: impl Into<String>,
        payload: DeliveryPayload,
        received_at: DateTime<Utc>,
    ) -> Self {
        let at_bot = payload.at_bot();
        Self {
            envelope_id: envelope_id.into(),
            event: WebhookEvent::Delivery { message: payload.into_message(received_at), at_bot },
        }
    }
}

/// The acknowledgement returned for every delivery. Always well-formed;
/// `content` carries the reply text when there is one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    /// False only for retryable faults (storage unavailable), so the
    /// upstream relay redelivers and dedup makes the retry harmless.
    pub success: bool,
    /// Whether the message produced a business action or an answer.
    pub handled: bool,
    pub content: Option<String>,
}

impl Ack {
    pub fn no_op() -> Self {
        Self { success: true, handled: false, content: None }
    }

    pub fn replied(content: impl Into<String>) -> Self {
        Self { success: true, handled: true, content: Some(content.into()) }
    }

    pub fn retryable() -> Self {
        Self { success: false, handled: false, content: None }
    }
}

/// Static acknowledgement for handshake probes.
pub fn handshake_ack() -> Value {
    json!({ "status": "ok", "message": "接口正常" })
}

const BOT_MENTIONS: &[&str] = &["@机器人", "@robot", "@智能助手", "@助手", "@小助手"];

pub fn mentions_bot(text: &str) -> bool {
    let lower = text.to_lowercase();
    BOT_MENTIONS.iter().any(|pattern| lower.contains(&pattern.to_lowercase()))
}

/// Drop one leading `@某某` mention so the agent sees the bare question.
pub fn strip_leading_mention(text: &str) -> &str {
    let trimmed = text.trim_start();
    let Some(rest) = trimmed.strip_prefix('@') else {
        return trimmed;
    };
    match rest.find(char::is_whitespace) {
        Some(pos) => rest[pos..].trim_start(),
        None => "",
    }
}
