//! Webhook boundary: payload types for the group-chat relay, the message
//! processor pipeline, and the outbound delivery client.
//!
//! The contract with the relay is strict: a well-formed acknowledgement is
//! always returned promptly, even when classification or the query agent
//! fails internally — failures degrade the reply content, never the ack.

pub mod events;
pub mod processor;
pub mod push;

pub use events::{
    handshake_ack, mentions_bot, Ack, DeliveryPayload, WebhookEnvelope, WebhookEvent,
};
pub use processor::MessageProcessor;
pub use push::{DeliveryClient, DeliveryError, HttpDeliveryClient, NoopDeliveryClient};
