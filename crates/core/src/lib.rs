//! Domain core for the leadline group-chat bot.
//!
//! Everything in this crate is pure and synchronous: message identity and
//! dedup-key derivation, the lead/status model, the template classifier, the
//! reply composer, the error taxonomy, audit events, and configuration.
//! Persistence and I/O live in the sibling crates.

pub mod audit;
pub mod classify;
pub mod compose;
pub mod config;
pub mod domain;
pub mod errors;

pub use classify::{classify, Classification, LedgerSnapshot, TemplateMatch};
pub use compose::{compose, ComposePolicy};
pub use domain::lead::{
    FeedbackRecord, Lead, LeadCode, LeadStatus, ProcessLogEntry, StatusEffect, TemplateCategory,
};
pub use domain::message::{InboundMessage, MessageKey, NewInboundMessage};
pub use errors::{ApplicationError, DomainError, InterfaceError};
