use async_trait::async_trait;
use thiserror::Error;

use leadline_core::domain::lead::{FeedbackRecord, Lead, LeadCode, ProcessLogEntry};
use leadline_core::domain::message::{InboundMessage, MessageKey, NewInboundMessage};

pub mod lead;
pub mod memory;
pub mod message;
pub mod process_log;

pub use lead::SqlLeadRepository;
pub use memory::{InMemoryLeadRepository, InMemoryMessageRepository};
pub use message::SqlMessageRepository;
pub use process_log::SqlProcessLogRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Result of ingesting one inbound message. `is_new` is false when the
/// dedup key had already been stored; the previously stored row is returned
/// either way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestReceipt {
    pub is_new: bool,
    pub stored: InboundMessage,
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// At-most-once effective write keyed on the dedup key. Storage faults
    /// are retryable: the caller must not advance to classification until
    /// this succeeds.
    async fn ingest(&self, message: &NewInboundMessage) -> Result<IngestReceipt, RepositoryError>;

    async fn find_by_key(&self, key: &MessageKey)
        -> Result<Option<InboundMessage>, RepositoryError>;
}

#[async_trait]
pub trait LeadRepository: Send + Sync {
    async fn find_by_code(&self, code: &LeadCode) -> Result<Option<Lead>, RepositoryError>;
    async fn save(&self, lead: Lead) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ProcessLogRepository: Send + Sync {
    async fn append(&self, entry: ProcessLogEntry) -> Result<(), RepositoryError>;
    async fn list_for_lead(&self, code: &LeadCode) -> Result<Vec<ProcessLogEntry>, RepositoryError>;
    async fn count_for_message(&self, key: &MessageKey) -> Result<i64, RepositoryError>;
    async fn append_feedback(&self, record: FeedbackRecord) -> Result<(), RepositoryError>;
    async fn list_feedback_for_lead(
        &self,
        code: &LeadCode,
    ) -> Result<Vec<FeedbackRecord>, RepositoryError>;
}
