use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use leadline_core::domain::lead::{Lead, LeadCode};
use leadline_core::domain::message::{InboundMessage, MessageKey, NewInboundMessage};

use super::{IngestReceipt, LeadRepository, MessageRepository, RepositoryError};

/// In-memory message store with the same at-most-once semantics as the SQL
/// implementation. Used by processor tests that do not need a database.
#[derive(Default)]
pub struct InMemoryMessageRepository {
    messages: RwLock<HashMap<String, InboundMessage>>,
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn ingest(&self, message: &NewInboundMessage) -> Result<IngestReceipt, RepositoryError> {
        let key = message.dedup_key();
        let mut messages = self.messages.write().await;

        if let Some(existing) = messages.get(key.as_str()) {
            return Ok(IngestReceipt { is_new: false, stored: existing.clone() });
        }

        let stored = InboundMessage {
            dedup_key: key.clone(),
            group_id: message.group_id.clone(),
            group_name: message.group_name.clone(),
            sender: message.sender.clone(),
            body: message.body.clone(),
            received_at: message.received_at,
        };
        messages.insert(key.0.clone(), stored.clone());
        Ok(IngestReceipt { is_new: true, stored })
    }

    async fn find_by_key(
        &self,
        key: &MessageKey,
    ) -> Result<Option<InboundMessage>, RepositoryError> {
        let messages = self.messages.read().await;
        Ok(messages.get(key.as_str()).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryLeadRepository {
    leads: RwLock<HashMap<String, Lead>>,
}

#[async_trait]
impl LeadRepository for InMemoryLeadRepository {
    async fn find_by_code(&self, code: &LeadCode) -> Result<Option<Lead>, RepositoryError> {
        let leads = self.leads.read().await;
        Ok(leads.get(code.as_str()).cloned())
    }

    async fn save(&self, lead: Lead) -> Result<(), RepositoryError> {
        let mut leads = self.leads.write().await;
        leads.insert(lead.code.0.clone(), lead);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use leadline_core::domain::lead::{Lead, LeadCode, LeadStatus};
    use leadline_core::domain::message::NewInboundMessage;

    use super::{InMemoryLeadRepository, InMemoryMessageRepository};
    use crate::repositories::{LeadRepository, MessageRepository};

    #[tokio::test]
    async fn in_memory_ingest_is_idempotent() {
        let repo = InMemoryMessageRepository::default();
        let message = NewInboundMessage {
            provider_message_id: Some("m-42".to_owned()),
            group_id: "G-1".to_owned(),
            group_name: String::new(),
            sender: "SM_小赵".to_owned(),
            body: "hello".to_owned(),
            received_at: Utc.with_ymd_and_hms(2026, 8, 7, 9, 0, 0).unwrap(),
        };

        let first = repo.ingest(&message).await.expect("first");
        let second = repo.ingest(&message).await.expect("second");

        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.stored, second.stored);
    }

    #[tokio::test]
    async fn in_memory_lead_repo_round_trip() {
        let repo = InMemoryLeadRepository::default();
        let now = Utc::now();
        let lead = Lead {
            code: LeadCode("L202608070001".to_owned()),
            display_name: "小明".to_owned(),
            phone: None,
            status: LeadStatus::Unset,
            deal_amount: None,
            created_at: now,
            updated_at: now,
        };

        repo.save(lead.clone()).await.expect("save");
        let found = repo.find_by_code(&lead.code).await.expect("find");
        assert_eq!(found, Some(lead));
    }
}
