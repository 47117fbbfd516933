//! The Lead Ledger write path.
//!
//! All lead mutations flow through `LeadLedger::apply`: it resolves (or, for
//! new-contact templates, creates) the lead, applies the category's status
//! effect, and records the immutable process-log entry — plus the feedback
//! row for feedback templates — in a single transaction. Updates to the same
//! lead code are serialized through an async lock registry; updates to
//! different leads do not coordinate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use leadline_core::classify::{LedgerSnapshot, TemplateMatch};
use leadline_core::domain::lead::{
    FeedbackRecord, Lead, LeadCode, LeadStatus, ProcessLogEntry, StatusEffect, TemplateCategory,
};
use leadline_core::domain::message::InboundMessage;
use leadline_core::errors::{ApplicationError, DomainError};

use crate::repositories::lead::row_to_lead;
use crate::repositories::{LeadRepository, RepositoryError, SqlLeadRepository};
use crate::DbPool;

/// Everything written by one successful apply.
#[derive(Clone, Debug)]
pub struct AppliedEntry {
    pub lead: Lead,
    pub entry: ProcessLogEntry,
    pub feedback: Option<FeedbackRecord>,
    /// True when this apply created the lead.
    pub created: bool,
}

#[derive(Default)]
struct LockRegistry {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    fn lock_for(&self, code: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(code.to_owned()).or_default().clone()
    }
}

pub struct LeadLedger {
    pool: DbPool,
    leads: SqlLeadRepository,
    locks: LockRegistry,
}

enum ApplyFailure {
    Domain(DomainError),
    Db(sqlx::Error),
    Decode(String),
}

impl From<sqlx::Error> for ApplyFailure {
    fn from(value: sqlx::Error) -> Self {
        Self::Db(value)
    }
}

impl LeadLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { leads: SqlLeadRepository::new(pool.clone()), pool, locks: LockRegistry::default() }
    }

    /// Snapshot of the lead referenced by `text`, for state-gated
    /// classification rules.
    pub async fn snapshot_for(&self, text: &str) -> Result<LedgerSnapshot, RepositoryError> {
        let mut snapshot = LedgerSnapshot::empty();
        if let Some(code) = leadline_core::classify::extract_lead_code(text) {
            if let Some(lead) = self.leads.find_by_code(&LeadCode(code.clone())).await? {
                snapshot.insert(code, lead.status);
            }
        }
        Ok(snapshot)
    }

    pub async fn apply(
        &self,
        matched: &TemplateMatch,
        message: &InboundMessage,
    ) -> Result<AppliedEntry, ApplicationError> {
        let code = self.resolve_code(matched).await?;
        let guard = self.locks.lock_for(code.as_str());
        let _held = guard.lock().await;

        match self.apply_once(&code, matched, message).await {
            Ok(applied) => Ok(applied),
            Err(ApplyFailure::Domain(error)) => Err(error.into()),
            Err(ApplyFailure::Decode(message)) => Err(ApplicationError::Persistence(message)),
            Err(ApplyFailure::Db(first)) => {
                tracing::warn!(
                    event_name = "ledger.apply.retry",
                    lead_code = %code,
                    error = %first,
                    "ledger write failed; retrying once with fresh state"
                );
                match self.apply_once(&code, matched, message).await {
                    Ok(applied) => Ok(applied),
                    Err(ApplyFailure::Domain(error)) => Err(error.into()),
                    Err(_) => Err(ApplicationError::LedgerConflict(code.0)),
                }
            }
        }
    }

    async fn resolve_code(&self, matched: &TemplateMatch) -> Result<LeadCode, ApplicationError> {
        if let Some(code) = &matched.fields.lead_code {
            return Ok(LeadCode(code.clone()));
        }
        if matched.category != TemplateCategory::NewContact {
            return Err(DomainError::MissingField {
                category: matched.category.as_str(),
                field: "lead_code",
            }
            .into());
        }
        // Generated codes can collide on the 4-digit suffix; probe a few
        // times before giving up.
        for _ in 0..5 {
            let candidate = LeadCode::generate(Utc::now());
            let existing = self
                .leads
                .find_by_code(&candidate)
                .await
                .map_err(|e| ApplicationError::Persistence(e.to_string()))?;
            if existing.is_none() {
                return Ok(candidate);
            }
        }
        Err(ApplicationError::Persistence("could not allocate a fresh lead code".to_owned()))
    }

    async fn apply_once(
        &self,
        code: &LeadCode,
        matched: &TemplateMatch,
        message: &InboundMessage,
    ) -> Result<AppliedEntry, ApplyFailure> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Referential integrity is enforced at this boundary, not assumed:
        // the process log must reference a stored message.
        let message_present: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM raw_message WHERE dedup_key = ?")
                .bind(message.dedup_key.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        if message_present.is_none() {
            return Err(ApplyFailure::Domain(DomainError::InvariantViolation(format!(
                "message `{}` is not stored",
                message.dedup_key
            ))));
        }

        let row = sqlx::query(
            "SELECT code, display_name, phone, status, deal_amount, created_at, updated_at
             FROM lead WHERE code = ?",
        )
        .bind(code.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let (mut lead, created) = match row {
            Some(ref r) => {
                let lead = row_to_lead(r).map_err(|e| ApplyFailure::Decode(e.to_string()))?;
                (lead, false)
            }
            None if matched.category == TemplateCategory::NewContact => (
                Lead {
                    code: code.clone(),
                    display_name: String::new(),
                    phone: None,
                    status: LeadStatus::Unset,
                    deal_amount: None,
                    created_at: now,
                    updated_at: now,
                },
                true,
            ),
            None => return Err(ApplyFailure::Domain(DomainError::UnknownLead(code.0.clone()))),
        };

        if let Some(name) = &matched.fields.display_name {
            lead.display_name = name.clone();
        }
        if let Some(phone) = &matched.fields.phone {
            lead.phone = Some(phone.clone());
        }
        if matched.category == TemplateCategory::DealClosed {
            if let Some(amount) = matched.fields.deal_amount {
                lead.deal_amount = Some(amount);
            }
        }
        // Last-write-wins on the row; history lands in the process log.
        // `NoChange` leaves whatever status is there, including the `unset`
        // marker — never a blank.
        if let StatusEffect::Set(status) = matched.category.status_effect() {
            lead.status = status;
        }
        lead.updated_at = now;

        sqlx::query(
            "INSERT INTO lead (code, display_name, phone, status, deal_amount, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(code) DO UPDATE SET
                 display_name = excluded.display_name,
                 phone = excluded.phone,
                 status = excluded.status,
                 deal_amount = excluded.deal_amount,
                 updated_at = excluded.updated_at",
        )
        .bind(lead.code.as_str())
        .bind(&lead.display_name)
        .bind(&lead.phone)
        .bind(lead.status.as_str())
        .bind(lead.deal_amount.map(|d| d.to_string()))
        .bind(lead.created_at.to_rfc3339())
        .bind(lead.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let entry = ProcessLogEntry {
            id: Uuid::new_v4().to_string(),
            lead_code: code.clone(),
            category: matched.category,
            message_key: message.dedup_key.clone(),
            applied_at: now,
        };
        sqlx::query(
            "INSERT INTO process_log (id, lead_code, category, message_key, applied_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(entry.lead_code.as_str())
        .bind(entry.category.as_str())
        .bind(entry.message_key.as_str())
        .bind(entry.applied_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let feedback = if matched.category == TemplateCategory::Feedback {
            let body = matched
                .fields
                .note
                .clone()
                .or_else(|| matched.fields.reason.clone())
                .unwrap_or_else(|| message.body.trim().to_owned());
            let record = FeedbackRecord {
                id: Uuid::new_v4().to_string(),
                lead_code: code.clone(),
                message_key: message.dedup_key.clone(),
                body,
                recorded_at: now,
            };
            sqlx::query(
                "INSERT INTO feedback (id, lead_code, message_key, body, recorded_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&record.id)
            .bind(record.lead_code.as_str())
            .bind(record.message_key.as_str())
            .bind(&record.body)
            .bind(record.recorded_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            Some(record)
        } else {
            None
        };

        tx.commit().await?;

        Ok(AppliedEntry { lead, entry, feedback, created })
    }
}
