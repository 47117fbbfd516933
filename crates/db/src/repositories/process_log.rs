use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use leadline_core::domain::lead::{FeedbackRecord, LeadCode, ProcessLogEntry, TemplateCategory};
use leadline_core::domain::message::MessageKey;

use super::{ProcessLogRepository, RepositoryError};
use crate::DbPool;

pub struct SqlProcessLogRepository {
    pool: DbPool,
}

impl SqlProcessLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<ProcessLogEntry, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let lead_code: String =
        row.try_get("lead_code").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let category_str: String =
        row.try_get("category").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let message_key: String =
        row.try_get("message_key").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let applied_at_str: String =
        row.try_get("applied_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let category = TemplateCategory::parse(&category_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown category `{category_str}`")))?;
    let applied_at = DateTime::parse_from_rfc3339(&applied_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("applied_at: {e}")))?;

    Ok(ProcessLogEntry {
        id,
        lead_code: LeadCode(lead_code),
        category,
        message_key: MessageKey(message_key),
        applied_at,
    })
}

fn row_to_feedback(row: &sqlx::sqlite::SqliteRow) -> Result<FeedbackRecord, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let lead_code: String =
        row.try_get("lead_code").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let message_key: String =
        row.try_get("message_key").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let body: String = row.try_get("body").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let recorded_at_str: String =
        row.try_get("recorded_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let recorded_at = DateTime::parse_from_rfc3339(&recorded_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("recorded_at: {e}")))?;

    Ok(FeedbackRecord {
        id,
        lead_code: LeadCode(lead_code),
        message_key: MessageKey(message_key),
        body,
        recorded_at,
    })
}

#[async_trait]
impl ProcessLogRepository for SqlProcessLogRepository {
    async fn append(&self, entry: ProcessLogEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO process_log (id, lead_code, category, message_key, applied_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(entry.lead_code.as_str())
        .bind(entry.category.as_str())
        .bind(entry.message_key.as_str())
        .bind(entry.applied_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_lead(
        &self,
        code: &LeadCode,
    ) -> Result<Vec<ProcessLogEntry>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT id, lead_code, category, message_key, applied_at
             FROM process_log WHERE lead_code = ? ORDER BY applied_at ASC, id ASC",
        )
        .bind(code.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn count_for_message(&self, key: &MessageKey) -> Result<i64, RepositoryError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM process_log WHERE message_key = ?")
                .bind(key.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn append_feedback(&self, record: FeedbackRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO feedback (id, lead_code, message_key, body, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(record.lead_code.as_str())
        .bind(record.message_key.as_str())
        .bind(&record.body)
        .bind(record.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_feedback_for_lead(
        &self,
        code: &LeadCode,
    ) -> Result<Vec<FeedbackRecord>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT id, lead_code, message_key, body, recorded_at
             FROM feedback WHERE lead_code = ? ORDER BY recorded_at ASC, id ASC",
        )
        .bind(code.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_feedback).collect()
    }
}
