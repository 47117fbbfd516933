use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use leadline_core::domain::message::{InboundMessage, MessageKey, NewInboundMessage};

use super::{IngestReceipt, MessageRepository, RepositoryError};
use crate::DbPool;

pub struct SqlMessageRepository {
    pool: DbPool,
}

impl SqlMessageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<InboundMessage, RepositoryError> {
    let dedup_key: String =
        row.try_get("dedup_key").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let group_id: String =
        row.try_get("group_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let group_name: String =
        row.try_get("group_name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let sender: String =
        row.try_get("sender").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let body: String = row.try_get("body").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let received_at_str: String =
        row.try_get("received_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let received_at = DateTime::parse_from_rfc3339(&received_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("received_at: {e}")))?;

    Ok(InboundMessage {
        dedup_key: MessageKey(dedup_key),
        group_id,
        group_name,
        sender,
        body,
        received_at,
    })
}

#[async_trait]
impl MessageRepository for SqlMessageRepository {
    async fn ingest(&self, message: &NewInboundMessage) -> Result<IngestReceipt, RepositoryError> {
        let key = message.dedup_key();

        let result = sqlx::query(
            "INSERT INTO raw_message (dedup_key, group_id, group_name, sender, body, received_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(dedup_key) DO NOTHING",
        )
        .bind(key.as_str())
        .bind(&message.group_id)
        .bind(&message.group_name)
        .bind(&message.sender)
        .bind(&message.body)
        .bind(message.received_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let is_new = result.rows_affected() == 1;
        let stored = self.find_by_key(&key).await?.ok_or_else(|| {
            RepositoryError::Decode(format!("message `{key}` missing after ingest"))
        })?;

        Ok(IngestReceipt { is_new, stored })
    }

    async fn find_by_key(
        &self,
        key: &MessageKey,
    ) -> Result<Option<InboundMessage>, RepositoryError> {
        let row = sqlx::query(
            "SELECT dedup_key, group_id, group_name, sender, body, received_at
             FROM raw_message WHERE dedup_key = ?",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_message(r)?)),
            None => Ok(None),
        }
    }
}
