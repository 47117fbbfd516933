use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;

use leadline_core::domain::lead::{Lead, LeadCode, LeadStatus};

use super::{LeadRepository, RepositoryError};
use crate::DbPool;

pub struct SqlLeadRepository {
    pool: DbPool,
}

impl SqlLeadRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn row_to_lead(row: &sqlx::sqlite::SqliteRow) -> Result<Lead, RepositoryError> {
    let code: String = row.try_get("code").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let display_name: String =
        row.try_get("display_name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let phone: Option<String> =
        row.try_get("phone").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let status_str: String =
        row.try_get("status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let deal_amount_str: Option<String> =
        row.try_get("deal_amount").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at_str: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at_str: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let deal_amount = match deal_amount_str {
        Some(raw) => Some(
            raw.parse::<Decimal>()
                .map_err(|e| RepositoryError::Decode(format!("deal_amount: {e}")))?,
        ),
        None => None,
    };

    Ok(Lead {
        code: LeadCode(code),
        display_name,
        phone,
        status: LeadStatus::parse(&status_str),
        deal_amount,
        created_at: parse_timestamp("created_at", &created_at_str)?,
        updated_at: parse_timestamp("updated_at", &updated_at_str)?,
    })
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{field}: {e}")))
}

#[async_trait]
impl LeadRepository for SqlLeadRepository {
    async fn find_by_code(&self, code: &LeadCode) -> Result<Option<Lead>, RepositoryError> {
        let row = sqlx::query(
            "SELECT code, display_name, phone, status, deal_amount, created_at, updated_at
             FROM lead WHERE code = ?",
        )
        .bind(code.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_lead(r)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, lead: Lead) -> Result<(), RepositoryError> {
        // Status always serializes through LeadStatus::as_str, so the
        // neutral marker is the literal `unset`, never a blank.
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
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
