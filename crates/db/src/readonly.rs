//! Read-only query execution for the query agent.
//!
//! This is the agent's only path to the database: rows stream out with a
//! hard cap and a per-query timeout, and the result carries a truncation
//! flag the summarizer must surface. Statement-level safety (SELECT-only)
//! is enforced upstream by the agent's guard; this executor additionally
//! never hands out the write pool.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::TryStreamExt;
use sqlx::{Column, Row};
use thiserror::Error;

use crate::DbPool;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<BTreeMap<String, String>>,
    /// True when the underlying result had more rows than the cap; only the
    /// prefix is returned.
    pub truncated: bool,
}

#[derive(Debug, Error)]
pub enum ReadOnlyError {
    #[error("query timed out")]
    Timeout,
    #[error("query failed: {0}")]
    Execution(String),
}

#[derive(Clone)]
pub struct ReadOnlyExecutor {
    pool: DbPool,
}

impl ReadOnlyExecutor {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn run(
        &self,
        sql: &str,
        row_cap: usize,
        timeout: Duration,
    ) -> Result<QueryRows, ReadOnlyError> {
        match tokio::time::timeout(timeout, self.fetch_capped(sql, row_cap)).await {
            Ok(result) => result,
            Err(_) => Err(ReadOnlyError::Timeout),
        }
    }

    async fn fetch_capped(&self, sql: &str, row_cap: usize) -> Result<QueryRows, ReadOnlyError> {
        let mut stream = sqlx::query(sql).fetch(&self.pool);
        let mut result = QueryRows::default();

        while let Some(row) =
            stream.try_next().await.map_err(|e| ReadOnlyError::Execution(e.to_string()))?
        {
            if result.columns.is_empty() {
                result.columns = row.columns().iter().map(|c| c.name().to_owned()).collect();
            }
            if result.rows.len() == row_cap {
                result.truncated = true;
                break;
            }
            result.rows.push(row_to_map(&row));
        }

        Ok(result)
    }
}

fn row_to_map(row: &sqlx::sqlite::SqliteRow) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (index, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_owned(), value_to_string(row, index));
    }
    map
}

/// SQLite columns are dynamically typed; probe the common decodings in
/// order and fall back to an empty string for NULL.
fn value_to_string(row: &sqlx::sqlite::SqliteRow, index: usize) -> String {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(|v| v.to_string()).unwrap_or_default();
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value.map(|v| v.to_string()).unwrap_or_default();
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.unwrap_or_default();
    }
    String::new()
}
