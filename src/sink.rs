//! Durable, per-chunk atomic persistence.
//!
//! The [`RecordSink`] trait is the seam between the dispatcher and storage.
//! [`SqliteSink`] writes each chunk's batch inside one transaction on a
//! connection acquired for that chunk alone: either every row of the chunk
//! becomes visible or none does. The transaction rolls back when it is
//! dropped, so every early return and every aborted worker leaves the
//! database untouched.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::error::PersistenceError;
use crate::models::{ChunkRange, ParsedRequest, DATETIME_FORMAT};

/// Result of a successful chunk commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub chunk: ChunkRange,
    pub rows: u64,
    /// Ids assigned to the first and last row, in line order.
    pub first_id: Option<i64>,
    pub last_id: Option<i64>,
}

/// Storage backend for parsed requests.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Persist all records of one chunk atomically, in the given order.
    async fn commit(
        &self,
        chunk: &ChunkRange,
        records: Vec<ParsedRequest>,
    ) -> Result<CommitResult, PersistenceError>;
}

pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn write_batch(&self, records: &[ParsedRequest]) -> Result<(u64, Option<i64>, Option<i64>), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let mut first_id = None;
        let mut last_id = None;
        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO requests (ip, method, url, body, referrer, resp_status_code, user_agent, datetime, tags, country)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.ip)
            .bind(&record.method)
            .bind(&record.url)
            .bind(&record.body)
            .bind(&record.referrer)
            .bind(record.resp_status_code)
            .bind(&record.user_agent)
            .bind(record.datetime.format(DATETIME_FORMAT).to_string())
            .bind(record.tags_json())
            .bind(&record.country)
            .execute(&mut *tx)
            .await?;

            let id = result.last_insert_rowid();
            first_id.get_or_insert(id);
            last_id = Some(id);
        }

        tx.commit().await?;
        Ok((records.len() as u64, first_id, last_id))
    }
}

#[async_trait]
impl RecordSink for SqliteSink {
    async fn commit(
        &self,
        chunk: &ChunkRange,
        records: Vec<ParsedRequest>,
    ) -> Result<CommitResult, PersistenceError> {
        if records.is_empty() {
            return Ok(CommitResult {
                chunk: *chunk,
                rows: 0,
                first_id: None,
                last_id: None,
            });
        }

        let (rows, first_id, last_id) = self
            .write_batch(&records)
            .await
            .map_err(|source| PersistenceError {
                chunk: *chunk,
                source,
            })?;

        tracing::debug!(chunk = chunk.index, rows, "chunk committed");
        Ok(CommitResult {
            chunk: *chunk,
            rows,
            first_id,
            last_id,
        })
    }
}
