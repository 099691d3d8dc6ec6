//! SQLite database connection management.
//!
//! Provides a connection pool with WAL mode enabled. The database file and
//! its parent directories are created automatically if they don't exist.
//!
//! # Concurrent chunk commits
//!
//! Every in-flight chunk holds its own pooled connection for the duration
//! of its transaction, so the pool is sized to at least the worker count.
//! SQLite admits one writer at a time. A generous busy timeout makes
//! concurrent commits queue on the write lock instead of failing with
//! `SQLITE_BUSY`.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

/// Create a connection pool to the configured SQLite database.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(config.db.busy_timeout_secs));

    let max_connections = config.ingest.workers.max(1) as u32 + 1;

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(config.db.busy_timeout_secs.max(30)))
        .connect_with(options)
        .await?;

    Ok(pool)
}
