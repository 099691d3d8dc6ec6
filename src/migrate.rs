use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the `requests` table and its indexes. Idempotent.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    // `tags` holds a sorted JSON array; containment is queried through json_each.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip TEXT NOT NULL,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            body TEXT NOT NULL,
            referrer TEXT NOT NULL,
            resp_status_code INTEGER NOT NULL,
            user_agent TEXT NOT NULL,
            datetime TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            country TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_requests_ip ON requests(ip)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_requests_datetime ON requests(datetime)")
        .execute(pool)
        .await?;

    Ok(())
}
