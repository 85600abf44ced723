use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use scribe_types::{Result, ScribeError};

use crate::config::StoreConfig;

/// Map `sqlx` failures into the shared error type.
pub(crate) trait StorageResultExt<T> {
    fn storage(self) -> Result<T>;
}

impl<T> StorageResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn storage(self) -> Result<T> {
        self.map_err(ScribeError::storage)
    }
}

/// Open the pool and create the schema (idempotent).
pub async fn connect(config: &StoreConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.database_url)
        .storage()?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    // Memory databases vanish with their last connection, so never recycle it.
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .storage()?;

    init_schema(&pool).await?;
    tracing::debug!(url = %config.database_url, "Database ready");
    Ok(pool)
}

pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_items (
            id                 TEXT    PRIMARY KEY,
            owner_id           TEXT    NOT NULL,
            recipient_name     TEXT    NOT NULL,
            recipient_interest TEXT    NOT NULL,
            template           TEXT    NOT NULL,
            status             TEXT    NOT NULL DEFAULT 'pending',
            current_step       TEXT,
            execution_handle   TEXT,
            result_ref         TEXT,
            error_message      TEXT,
            step_timings       TEXT,
            recovery_count     INTEGER NOT NULL DEFAULT 0,
            created_at         INTEGER NOT NULL,
            started_at         INTEGER,
            completed_at       INTEGER,
            heartbeat_at       INTEGER
        )
        "#,
    )
    .execute(pool)
    .await
    .storage()?;

    // Files created before failed runs kept their timings.
    let (has_timings,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM pragma_table_info('queue_items') WHERE name = 'step_timings'",
    )
    .fetch_one(pool)
    .await
    .storage()?;
    if has_timings == 0 {
        sqlx::query("ALTER TABLE queue_items ADD COLUMN step_timings TEXT")
            .execute(pool)
            .await
            .storage()?;
    }

    for index in [
        "CREATE INDEX IF NOT EXISTS idx_queue_items_status ON queue_items (status)",
        "CREATE INDEX IF NOT EXISTS idx_queue_items_owner_status ON queue_items (owner_id, status)",
        "CREATE INDEX IF NOT EXISTS idx_queue_items_created ON queue_items (created_at, id)",
    ] {
        sqlx::query(index).execute(pool).await.storage()?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            id             TEXT    PRIMARY KEY,
            owner_id       TEXT    NOT NULL,
            queue_item_id  TEXT    NOT NULL,
            recipient_name TEXT    NOT NULL,
            body           TEXT    NOT NULL,
            metadata       TEXT    NOT NULL DEFAULT '{}',
            created_at     INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .storage()?;

    Ok(())
}

/// Timestamps are stored as microseconds since the Unix epoch.
pub(crate) fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub(crate) fn from_micros(us: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| ScribeError::Storage(format!("timestamp out of range: {us}")))
}
