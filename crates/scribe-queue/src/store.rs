//! Durable queue state.
//!
//! [`QueueStore`] is the only place queue items change state. Every write
//! that moves an item out of `processing` is a compare-and-set on the
//! execution handle, so a worker whose claim was reclaimed cannot overwrite
//! the item afterwards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use uuid::Uuid;

use scribe_types::{
    truncate_error_message, QueueItem, QueueItemView, QueueStatus, Result, ScribeError,
    Submission,
};

use crate::config::StoreConfig;
use crate::db::{self, from_micros, to_micros, StorageResultExt};

/// Which processing items a recovery scan treats as orphaned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanScan {
    /// Handles with this prefix were issued under the scanning worker's id.
    /// Only valid while that worker has nothing in flight.
    pub owned_prefix: Option<String>,
    /// Owned items are orphaned once their heartbeat is older than this.
    /// Another process may run under the same worker id, so a matching
    /// prefix alone never proves the run is dead.
    pub owned_stale_before: DateTime<Utc>,
    /// Any item whose last heartbeat is older than this is orphaned.
    pub stale_before: DateTime<Utc>,
    /// Reclaims allowed before an orphan is failed instead of requeued.
    pub max_recoveries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recovered {
    pub id: Uuid,
    /// `true` if put back to pending, `false` if failed as exhausted.
    pub requeued: bool,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert the whole batch as pending, or nothing.
    async fn enqueue_batch(&self, owner_id: &str, items: &[Submission]) -> Result<Vec<Uuid>>;

    /// Atomically move the oldest pending item to processing under `execution_handle`.
    async fn claim_next(&self, execution_handle: &str) -> Result<Option<QueueItem>>;

    /// Record the step now running and refresh the heartbeat.
    async fn mark_processing(&self, id: Uuid, execution_handle: &str, step: &str) -> Result<()>;

    async fn heartbeat(&self, id: Uuid, execution_handle: &str) -> Result<()>;

    async fn mark_completed(&self, id: Uuid, execution_handle: &str, result_ref: &str)
        -> Result<()>;

    /// Fail the run, keeping whatever step timings it produced.
    async fn mark_failed(
        &self,
        id: Uuid,
        execution_handle: &str,
        error: &str,
        timings: &serde_json::Value,
    ) -> Result<()>;

    /// Cancel if and only if the item is pending and owned by `owner_id`.
    async fn cancel_pending(&self, id: Uuid, owner_id: &str) -> Result<bool>;

    async fn get(&self, id: Uuid) -> Result<Option<QueueItem>>;

    /// The owner's live items plus terminal items created since `since`, with positions.
    async fn list_by_owner(&self, owner_id: &str, since: DateTime<Utc>)
        -> Result<Vec<QueueItemView>>;

    async fn recover_orphans(&self, scan: &OrphanScan) -> Result<Vec<Recovered>>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: String,
    owner_id: String,
    recipient_name: String,
    recipient_interest: String,
    template: String,
    status: String,
    current_step: Option<String>,
    execution_handle: Option<String>,
    result_ref: Option<String>,
    error_message: Option<String>,
    step_timings: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl TryFrom<QueueRow> for QueueItem {
    type Error = ScribeError;

    fn try_from(row: QueueRow) -> Result<Self> {
        Ok(QueueItem {
            id: Uuid::parse_str(&row.id).map_err(ScribeError::storage)?,
            owner_id: row.owner_id,
            submission: Submission {
                recipient_name: row.recipient_name,
                recipient_interest: row.recipient_interest,
                template: row.template,
            },
            status: row.status.parse()?,
            current_step: row.current_step,
            execution_handle: row.execution_handle,
            result_ref: row.result_ref,
            error_message: row.error_message,
            step_timings: row
                .step_timings
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?,
            created_at: from_micros(row.created_at)?,
            started_at: row.started_at.map(from_micros).transpose()?,
            completed_at: row.completed_at.map(from_micros).transpose()?,
        })
    }
}

const SELECT_ITEM: &str = r#"
    SELECT id, owner_id, recipient_name, recipient_interest, template, status,
           current_step, execution_handle, result_ref, error_message, step_timings,
           created_at, started_at, completed_at
    FROM queue_items
"#;

/// A row of [`QueueStore::list_by_owner`] with its rank among pending items.
#[derive(sqlx::FromRow)]
struct ListedRow {
    #[sqlx(flatten)]
    row: QueueRow,
    position: Option<i64>,
}

pub struct SqliteQueueStore {
    pool: SqlitePool,
}

impl SqliteQueueStore {
    /// Wrap an initialised pool.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        Ok(Self { pool })
    }

    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let pool = db::connect(config).await?;
        Self::new(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Distinguish a vanished item from a claim that moved on without us.
    async fn lost_claim(&self, id: Uuid) -> ScribeError {
        match self.get(id).await {
            Ok(None) => ScribeError::NotFound { id },
            Ok(Some(_)) => ScribeError::ClaimLost { id },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn enqueue_batch(&self, owner_id: &str, items: &[Submission]) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await.storage()?;
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let id = Uuid::new_v4();
            // The stamp is read under the write lock the insert itself takes,
            // and that lock is held to commit, so concurrent batches never
            // interleave and stamps stay strictly increasing.
            sqlx::query(
                r#"
                INSERT INTO queue_items
                    (id, owner_id, recipient_name, recipient_interest, template, status, created_at)
                VALUES (?, ?, ?, ?, ?, 'pending',
                        max(?, COALESCE((SELECT MAX(created_at) FROM queue_items), 0) + 1))
                "#,
            )
            .bind(id.to_string())
            .bind(owner_id)
            .bind(item.recipient_name.trim())
            .bind(item.recipient_interest.trim())
            .bind(&item.template)
            .bind(to_micros(Utc::now()))
            .execute(&mut *tx)
            .await
            .storage()?;
            ids.push(id);
        }
        tx.commit().await.storage()?;

        tracing::debug!(owner_id, count = ids.len(), "Batch enqueued");
        Ok(ids)
    }

    async fn claim_next(&self, execution_handle: &str) -> Result<Option<QueueItem>> {
        let now = to_micros(Utc::now());
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            UPDATE queue_items
            SET status = 'processing', execution_handle = ?, current_step = NULL,
                started_at = ?, heartbeat_at = ?
            WHERE id = (
                SELECT id FROM queue_items
                WHERE status = 'pending'
                ORDER BY created_at, id
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING id, owner_id, recipient_name, recipient_interest, template, status,
                      current_step, execution_handle, result_ref, error_message, step_timings,
                      created_at, started_at, completed_at
            "#,
        )
        .bind(execution_handle)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .storage()?;

        let item = row.map(QueueItem::try_from).transpose()?;
        if let Some(item) = &item {
            tracing::debug!(item_id = %item.id, execution_handle, "Item claimed");
        }
        Ok(item)
    }

    async fn mark_processing(&self, id: Uuid, execution_handle: &str, step: &str) -> Result<()> {
        let done = sqlx::query(
            r#"
            UPDATE queue_items
            SET current_step = ?, heartbeat_at = ?
            WHERE id = ? AND status = 'processing' AND execution_handle = ?
            "#,
        )
        .bind(step)
        .bind(to_micros(Utc::now()))
        .bind(id.to_string())
        .bind(execution_handle)
        .execute(&self.pool)
        .await
        .storage()?;

        if done.rows_affected() == 0 {
            return Err(self.lost_claim(id).await);
        }
        Ok(())
    }

    async fn heartbeat(&self, id: Uuid, execution_handle: &str) -> Result<()> {
        let done = sqlx::query(
            r#"
            UPDATE queue_items
            SET heartbeat_at = ?
            WHERE id = ? AND status = 'processing' AND execution_handle = ?
            "#,
        )
        .bind(to_micros(Utc::now()))
        .bind(id.to_string())
        .bind(execution_handle)
        .execute(&self.pool)
        .await
        .storage()?;

        if done.rows_affected() == 0 {
            return Err(self.lost_claim(id).await);
        }
        Ok(())
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        execution_handle: &str,
        result_ref: &str,
    ) -> Result<()> {
        QueueStatus::Processing.transition(id, QueueStatus::Completed)?;
        let done = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'completed', result_ref = ?, error_message = NULL,
                execution_handle = NULL, current_step = NULL, heartbeat_at = NULL,
                completed_at = ?
            WHERE id = ? AND status = 'processing' AND execution_handle = ?
            "#,
        )
        .bind(result_ref)
        .bind(to_micros(Utc::now()))
        .bind(id.to_string())
        .bind(execution_handle)
        .execute(&self.pool)
        .await
        .storage()?;

        if done.rows_affected() == 0 {
            return Err(self.lost_claim(id).await);
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        execution_handle: &str,
        error: &str,
        timings: &serde_json::Value,
    ) -> Result<()> {
        QueueStatus::Processing.transition(id, QueueStatus::Failed)?;
        let done = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'failed', error_message = ?, step_timings = ?, result_ref = NULL,
                execution_handle = NULL, current_step = NULL, heartbeat_at = NULL,
                completed_at = ?
            WHERE id = ? AND status = 'processing' AND execution_handle = ?
            "#,
        )
        .bind(truncate_error_message(error))
        .bind(serde_json::to_string(timings)?)
        .bind(to_micros(Utc::now()))
        .bind(id.to_string())
        .bind(execution_handle)
        .execute(&self.pool)
        .await
        .storage()?;

        if done.rows_affected() == 0 {
            return Err(self.lost_claim(id).await);
        }
        Ok(())
    }

    async fn cancel_pending(&self, id: Uuid, owner_id: &str) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'canceled', completed_at = ?
            WHERE id = ? AND owner_id = ? AND status = 'pending'
            "#,
        )
        .bind(to_micros(Utc::now()))
        .bind(id.to_string())
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .storage()?;
        Ok(done.rows_affected() == 1)
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueItem>> {
        let row = sqlx::query_as::<_, QueueRow>(&format!("{SELECT_ITEM} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .storage()?;
        row.map(QueueItem::try_from).transpose()
    }

    async fn list_by_owner(
        &self,
        owner_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<QueueItemView>> {
        // Ranks come from the same statement as the rows, so both see one snapshot.
        let rows = sqlx::query_as::<_, ListedRow>(
            r#"
            WITH ranked AS (
                SELECT id, ROW_NUMBER() OVER (ORDER BY created_at, id) AS position
                FROM queue_items
                WHERE status = 'pending'
            )
            SELECT q.id, q.owner_id, q.recipient_name, q.recipient_interest, q.template,
                   q.status, q.current_step, q.execution_handle, q.result_ref,
                   q.error_message, q.step_timings, q.created_at, q.started_at,
                   q.completed_at, r.position
            FROM queue_items q
            LEFT JOIN ranked r ON r.id = q.id
            WHERE q.owner_id = ?
              AND (q.created_at >= ? OR q.status IN ('pending', 'processing'))
            ORDER BY q.created_at, q.id
            "#,
        )
        .bind(owner_id)
        .bind(to_micros(since))
        .fetch_all(&self.pool)
        .await
        .storage()?;

        rows.into_iter()
            .map(|listed| {
                let position = listed
                    .position
                    .map(|p| u32::try_from(p).map_err(ScribeError::storage))
                    .transpose()?;
                Ok(QueueItem::try_from(listed.row)?.to_view(position))
            })
            .collect()
    }

    async fn recover_orphans(&self, scan: &OrphanScan) -> Result<Vec<Recovered>> {
        let stale_before = to_micros(scan.stale_before);
        let owned_stale_before = to_micros(scan.owned_stale_before);
        let prefix = scan.owned_prefix.as_deref();
        let candidates: Vec<(String, Option<String>, Option<i64>, i64)> = sqlx::query_as(
            r#"
            SELECT id, execution_handle, heartbeat_at, recovery_count
            FROM queue_items
            WHERE status = 'processing'
              AND ((? IS NOT NULL AND substr(execution_handle, 1, length(?)) = ?
                    AND heartbeat_at < ?)
                   OR heartbeat_at IS NULL OR heartbeat_at < ?)
            ORDER BY created_at, id
            "#,
        )
        .bind(prefix)
        .bind(prefix)
        .bind(prefix)
        .bind(owned_stale_before)
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await
        .storage()?;

        let mut recovered = Vec::with_capacity(candidates.len());
        for (raw_id, handle, heartbeat_at, recovery_count) in candidates {
            let id = Uuid::parse_str(&raw_id).map_err(ScribeError::storage)?;
            let requeue = recovery_count < i64::from(scan.max_recoveries);

            // Compare-and-set on handle and heartbeat: a run that heartbeat
            // after the scan read it is alive and must be left alone.
            let done = if requeue {
                QueueStatus::Processing.transition(id, QueueStatus::Pending)?;
                sqlx::query(
                    r#"
                    UPDATE queue_items
                    SET status = 'pending', execution_handle = NULL, current_step = NULL,
                        started_at = NULL, heartbeat_at = NULL,
                        recovery_count = recovery_count + 1
                    WHERE id = ? AND status = 'processing'
                      AND execution_handle IS ? AND heartbeat_at IS ?
                    "#,
                )
                .bind(&raw_id)
                .bind(&handle)
                .bind(heartbeat_at)
                .execute(&self.pool)
                .await
                .storage()?
            } else {
                QueueStatus::Processing.transition(id, QueueStatus::Failed)?;
                sqlx::query(
                    r#"
                    UPDATE queue_items
                    SET status = 'failed', error_message = ?, execution_handle = NULL,
                        current_step = NULL, heartbeat_at = NULL, completed_at = ?
                    WHERE id = ? AND status = 'processing'
                      AND execution_handle IS ? AND heartbeat_at IS ?
                    "#,
                )
                .bind(ScribeError::RecoveryExhausted { id }.to_string())
                .bind(to_micros(Utc::now()))
                .bind(&raw_id)
                .bind(&handle)
                .bind(heartbeat_at)
                .execute(&self.pool)
                .await
                .storage()?
            };

            if done.rows_affected() == 1 {
                tracing::debug!(item_id = %id, handle = ?handle, requeue, "Orphan reclaimed");
                recovered.push(Recovered {
                    id,
                    requeued: requeue,
                });
            }
        }
        Ok(recovered)
    }
}
