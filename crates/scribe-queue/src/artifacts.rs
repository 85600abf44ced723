//! Persisted results of successful pipeline runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::sqlite::SqlitePool;
use uuid::Uuid;

use scribe_pipeline::FinalResult;
use scribe_types::{Result, ScribeError};

use crate::db::{from_micros, to_micros, StorageResultExt};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub owner_id: String,
    pub queue_item_id: Uuid,
    pub recipient_name: String,
    pub body: String,
    /// Composer, word count, per-step timings.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist a final result and return the reference stored on the queue item.
    async fn save(
        &self,
        owner_id: &str,
        queue_item_id: Uuid,
        recipient_name: &str,
        result: &FinalResult,
    ) -> Result<String>;

    async fn get(&self, result_ref: &str) -> Result<Option<Artifact>>;
}

pub struct SqliteArtifactStore {
    pool: SqlitePool,
}

impl SqliteArtifactStore {
    /// The pool must come from [`crate::db::connect`], which creates the table.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Split a final result into the email body and the metadata kept beside it.
fn body_and_metadata(result: &FinalResult) -> (String, serde_json::Value) {
    let body = match result.output.get("body").and_then(|b| b.as_str()) {
        Some(body) => body.to_string(),
        None => result.output.to_string(),
    };
    let mut metadata = json!({
        "timings_ms": result.timings_ms(),
        "total_ms": result.total_duration.as_millis() as u64,
    });
    for key in ["composer", "word_count", "template_type", "attempts"] {
        if let Some(value) = result.output.get(key) {
            metadata[key] = value.clone();
        }
    }
    (body, metadata)
}

#[async_trait]
impl ArtifactStore for SqliteArtifactStore {
    async fn save(
        &self,
        owner_id: &str,
        queue_item_id: Uuid,
        recipient_name: &str,
        result: &FinalResult,
    ) -> Result<String> {
        let id = Uuid::new_v4();
        let (body, metadata) = body_and_metadata(result);
        sqlx::query(
            r#"
            INSERT INTO artifacts (id, owner_id, queue_item_id, recipient_name, body, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(owner_id)
        .bind(queue_item_id.to_string())
        .bind(recipient_name)
        .bind(&body)
        .bind(metadata.to_string())
        .bind(to_micros(Utc::now()))
        .execute(&self.pool)
        .await
        .storage()?;
        Ok(id.to_string())
    }

    async fn get(&self, result_ref: &str) -> Result<Option<Artifact>> {
        let row = sqlx::query_as::<_, (String, String, String, String, String, String, i64)>(
            r#"
            SELECT id, owner_id, queue_item_id, recipient_name, body, metadata, created_at
            FROM artifacts
            WHERE id = ?
            "#,
        )
        .bind(result_ref)
        .fetch_optional(&self.pool)
        .await
        .storage()?;

        let Some((id, owner_id, queue_item_id, recipient_name, body, metadata, created_at)) = row
        else {
            return Ok(None);
        };
        Ok(Some(Artifact {
            id: Uuid::parse_str(&id).map_err(ScribeError::storage)?,
            owner_id,
            queue_item_id: Uuid::parse_str(&queue_item_id).map_err(ScribeError::storage)?,
            recipient_name,
            body,
            metadata: serde_json::from_str(&metadata)?,
            created_at: from_micros(created_at)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::db;
    use scribe_types::StepResult;
    use std::time::Duration;

    fn final_result() -> FinalResult {
        let output = json!({
            "body": "Hi Ann, loved the talk.",
            "recipient_name": "Ann",
            "composer": "template",
            "template_type": "general",
            "word_count": 5,
            "attempts": 1,
        });
        FinalResult {
            steps: vec![
                StepResult::succeeded("template_parser", json!({}), Duration::from_millis(3)),
                StepResult::succeeded("email_composer", output.clone(), Duration::from_millis(40)),
            ],
            output,
            total_duration: Duration::from_millis(43),
        }
    }

    #[tokio::test]
    async fn saved_artifact_can_be_read_back() {
        let pool = db::connect(&StoreConfig::in_memory()).await.unwrap();
        let store = SqliteArtifactStore::new(pool);
        let item_id = Uuid::new_v4();

        let result_ref = store.save("owner-a", item_id, "Ann", &final_result()).await.unwrap();
        let artifact = store.get(&result_ref).await.unwrap().unwrap();

        assert_eq!(artifact.queue_item_id, item_id);
        assert_eq!(artifact.body, "Hi Ann, loved the talk.");
        assert_eq!(artifact.metadata["composer"], "template");
        assert_eq!(artifact.metadata["timings_ms"]["email_composer"], 40);
        assert_eq!(artifact.metadata["total_ms"], 43);
    }

    #[tokio::test]
    async fn unknown_reference_is_none() {
        let pool = db::connect(&StoreConfig::in_memory()).await.unwrap();
        let store = SqliteArtifactStore::new(pool);
        assert!(store.get("missing").await.unwrap().is_none());
    }
}
