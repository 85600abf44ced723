use std::sync::Arc;

use uuid::Uuid;

use scribe_types::{CancelOutcome, RejectReason, Result};

use crate::store::QueueStore;

/// Cancels pending items on behalf of their owner.
///
/// The store's conditional update is the only write, so a cancel racing a
/// claim either wins outright or sees the claimed status and is rejected.
pub struct CancellationHandler {
    store: Arc<dyn QueueStore>,
}

impl CancellationHandler {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    pub async fn cancel(&self, id: Uuid, owner_id: &str) -> Result<CancelOutcome> {
        if self.store.cancel_pending(id, owner_id).await? {
            tracing::info!(item_id = %id, owner_id, "Queue item canceled");
            return Ok(CancelOutcome::Canceled);
        }

        // Another owner's item is reported as missing, not as a status leak.
        let reason = match self.store.get(id).await? {
            Some(item) if item.owner_id == owner_id => RejectReason::NotCancellable(item.status),
            _ => RejectReason::NotFound,
        };
        tracing::debug!(item_id = %id, owner_id, reason = %reason, "Cancel rejected");
        Ok(CancelOutcome::Rejected(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::SqliteQueueStore;
    use scribe_types::{QueueStatus, Submission};

    async fn setup() -> (Arc<SqliteQueueStore>, CancellationHandler, Vec<Uuid>) {
        let store = Arc::new(SqliteQueueStore::open(&StoreConfig::in_memory()).await.unwrap());
        let items = vec![
            Submission {
                recipient_name: "Ann".into(),
                recipient_interest: "databases".into(),
                template: "Hello {{name}}, quick question.".into(),
            };
            2
        ];
        let ids = store.enqueue_batch("owner-a", &items).await.unwrap();
        (store.clone(), CancellationHandler::new(store), ids)
    }

    #[tokio::test]
    async fn pending_item_is_canceled() {
        let (store, handler, ids) = setup().await;
        assert_eq!(handler.cancel(ids[1], "owner-a").await.unwrap(), CancelOutcome::Canceled);
        let item = store.get(ids[1]).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Canceled);
    }

    #[tokio::test]
    async fn processing_item_is_never_cancellable() {
        let (store, handler, ids) = setup().await;
        store.claim_next("w1/r1").await.unwrap();

        for _ in 0..2 {
            assert_eq!(
                handler.cancel(ids[0], "owner-a").await.unwrap(),
                CancelOutcome::Rejected(RejectReason::NotCancellable(QueueStatus::Processing))
            );
        }
        let item = store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Processing);
        item.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn unknown_or_foreign_items_are_not_found() {
        let (_store, handler, ids) = setup().await;
        assert_eq!(
            handler.cancel(Uuid::new_v4(), "owner-a").await.unwrap(),
            CancelOutcome::Rejected(RejectReason::NotFound)
        );
        assert_eq!(
            handler.cancel(ids[0], "owner-b").await.unwrap(),
            CancelOutcome::Rejected(RejectReason::NotFound)
        );
    }

    #[tokio::test]
    async fn second_cancel_is_rejected() {
        let (_store, handler, ids) = setup().await;
        handler.cancel(ids[0], "owner-a").await.unwrap();
        assert_eq!(
            handler.cancel(ids[0], "owner-a").await.unwrap(),
            CancelOutcome::Rejected(RejectReason::NotCancellable(QueueStatus::Canceled))
        );
    }
}
