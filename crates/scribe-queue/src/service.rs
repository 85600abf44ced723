//! Client-facing queue operations: submit, list, cancel.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use scribe_types::{CancelOutcome, QueueItemView, Result, ScribeError, Submission};

use crate::cancel::CancellationHandler;
use crate::config::BatchLimits;
use crate::store::QueueStore;

/// One recipient of a batch that shares a single template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub name: String,
    pub interest: String,
}

pub struct QueueService {
    store: Arc<dyn QueueStore>,
    cancellation: CancellationHandler,
    limits: BatchLimits,
    wakeup: Arc<Notify>,
}

impl QueueService {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            cancellation: CancellationHandler::new(store.clone()),
            store,
            limits: BatchLimits::default(),
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn with_limits(mut self, limits: BatchLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_wakeup(mut self, wakeup: Arc<Notify>) -> Self {
        self.wakeup = wakeup;
        self
    }

    /// Handle to pass to an in-process dispatcher.
    pub fn wakeup(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }

    /// Validate and persist a batch. Nothing is stored if any item is rejected.
    pub async fn submit_batch(&self, owner_id: &str, items: &[Submission]) -> Result<Vec<Uuid>> {
        self.limits.validate(items)?;
        let ids = self.store.enqueue_batch(owner_id, items).await?;
        tracing::info!(owner_id, count = ids.len(), "Batch submitted");
        self.wakeup.notify_one();
        Ok(ids)
    }

    /// Submit one item per recipient, all sharing `template`.
    pub async fn submit_template_batch(
        &self,
        owner_id: &str,
        template: &str,
        recipients: &[Recipient],
    ) -> Result<Vec<Uuid>> {
        let items: Vec<Submission> = recipients
            .iter()
            .map(|r| Submission {
                recipient_name: r.name.clone(),
                recipient_interest: r.interest.clone(),
                template: template.to_string(),
            })
            .collect();
        self.submit_batch(owner_id, &items).await
    }

    pub async fn list_queue(&self, owner_id: &str) -> Result<Vec<QueueItemView>> {
        let window = chrono::Duration::from_std(self.limits.listing_window)
            .map_err(|e| ScribeError::Other(format!("listing window out of range: {e}")))?;
        self.store.list_by_owner(owner_id, Utc::now() - window).await
    }

    pub async fn cancel(&self, owner_id: &str, id: Uuid) -> Result<CancelOutcome> {
        self.cancellation.cancel(id, owner_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::SqliteQueueStore;
    use scribe_types::{QueueStatus, RejectReason};

    async fn service() -> QueueService {
        let store = SqliteQueueStore::open(&StoreConfig::in_memory()).await.unwrap();
        QueueService::new(Arc::new(store))
    }

    fn recipients(n: usize) -> Vec<Recipient> {
        (0..n)
            .map(|i| Recipient {
                name: format!("Recipient {i}"),
                interest: "information retrieval".into(),
            })
            .collect()
    }

    const TEMPLATE: &str = "Hi {{name}}, I read your paper on {{research}}.";

    #[tokio::test]
    async fn submitted_items_are_listed_pending_with_positions() {
        let svc = service().await;
        let ids = svc
            .submit_template_batch("owner-a", TEMPLATE, &recipients(3))
            .await
            .unwrap();

        let views = svc.list_queue("owner-a").await.unwrap();
        assert_eq!(views.len(), 3);
        for (i, view) in views.iter().enumerate() {
            assert_eq!(view.id, ids[i]);
            assert_eq!(view.status, QueueStatus::Pending);
            assert_eq!(view.position, Some(i as u32 + 1));
        }
        assert!(svc.list_queue("owner-b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_batches_store_nothing() {
        let svc = service().await;
        let err = svc
            .submit_template_batch("owner-a", TEMPLATE, &recipients(101))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), Some(400));

        let mut bad = recipients(2);
        bad[1].interest = "x".into();
        assert!(svc.submit_template_batch("owner-a", TEMPLATE, &bad).await.is_err());
        assert!(svc.list_queue("owner-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn submission_wakes_the_worker() {
        let svc = service().await;
        let wakeup = svc.wakeup();
        svc.submit_template_batch("owner-a", TEMPLATE, &recipients(1))
            .await
            .unwrap();
        // notify_one stores a permit when nobody is waiting yet.
        tokio::time::timeout(std::time::Duration::from_secs(1), wakeup.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_goes_through_the_handler() {
        let svc = service().await;
        let ids = svc
            .submit_template_batch("owner-a", TEMPLATE, &recipients(2))
            .await
            .unwrap();
        assert_eq!(svc.cancel("owner-a", ids[0]).await.unwrap(), CancelOutcome::Canceled);
        assert_eq!(
            svc.cancel("owner-b", ids[1]).await.unwrap(),
            CancelOutcome::Rejected(RejectReason::NotFound)
        );

        let views = svc.list_queue("owner-a").await.unwrap();
        assert_eq!(views[0].status, QueueStatus::Canceled);
        assert_eq!(views[0].position, None);
        assert_eq!(views[1].position, Some(1));
    }
}
