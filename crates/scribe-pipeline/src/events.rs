//! Progress reporting for pipeline runs.
//!
//! The runner reports every step transition to a [`ProgressSink`]. The queue
//! worker's sink writes `current_step` onto the queue item; the
//! [`EventEmitter`] fans events out over a [`tokio::sync::broadcast`] channel
//! so observers (loggers, the CLI) can follow along without coupling to the
//! worker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use scribe_types::StepStatus;

/// One step transition reported by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub item_id: Uuid,
    pub step: String,
    pub status: StepStatus,
    /// Set once the step has finished.
    pub duration_ms: Option<u64>,
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Receive a progress event. Sinks log their own failures; reporting never aborts a run.
    async fn report(&self, event: ProgressEvent);
}

/// Sink that drops every event.
pub struct NoopSink;

#[async_trait]
impl ProgressSink for NoopSink {
    async fn report(&self, _event: ProgressEvent) {}
}

/// Events emitted over the life of a queue item's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    ItemClaimed {
        item_id: Uuid,
        execution_handle: String,
    },
    Step(ProgressEvent),
    ItemCompleted {
        item_id: Uuid,
        result_ref: String,
        duration_ms: u64,
    },
    ItemFailed {
        item_id: Uuid,
        error: String,
    },
    ItemRecovered {
        item_id: Uuid,
        requeued: bool,
    },
}

/// Fans [`PipelineEvent`]s out to every live subscriber.
///
/// Clones share one channel. A subscriber that falls more than `capacity`
/// events behind skips ahead and sees `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to current subscribers. Events published while nobody listens are lost.
    pub fn emit(&self, event: PipelineEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("Pipeline event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ProgressSink for EventEmitter {
    async fn report(&self, event: ProgressEvent) {
        self.emit(PipelineEvent::Step(event));
    }
}
