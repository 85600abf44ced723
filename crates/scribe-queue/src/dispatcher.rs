//! The worker loop: one claimed item at a time, run to a recorded outcome.
//!
//! A [`Dispatcher`] owns a single execution slot. Each iteration claims the
//! oldest pending item, runs the pipeline on a spawned task under the
//! configured wall-clock ceiling, persists the artifact on success, and
//! writes the terminal status. While the run is in flight the only queue
//! writes are progress (`current_step`) and heartbeats.
//!
//! Orphan recovery runs at startup and then periodically, always between
//! items. It covers claims under this worker id whose heartbeat stopped for
//! two intervals, and any claim whose heartbeat is older than `orphan_after`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinError, JoinHandle};
use uuid::Uuid;

use scribe_pipeline::{
    EventEmitter, FinalResult, PipelineContext, PipelineEvent, PipelineRunner, ProgressEvent,
    ProgressSink,
};
use scribe_types::{QueueItem, Result, ScribeError, StepStatus};

use crate::artifacts::ArtifactStore;
use crate::config::WorkerConfig;
use crate::store::{OrphanScan, QueueStore, Recovered};

/// How a claimed item ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed { id: Uuid, result_ref: String },
    Failed { id: Uuid, error: String },
    /// The run finished but its outcome could not be written, usually
    /// because the claim was reclaimed in the meantime.
    Unrecorded { id: Uuid, error: String },
}

impl ItemOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            ItemOutcome::Completed { id, .. }
            | ItemOutcome::Failed { id, .. }
            | ItemOutcome::Unrecorded { id, .. } => *id,
        }
    }
}

// ---------------------------------------------------------------------------
// StoreProgressSink: progress onto the queue row
// ---------------------------------------------------------------------------

/// Finished steps and their durations.
type StepTrail = Arc<Mutex<serde_json::Map<String, serde_json::Value>>>;

struct StoreProgressSink {
    store: Arc<dyn QueueStore>,
    events: EventEmitter,
    item_id: Uuid,
    execution_handle: String,
    trail: StepTrail,
}

#[async_trait]
impl ProgressSink for StoreProgressSink {
    async fn report(&self, event: ProgressEvent) {
        let write = if event.status == StepStatus::Started {
            self.store
                .mark_processing(self.item_id, &self.execution_handle, &event.step)
                .await
        } else {
            self.store.heartbeat(self.item_id, &self.execution_handle).await
        };
        if let Err(e) = write {
            tracing::warn!(item_id = %self.item_id, step = %event.step, error = %e, "Progress write failed");
        }
        if let Some(duration_ms) = event.duration_ms {
            self.trail
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(event.step.clone(), duration_ms.into());
        }
        self.events.emit(PipelineEvent::Step(event));
    }
}

/// Durations of the steps that finished, and wall-clock time since the claim.
fn run_timings(trail: &StepTrail, started: Instant) -> serde_json::Value {
    let steps = trail.lock().unwrap_or_else(|e| e.into_inner()).clone();
    serde_json::json!({
        "timings_ms": steps,
        "total_ms": started.elapsed().as_millis() as u64,
    })
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "pipeline task was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    store: Arc<dyn QueueStore>,
    artifacts: Arc<dyn ArtifactStore>,
    runner: Arc<PipelineRunner>,
    config: WorkerConfig,
    events: EventEmitter,
    wakeup: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        artifacts: Arc<dyn ArtifactStore>,
        runner: PipelineRunner,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            artifacts,
            runner: Arc::new(runner),
            config,
            events: EventEmitter::default(),
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Share a wakeup with the submission side so new work is picked up without waiting a poll.
    pub fn with_wakeup(mut self, wakeup: Arc<Notify>) -> Self {
        self.wakeup = wakeup;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn ago(&self, span: Duration) -> chrono::DateTime<Utc> {
        Utc::now() - chrono::Duration::from_std(span).unwrap_or(chrono::Duration::seconds(60))
    }

    fn scan(&self, owned_prefix: Option<String>) -> OrphanScan {
        OrphanScan {
            owned_prefix,
            owned_stale_before: self.ago(self.config.heartbeat_interval * 2),
            stale_before: self.ago(self.config.orphan_after),
            max_recoveries: self.config.max_recoveries,
        }
    }

    /// Reclaim this worker id's claims that missed two heartbeats, plus every
    /// stale claim. Call only while this dispatcher has nothing in flight.
    pub async fn recover_owned(&self) -> Result<Vec<Recovered>> {
        self.recover(self.scan(Some(self.config.handle_prefix()))).await
    }

    /// Reclaim processing items whose heartbeat went stale.
    pub async fn recover_stale(&self) -> Result<Vec<Recovered>> {
        self.recover(self.scan(None)).await
    }

    async fn recover(&self, scan: OrphanScan) -> Result<Vec<Recovered>> {
        let recovered = self.store.recover_orphans(&scan).await?;
        for r in &recovered {
            if r.requeued {
                tracing::warn!(item_id = %r.id, worker_id = %self.config.worker_id, "Orphaned item requeued");
            } else {
                let error = ScribeError::RecoveryExhausted { id: r.id };
                tracing::error!(
                    item_id = %r.id,
                    worker_id = %self.config.worker_id,
                    error = %error,
                    "Orphaned item failed"
                );
            }
            self.events.emit(PipelineEvent::ItemRecovered {
                item_id: r.id,
                requeued: r.requeued,
            });
        }
        Ok(recovered)
    }

    /// Claim and fully process one item. `None` when the queue is empty.
    pub async fn run_once(&self) -> Result<Option<ItemOutcome>> {
        let handle = format!("{}{}", self.config.handle_prefix(), Uuid::new_v4().simple());
        let Some(item) = self.store.claim_next(&handle).await? else {
            return Ok(None);
        };

        tracing::info!(
            item_id = %item.id,
            owner_id = %item.owner_id,
            worker_id = %self.config.worker_id,
            "Processing queue item"
        );
        self.events.emit(PipelineEvent::ItemClaimed {
            item_id: item.id,
            execution_handle: handle.clone(),
        });

        Ok(Some(self.execute(item, handle).await))
    }

    async fn execute(&self, item: QueueItem, handle: String) -> ItemOutcome {
        let started = Instant::now();
        let trail = StepTrail::default();
        let sink = StoreProgressSink {
            store: self.store.clone(),
            events: self.events.clone(),
            item_id: item.id,
            execution_handle: handle.clone(),
            trail: trail.clone(),
        };
        let context = PipelineContext::new(item.id, item.owner_id.clone(), item.submission.clone());
        let runner = self.runner.clone();

        // Spawned so a panicking step surfaces as a JoinError instead of unwinding the loop.
        let mut run = tokio::spawn(async move { runner.run(context, &sink).await });
        let heartbeat = self.spawn_heartbeat(item.id, handle.clone());
        let finished = tokio::time::timeout(self.config.pipeline_timeout, &mut run).await;
        heartbeat.abort();

        let verdict = match finished {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(pipeline_error))) => Err(ScribeError::from(pipeline_error).to_string()),
            Ok(Err(join_error)) => Err(format!("Pipeline crashed: {}", panic_message(join_error))),
            Err(_) => {
                run.abort();
                Err(ScribeError::Timeout {
                    timeout_ms: self.config.pipeline_timeout.as_millis() as u64,
                }
                .to_string())
            }
        };

        match verdict {
            Ok(result) => self.complete(&item, &handle, result, started, &trail).await,
            Err(message) => {
                let timings = run_timings(&trail, started);
                self.fail(item.id, &handle, message, timings).await
            }
        }
    }

    fn spawn_heartbeat(&self, id: Uuid, handle: String) -> JoinHandle<()> {
        let store = self.store.clone();
        let every = self.config.heartbeat_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.heartbeat(id, &handle).await {
                    tracing::warn!(item_id = %id, error = %e, "Heartbeat failed");
                }
            }
        })
    }

    async fn complete(
        &self,
        item: &QueueItem,
        handle: &str,
        result: FinalResult,
        started: Instant,
        trail: &StepTrail,
    ) -> ItemOutcome {
        let saved = self
            .artifacts
            .save(&item.owner_id, item.id, &item.submission.recipient_name, &result)
            .await;
        let result_ref = match saved {
            Ok(result_ref) => result_ref,
            Err(e) => {
                tracing::error!(item_id = %item.id, error = %e, "Artifact save failed");
                let message = format!("Failed to save result: {e}");
                return self.fail(item.id, handle, message, run_timings(trail, started)).await;
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = self.store.mark_completed(item.id, handle, &result_ref).await {
            tracing::error!(item_id = %item.id, result_ref = %result_ref, error = %e, "Completion not recorded");
            return ItemOutcome::Unrecorded {
                id: item.id,
                error: e.to_string(),
            };
        }

        tracing::info!(item_id = %item.id, result_ref = %result_ref, duration_ms, "Queue item completed");
        self.events.emit(PipelineEvent::ItemCompleted {
            item_id: item.id,
            result_ref: result_ref.clone(),
            duration_ms,
        });
        ItemOutcome::Completed {
            id: item.id,
            result_ref,
        }
    }

    async fn fail(
        &self,
        id: Uuid,
        handle: &str,
        message: String,
        timings: serde_json::Value,
    ) -> ItemOutcome {
        if let Err(e) = self.store.mark_failed(id, handle, &message, &timings).await {
            tracing::error!(item_id = %id, error = %e, timings = %timings, "Failure not recorded");
            return ItemOutcome::Unrecorded {
                id,
                error: e.to_string(),
            };
        }

        tracing::warn!(item_id = %id, error = %message, timings = %timings, "Queue item failed");
        self.events.emit(PipelineEvent::ItemFailed {
            item_id: id,
            error: message.clone(),
        });
        ItemOutcome::Failed { id, error: message }
    }

    /// Process items until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// An item in flight when shutdown is requested is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.recover_owned().await?;
        let mut last_scan = Instant::now();
        tracing::info!(worker_id = %self.config.worker_id, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_scan.elapsed() >= self.config.recovery_scan_interval {
                if let Err(e) = self.recover_owned().await {
                    tracing::warn!(error = %e, "Recovery scan failed");
                }
                last_scan = Instant::now();
            }

            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "Claim failed"),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!(worker_id = %self.config.worker_id, "Worker stopped");
        Ok(())
    }
}
