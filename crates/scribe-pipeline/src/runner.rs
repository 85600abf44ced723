//! Pipeline runner: executes the steps of a [`Pipeline`] in order against one context.

use std::time::{Duration, Instant};

use scribe_types::{ScribeError, StepError, StepResult, StepStatus};

use crate::context::PipelineContext;
use crate::events::{ProgressEvent, ProgressSink};
use crate::step::{Pipeline, StepOutput};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A successful run: the final step's output plus the full timing trail.
#[derive(Debug, Clone)]
pub struct FinalResult {
    pub output: serde_json::Value,
    pub steps: Vec<StepResult>,
    pub total_duration: Duration,
}

impl FinalResult {
    /// Step name to duration in milliseconds, for persisting alongside the artifact.
    pub fn timings_ms(&self) -> serde_json::Map<String, serde_json::Value> {
        self.steps
            .iter()
            .map(|s| (s.step.clone(), serde_json::json!(s.duration.as_millis() as u64)))
            .collect()
    }
}

/// A failed run. Carries the failing step and every result recorded up to it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Step '{step}' failed: {source}")]
pub struct PipelineError {
    pub step: String,
    pub source: StepError,
    pub steps: Vec<StepResult>,
    pub total_duration: Duration,
}

impl From<PipelineError> for ScribeError {
    fn from(err: PipelineError) -> Self {
        ScribeError::Step {
            step: err.step,
            message: err.source.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineRunner
// ---------------------------------------------------------------------------

pub struct PipelineRunner {
    pipeline: Pipeline,
}

impl PipelineRunner {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run every step in order.
    ///
    /// Each step is reported to `sink` as `Started` before it executes and
    /// with its final status and duration after. The first failing step
    /// aborts the run; there is no per-step retry.
    pub async fn run(
        &self,
        mut context: PipelineContext,
        sink: &dyn ProgressSink,
    ) -> Result<FinalResult, PipelineError> {
        let run_start = Instant::now();
        let item_id = context.item_id();
        let total_steps = self.pipeline.len();
        let mut results: Vec<StepResult> = Vec::with_capacity(total_steps);

        tracing::info!(item_id = %item_id, total_steps, "Pipeline execution started");

        for (i, step) in self.pipeline.steps().iter().enumerate() {
            let kind = step.kind();
            tracing::debug!(item_id = %item_id, step = %kind, "Executing step {}/{}", i + 1, total_steps);

            sink.report(ProgressEvent {
                item_id,
                step: kind.as_str().to_string(),
                status: StepStatus::Started,
                duration_ms: None,
            })
            .await;

            let step_start = Instant::now();
            let outcome = step.execute(&context).await;
            let duration = step_start.elapsed();

            let result = match outcome {
                Ok(StepOutput::Produced(output)) => {
                    StepResult::succeeded(kind.as_str(), output, duration)
                }
                Ok(StepOutput::Skipped(reason)) => {
                    tracing::info!(item_id = %item_id, step = %kind, reason = %reason, "Step skipped");
                    StepResult::skipped(kind.as_str(), reason, duration)
                }
                Err(err) => {
                    tracing::warn!(item_id = %item_id, step = %kind, error = %err, "Step failed");
                    StepResult::failed(kind.as_str(), err, duration)
                }
            };

            context.record(kind, &result);
            sink.report(ProgressEvent {
                item_id,
                step: kind.as_str().to_string(),
                status: result.status,
                duration_ms: Some(duration.as_millis() as u64),
            })
            .await;

            let failure = result.error.clone();
            results.push(result);
            if let Some(source) = failure {
                let total_duration = run_start.elapsed();
                tracing::error!(
                    item_id = %item_id,
                    step = %kind,
                    total_ms = total_duration.as_millis() as u64,
                    "Pipeline aborted"
                );
                return Err(PipelineError {
                    step: kind.as_str().to_string(),
                    source,
                    steps: results,
                    total_duration,
                });
            }
        }

        let total_duration = run_start.elapsed();
        let last = results.last().cloned();
        match last {
            Some(last) if last.status == StepStatus::Succeeded => {
                tracing::info!(
                    item_id = %item_id,
                    total_ms = total_duration.as_millis() as u64,
                    "Pipeline execution completed"
                );
                Ok(FinalResult {
                    output: last.output,
                    steps: results,
                    total_duration,
                })
            }
            last => {
                let step = last
                    .map(|s| s.step)
                    .unwrap_or_else(|| "pipeline".to_string());
                Err(PipelineError {
                    source: StepError::MissingOutput(step.clone()),
                    step,
                    steps: results,
                    total_duration,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
