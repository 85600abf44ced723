//! The per-run record threaded through pipeline steps.
//!
//! A [`PipelineContext`] is owned by exactly one runner invocation. Steps get
//! a shared reference and can only read; the runner writes each step's output
//! into that step's own slot after it returns, so no step can touch another
//! step's fields.

use std::time::Duration;

use serde::de::DeserializeOwned;
use uuid::Uuid;

use scribe_types::{StepError, StepResult, StepStatus, Submission};

use crate::step::StepKind;

/// Output and timing recorded for one executed step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub step: StepKind,
    pub status: StepStatus,
    pub output: serde_json::Value,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineContext {
    item_id: Uuid,
    owner_id: String,
    submission: Submission,
    records: Vec<StepRecord>,
}

impl PipelineContext {
    /// Create a fresh context for one queue item.
    pub fn new(item_id: Uuid, owner_id: impl Into<String>, submission: Submission) -> Self {
        Self {
            item_id,
            owner_id: owner_id.into(),
            submission,
            records: Vec::new(),
        }
    }

    pub fn item_id(&self) -> Uuid {
        self.item_id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn submission(&self) -> &Submission {
        &self.submission
    }

    /// Records of the steps executed so far, in execution order.
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn record_for(&self, step: StepKind) -> Option<&StepRecord> {
        self.records.iter().find(|r| r.step == step)
    }

    /// Raw output of an earlier step. `None` if it has not run or was skipped.
    pub fn output(&self, step: StepKind) -> Option<&serde_json::Value> {
        self.record_for(step)
            .filter(|r| r.status == StepStatus::Succeeded)
            .map(|r| &r.output)
    }

    /// Typed output of an earlier step, if it produced one.
    pub fn output_as<T: DeserializeOwned>(
        &self,
        step: StepKind,
    ) -> Result<Option<T>, StepError> {
        match self.output(step) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                StepError::Other(format!("malformed output of step '{}': {e}", step))
            }),
        }
    }

    /// Typed output of an earlier step that must have produced one.
    pub fn require<T: DeserializeOwned>(&self, step: StepKind) -> Result<T, StepError> {
        self.output_as(step)?
            .ok_or_else(|| StepError::MissingOutput(step.as_str().to_string()))
    }

    /// Per-step durations in execution order.
    pub fn timings(&self) -> Vec<(StepKind, Duration)> {
        self.records.iter().map(|r| (r.step, r.duration)).collect()
    }

    /// Store a step's result in its slot. Only the runner calls this, once per step.
    pub(crate) fn record(&mut self, step: StepKind, result: &StepResult) {
        debug_assert!(self.record_for(step).is_none(), "step {step} recorded twice");
        self.records.push(StepRecord {
            step,
            status: result.status,
            output: result.output.clone(),
            duration: result.duration,
        });
    }
}
