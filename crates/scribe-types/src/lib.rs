//! Shared types, errors, and the queue state machine for the Scribe outreach queue.
//!
//! This crate provides the foundational types used across all other Scribe crates:
//! - `ScribeError`: unified error taxonomy
//! - `QueueStatus`: the queue item lifecycle and its legal transitions
//! - `QueueItem` / `QueueItemView`: durable record and its client projection
//! - `StepResult` / `StepError`: outcome of one pipeline step

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unified error type for all Scribe subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ScribeError {
    // === Submission Errors ===
    #[error("Validation failed: {0}")]
    Validation(String),

    // === Pipeline Errors ===
    #[error("Step '{step}' failed: {message}")]
    Step { step: String, message: String },

    #[error("Pipeline timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // === Queue Errors ===
    #[error("Recovery exhausted: processing was interrupted twice and needs operator attention")]
    RecoveryExhausted { id: Uuid },

    #[error("Illegal transition for queue item {id}: {from} -> {to}")]
    IllegalTransition {
        id: Uuid,
        from: QueueStatus,
        to: QueueStatus,
    },

    #[error("Queue item {id} not found")]
    NotFound { id: Uuid },

    #[error("Claim on queue item {id} was lost")]
    ClaimLost { id: Uuid },

    #[error("Storage error: {0}")]
    Storage(String),

    // === External Service Errors ===
    #[error("{service} returned HTTP {status}: {message}")]
    Http {
        service: String,
        status: u16,
        message: String,
    },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ScribeError {
    /// Wrap any storage backend error.
    pub fn storage(err: impl fmt::Display) -> Self {
        ScribeError::Storage(err.to_string())
    }

    /// Returns `true` if the message is meant to reach the submitting client.
    ///
    /// Storage and illegal-transition errors carry internal identifiers and
    /// are logged instead.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            ScribeError::Validation(_)
                | ScribeError::Step { .. }
                | ScribeError::Timeout { .. }
                | ScribeError::RecoveryExhausted { .. }
                | ScribeError::NotFound { .. }
        )
    }

    /// Maps the error to an HTTP status code for an API layer.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ScribeError::Validation(_) => Some(400),
            ScribeError::NotFound { .. } => Some(404),
            ScribeError::Timeout { .. } => Some(504),
            ScribeError::Storage(_) | ScribeError::IllegalTransition { .. } => Some(500),
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, ScribeError>`.
pub type Result<T> = std::result::Result<T, ScribeError>;

/// Longest error message persisted on a queue item.
pub const MAX_ERROR_LENGTH: usize = 1000;

/// Clamp an error message to [`MAX_ERROR_LENGTH`] characters before it is persisted.
pub fn truncate_error_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_LENGTH {
        return message.to_string();
    }
    let head: String = message.chars().take(MAX_ERROR_LENGTH).collect();
    format!("{head}... [truncated]")
}

// ---------------------------------------------------------------------------
// QueueStatus: lifecycle of a queue item
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Canceled
        )
    }

    /// The legal edges of the state machine.
    ///
    /// `Processing -> Pending` is the orphan-recovery edge and is only taken
    /// by the orphan scan.
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Canceled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
        )
    }

    /// Validate a transition, returning the new status or an `IllegalTransition` error.
    pub fn transition(self, id: Uuid, next: QueueStatus) -> Result<QueueStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ScribeError::IllegalTransition {
                id,
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = ScribeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            "canceled" => Ok(QueueStatus::Canceled),
            other => Err(ScribeError::Other(format!("unknown queue status '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Submission & QueueItem
// ---------------------------------------------------------------------------

/// The immutable input of one queue item: who to write to, and the template to use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub recipient_name: String,
    pub recipient_interest: String,
    pub template: String,
}

/// One unit of queued work and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub owner_id: String,
    pub submission: Submission,
    pub status: QueueStatus,
    pub current_step: Option<String>,
    /// Token of the run holding this item. Set only while `Processing`.
    pub execution_handle: Option<String>,
    pub result_ref: Option<String>,
    pub error_message: Option<String>,
    /// Per-step durations and total elapsed time of a failed run.
    pub step_timings: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Check the field invariants that must hold for the item's status.
    ///
    /// `Completed` carries only a result reference, `Failed` only an error
    /// message. Every other state carries neither.
    pub fn check_invariants(&self) -> Result<()> {
        let fail = |what: &str| {
            Err(ScribeError::Other(format!(
                "queue item {} in status {} {what}",
                self.id, self.status
            )))
        };
        match self.status {
            QueueStatus::Completed => {
                if self.result_ref.is_none() || self.error_message.is_some() {
                    return fail("must carry exactly a result reference");
                }
            }
            QueueStatus::Failed => {
                if self.error_message.is_none() || self.result_ref.is_some() {
                    return fail("must carry exactly an error message");
                }
            }
            _ => {
                if self.result_ref.is_some() || self.error_message.is_some() {
                    return fail("must not carry a result or an error");
                }
            }
        }
        if self.status == QueueStatus::Processing && self.execution_handle.is_none() {
            return fail("must carry an execution handle");
        }
        if self.status != QueueStatus::Processing && self.execution_handle.is_some() {
            return fail("must not carry an execution handle");
        }
        Ok(())
    }

    /// Project this item for a polling client.
    pub fn to_view(&self, position: Option<u32>) -> QueueItemView {
        QueueItemView {
            id: self.id,
            recipient_name: self.submission.recipient_name.clone(),
            status: self.status,
            position,
            current_step: self.current_step.clone(),
            result_ref: self.result_ref.clone(),
            error_message: self.error_message.clone(),
            created_at: self.created_at,
        }
    }
}

/// What a polling client sees for one queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItemView {
    pub id: Uuid,
    pub recipient_name: String,
    pub status: QueueStatus,
    /// 1-indexed rank among pending items; `None` unless pending.
    pub position: Option<u32>,
    pub current_step: Option<String>,
    pub result_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Cancellation outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No item with that id belongs to the caller.
    NotFound,
    /// The item exists but has left `Pending`.
    NotCancellable(QueueStatus),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotFound => f.write_str("not found"),
            RejectReason::NotCancellable(_) => f.write_str("not cancellable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    Rejected(RejectReason),
}

// ---------------------------------------------------------------------------
// StepStatus / StepError / StepResult: outcome of one pipeline step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Succeeded,
    Skipped,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Started => "started",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
        }
    }
}

/// Typed failure raised inside a step.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{service} error: {message}")]
    External { service: String, message: String },

    #[error("missing output from step '{0}'")]
    MissingOutput(String),

    #[error("{0}")]
    Other(String),
}

impl From<ScribeError> for StepError {
    fn from(err: ScribeError) -> Self {
        match err {
            ScribeError::Http {
                service,
                status,
                message,
            } => StepError::External {
                service,
                message: format!("HTTP {status}: {message}"),
            },
            other => StepError::Other(other.to_string()),
        }
    }
}

/// Immutable outcome of one pipeline step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step: String,
    pub status: StepStatus,
    pub output: serde_json::Value,
    pub duration: Duration,
    /// Why the step was skipped, when it was.
    pub skip_reason: Option<String>,
    pub error: Option<StepError>,
}

impl StepResult {
    pub fn succeeded(step: impl Into<String>, output: serde_json::Value, duration: Duration) -> Self {
        Self {
            step: step.into(),
            status: StepStatus::Succeeded,
            output,
            duration,
            skip_reason: None,
            error: None,
        }
    }

    pub fn skipped(step: impl Into<String>, reason: impl Into<String>, duration: Duration) -> Self {
        Self {
            step: step.into(),
            status: StepStatus::Skipped,
            output: serde_json::Value::Null,
            duration,
            skip_reason: Some(reason.into()),
            error: None,
        }
    }

    pub fn failed(step: impl Into<String>, error: StepError, duration: Duration) -> Self {
        Self {
            step: step.into(),
            status: StepStatus::Failed,
            output: serde_json::Value::Null,
            duration,
            skip_reason: None,
            error: Some(error),
        }
    }

    /// Skipped steps count as successful: the pipeline continues past them.
    pub fn is_success(&self) -> bool {
        matches!(self.status, StepStatus::Succeeded | StepStatus::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(status: QueueStatus) -> QueueItem {
        QueueItem {
            id: Uuid::new_v4(),
            owner_id: "user-1".into(),
            submission: Submission {
                recipient_name: "Dr. Jane Smith".into(),
                recipient_interest: "machine learning".into(),
                template: "Hey {{name}}, I loved your work on {{research}}!".into(),
            },
            status,
            current_step: None,
            execution_handle: None,
            result_ref: None,
            error_message: None,
            step_timings: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    // --- ScribeError display ---

    #[test]
    fn error_display_step() {
        let err = ScribeError::Step {
            step: "web_scraper".into(),
            message: "search quota exceeded".into(),
        };
        assert_eq!(
            err.to_string(),
            "Step 'web_scraper' failed: search quota exceeded"
        );
    }

    #[test]
    fn error_display_timeout() {
        let err = ScribeError::Timeout { timeout_ms: 300000 };
        assert_eq!(err.to_string(), "Pipeline timed out after 300000ms");
    }

    #[test]
    fn error_display_validation() {
        let err = ScribeError::Validation("batch must contain 1 to 100 items".into());
        assert_eq!(
            err.to_string(),
            "Validation failed: batch must contain 1 to 100 items"
        );
    }

    #[test]
    fn error_display_recovery_exhausted_mentions_recovery() {
        let err = ScribeError::RecoveryExhausted { id: Uuid::nil() };
        assert!(err.to_string().starts_with("Recovery exhausted"));
    }

    #[test]
    fn user_visibility() {
        assert!(ScribeError::Validation("x".into()).is_user_visible());
        assert!(ScribeError::Timeout { timeout_ms: 1 }.is_user_visible());
        assert!(!ScribeError::Storage("disk I/O error".into()).is_user_visible());
        assert!(!ScribeError::ClaimLost { id: Uuid::nil() }.is_user_visible());
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(ScribeError::Validation("x".into()).http_status(), Some(400));
        assert_eq!(ScribeError::NotFound { id: Uuid::nil() }.http_status(), Some(404));
        assert_eq!(ScribeError::Timeout { timeout_ms: 1 }.http_status(), Some(504));
        assert_eq!(ScribeError::Other("x".into()).http_status(), None);
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: ScribeError = json_err.into();
        assert!(matches!(err, ScribeError::Json(_)));
    }

    // --- truncate_error_message ---

    #[test]
    fn short_messages_are_kept_verbatim() {
        assert_eq!(truncate_error_message("boom"), "boom");
    }

    #[test]
    fn long_messages_are_truncated_with_marker() {
        let long = "x".repeat(MAX_ERROR_LENGTH + 50);
        let out = truncate_error_message(&long);
        assert!(out.ends_with("... [truncated]"));
        assert_eq!(out.chars().count(), MAX_ERROR_LENGTH + "... [truncated]".len());
    }

    // --- QueueStatus ---

    #[test]
    fn legal_transitions() {
        use QueueStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Canceled));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Pending));
    }

    #[test]
    fn illegal_transitions_fail_loudly() {
        use QueueStatus::*;
        let id = Uuid::new_v4();
        for (from, to) in [
            (Pending, Completed),
            (Pending, Failed),
            (Processing, Canceled),
            (Completed, Pending),
            (Failed, Processing),
            (Canceled, Pending),
            (Completed, Failed),
        ] {
            match from.transition(id, to) {
                Err(ScribeError::IllegalTransition { from: f, to: t, .. }) => {
                    assert_eq!((f, t), (from, to));
                }
                other => panic!("expected IllegalTransition for {from} -> {to}, got {other:?}"),
            }
        }
    }

    #[test]
    fn status_parses_its_own_string_form() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Completed,
            QueueStatus::Failed,
            QueueStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
        assert!("archived".parse::<QueueStatus>().is_err());
    }

    #[test]
    fn status_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&QueueStatus::Processing).unwrap(),
            "\"processing\""
        );
    }

    // --- QueueItem invariants ---

    #[test]
    fn pending_item_satisfies_invariants() {
        assert!(item(QueueStatus::Pending).check_invariants().is_ok());
    }

    #[test]
    fn completed_item_requires_result_ref_only() {
        let mut it = item(QueueStatus::Completed);
        assert!(it.check_invariants().is_err());
        it.result_ref = Some("artifact-1".into());
        assert!(it.check_invariants().is_ok());
        it.error_message = Some("boom".into());
        assert!(it.check_invariants().is_err());
    }

    #[test]
    fn processing_item_requires_handle() {
        let mut it = item(QueueStatus::Processing);
        assert!(it.check_invariants().is_err());
        it.execution_handle = Some("worker-a/run-1".into());
        assert!(it.check_invariants().is_ok());
    }

    #[test]
    fn view_carries_position_and_recipient() {
        let it = item(QueueStatus::Pending);
        let view = it.to_view(Some(3));
        assert_eq!(view.position, Some(3));
        assert_eq!(view.recipient_name, "Dr. Jane Smith");
        assert_eq!(view.status, QueueStatus::Pending);
    }

    // --- StepResult ---

    #[test]
    fn skipped_step_counts_as_success() {
        let r = StepResult::skipped("arxiv_helper", "not a research template", Duration::ZERO);
        assert!(r.is_success());
        assert_eq!(r.status, StepStatus::Skipped);
        assert_eq!(r.skip_reason.as_deref(), Some("not a research template"));
    }

    #[test]
    fn failed_step_is_not_success() {
        let r = StepResult::failed(
            "email_composer",
            StepError::Other("model refused".into()),
            Duration::from_millis(5),
        );
        assert!(!r.is_success());
        assert_eq!(r.error, Some(StepError::Other("model refused".into())));
    }

    #[test]
    fn http_error_converts_to_external_step_error() {
        let err = ScribeError::Http {
            service: "google_search".into(),
            status: 429,
            message: "quota".into(),
        };
        let step_err: StepError = err.into();
        assert_eq!(
            step_err,
            StepError::External {
                service: "google_search".into(),
                message: "HTTP 429: quota".into(),
            }
        );
    }
}
