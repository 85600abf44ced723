//! Worker, batch and storage configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use scribe_types::{Result, ScribeError, Submission};

/// Tuning for one dispatcher process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Stable identity of this worker. Execution handles are `{worker_id}/{run_id}`,
    /// so a restarted worker recognises its own abandoned claims.
    pub worker_id: String,
    /// How long the loop sleeps when the queue is empty and nothing wakes it.
    pub poll_interval: Duration,
    /// Wall-clock ceiling for one pipeline run.
    pub pipeline_timeout: Duration,
    /// How often an in-flight run refreshes its heartbeat.
    pub heartbeat_interval: Duration,
    /// A processing item whose heartbeat is older than this is orphaned.
    pub orphan_after: Duration,
    /// How often the loop scans for orphans from other workers.
    pub recovery_scan_interval: Duration,
    /// Orphan reclaims allowed before an item is failed.
    pub max_recoveries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            poll_interval: Duration::from_secs(2),
            pipeline_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(10),
            orphan_after: Duration::from_secs(60),
            recovery_scan_interval: Duration::from_secs(30),
            max_recoveries: 1,
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Prefix shared by every execution handle this worker issues.
    pub fn handle_prefix(&self) -> String {
        format!("{}/", self.worker_id)
    }
}

/// Limits applied to a submitted batch before anything is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchLimits {
    pub max_batch_size: usize,
    pub name_chars: (usize, usize),
    pub interest_chars: (usize, usize),
    pub template_chars: (usize, usize),
    /// Terminal items older than this drop out of listings.
    pub listing_window: Duration,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            name_chars: (2, 255),
            interest_chars: (2, 500),
            template_chars: (10, 5000),
            listing_window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

fn check_len(field: &str, index: usize, value: &str, (min, max): (usize, usize)) -> Result<()> {
    let len = value.trim().chars().count();
    if len < min || len > max {
        return Err(ScribeError::Validation(format!(
            "item {index}: {field} must be {min} to {max} characters, got {len}"
        )));
    }
    Ok(())
}

impl BatchLimits {
    /// Reject the whole batch if it is empty, too large, or any item is malformed.
    pub fn validate(&self, items: &[Submission]) -> Result<()> {
        if items.is_empty() || items.len() > self.max_batch_size {
            return Err(ScribeError::Validation(format!(
                "batch must contain 1 to {} items, got {}",
                self.max_batch_size,
                items.len()
            )));
        }
        for (i, item) in items.iter().enumerate() {
            check_len("recipient_name", i, &item.recipient_name, self.name_chars)?;
            check_len("recipient_interest", i, &item.recipient_interest, self.interest_chars)?;
            check_len("template", i, &item.template, self.template_chars)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:scribe.db".to_string(),
            max_connections: 5,
        }
    }
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    /// A private in-memory database. One connection, since each SQLite
    /// memory connection is its own database.
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(name: &str, interest: &str, template: &str) -> Submission {
        Submission {
            recipient_name: name.into(),
            recipient_interest: interest.into(),
            template: template.into(),
        }
    }

    fn valid() -> Submission {
        submission("Jane Smith", "robotics", "Hi {{name}}, loved your work!")
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.pipeline_timeout, Duration::from_secs(300));
        assert_eq!(cfg.max_recoveries, 1);
        assert_eq!(cfg.with_worker_id("w7").handle_prefix(), "w7/");
    }

    #[test]
    fn batch_size_bounds() {
        let limits = BatchLimits::default();
        assert!(limits.validate(&[]).is_err());
        assert!(limits.validate(&vec![valid(); 100]).is_ok());
        let err = limits.validate(&vec![valid(); 101]).unwrap_err();
        assert!(matches!(err, ScribeError::Validation(_)));
    }

    #[test]
    fn field_lengths_are_checked() {
        let limits = BatchLimits::default();
        let short_name = submission("J", "robotics", "Hi {{name}}, loved your work!");
        let short_template = submission("Jane", "robotics", "Hi");
        let err = limits.validate(&[valid(), short_name]).unwrap_err();
        assert!(err.to_string().contains("item 1: recipient_name"));
        assert!(limits.validate(&[short_template]).is_err());
    }

    #[test]
    fn partial_worker_config_uses_defaults() {
        let cfg: WorkerConfig = serde_json::from_str(r#"{"worker_id": "w2"}"#).unwrap();
        assert_eq!(cfg.worker_id, "w2");
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(10));
    }
}
