//! Durable single-slot work queue for outreach generation.
//!
//! Items are persisted in SQLite by [`SqliteQueueStore`], claimed one at a
//! time by a [`Dispatcher`], and exposed to clients through
//! [`QueueService`]. Positions are ranked on read, in SQL, and
//! [`project_positions`] is the same ranking in plain Rust; nothing about
//! ordering is stored besides creation time.

pub mod artifacts;
pub mod cancel;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod projector;
pub mod service;
pub mod store;

pub use artifacts::{Artifact, ArtifactStore, SqliteArtifactStore};
pub use cancel::CancellationHandler;
pub use config::{BatchLimits, StoreConfig, WorkerConfig};
pub use dispatcher::{Dispatcher, ItemOutcome};
pub use projector::project_positions;
pub use service::{QueueService, Recipient};
pub use store::{OrphanScan, QueueStore, Recovered, SqliteQueueStore};
