//! Queue positions, derived on every read.
//!
//! The store ranks in SQL; this is the reference ranking it is tested against.

use std::collections::HashMap;

use uuid::Uuid;

use scribe_types::{QueueItem, QueueStatus};

/// Map each item to its 1-indexed rank among the pending items given, by
/// `(created_at, id)`. Items in any other status map to `None`.
///
/// Pass every pending item in the queue for global positions.
pub fn project_positions(items: &[QueueItem]) -> HashMap<Uuid, Option<u32>> {
    let mut pending: Vec<&QueueItem> = items
        .iter()
        .filter(|i| i.status == QueueStatus::Pending)
        .collect();
    pending.sort_by_key(|i| (i.created_at, i.id));

    let mut positions: HashMap<Uuid, Option<u32>> =
        items.iter().map(|i| (i.id, None)).collect();
    for (rank, item) in pending.into_iter().enumerate() {
        positions.insert(item.id, Some(rank as u32 + 1));
    }
    positions
}
