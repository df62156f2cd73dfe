//! FIFO backlog of pending generation items.
//!
//! Exactly one queue instance exists per controller: it is constructed
//! explicitly and handed to the batch loop and the cancel path, never
//! reached through a process-wide global. Only-one-batch-at-a-time is the
//! state machine's job, not the queue's.

use crate::models::{BatchConfig, ItemParams, QueueItem};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Ordered backlog of [`QueueItem`]s for the active batch.
///
/// All operations take a single mutual-exclusion lock around the backing
/// deque, making them safe under concurrent invocation from the loop
/// (consumer) and an external cancel request (`clear`). Items are processed
/// in strict enqueue order; no reordering or priority is ever applied.
#[derive(Debug, Default)]
pub struct BatchQueue {
    items: Mutex<VecDeque<QueueItem>>,
}

impl BatchQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialize the full backlog for a batch config.
    pub fn from_config(config: &BatchConfig) -> Self {
        Self::remaining_from(config, 0)
    }

    /// Materialize only the items from `start_index` onward.
    ///
    /// Recovery uses this to rebuild the `total_items - current_index`
    /// remaining items of an interrupted batch; the per-item seeds come out
    /// identical to the original run because they derive from the config.
    pub fn remaining_from(config: &BatchConfig, start_index: usize) -> Self {
        let items = (start_index..config.total_items)
            .map(|index| QueueItem {
                index,
                params: ItemParams::resolve(config, index),
            })
            .collect();
        Self {
            items: Mutex::new(items),
        }
    }

    /// Replace the backlog with a batch's items from `start_index` onward.
    ///
    /// Used by the controller when a batch starts (index 0) or resumes
    /// (index = persisted `current_index`), so one queue instance serves the
    /// whole process lifetime.
    pub fn refill(&self, config: &BatchConfig, start_index: usize) {
        let mut items = self.items.lock().unwrap();
        items.clear();
        items.extend((start_index..config.total_items).map(|index| QueueItem {
            index,
            params: ItemParams::resolve(config, index),
        }));
    }

    /// Append an item to the back of the queue.
    pub fn enqueue(&self, item: QueueItem) {
        self.items.lock().unwrap().push_back(item);
    }

    /// Remove and return the oldest item, or `None` when empty.
    pub fn dequeue(&self) -> Option<QueueItem> {
        self.items.lock().unwrap().pop_front()
    }

    /// Current backlog size.
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    /// Discard all pending items (cancellation path).
    pub fn clear(&self) {
        let mut items = self.items.lock().unwrap();
        let dropped = items.len();
        items.clear();
        if dropped > 0 {
            tracing::info!(dropped, "queue cleared");
        }
    }
}
