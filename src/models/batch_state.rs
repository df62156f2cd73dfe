use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum number of concurrent generation calls.
///
/// **IMPORTANT:** This is hardcoded to 1 because the engine targets
/// memory-constrained GPUs where a second concurrent inference can exhaust
/// VRAM mid-run. Peak memory is bounded by running exactly one inference at
/// a time.
///
/// This constraint is enforced structurally: the sequential batch loop runs
/// on a single worker thread and never starts a tick before the previous one
/// has fully completed (see [`crate::services::engine::BatchEngine`]).
pub const MAX_CONCURRENT_GENERATIONS: usize = 1;

/// Global lifecycle states of the batch engine.
///
/// Exactly one status is active at any instant. All changes go through the
/// state machine's transition table; see [`crate::state::StateMachine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Idle,
    Preparing,
    Running,
    Paused,
    Cancelling,
    Completed,
    Error,
}

impl BatchStatus {
    /// Terminal-for-a-run states that require acknowledgment to return to `Idle`.
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Error)
    }

    /// States in which a batch occupies the engine.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            BatchStatus::Preparing | BatchStatus::Running | BatchStatus::Paused
        )
    }
}

/// Single source of truth for the engine lifecycle.
///
/// Holds the current status, progress counters, and the last error of the
/// active (or most recent) batch. Persisted after every successful tick so a
/// crash never loses more than the in-flight item.
///
/// # Thread Safety
///
/// `BatchState` is wrapped in `Arc<RwLock<BatchState>>` by
/// [`crate::state::StateMachine`]. Never mutate it directly - always use the
/// state machine's transition and recording methods.
///
/// # Invariants
///
/// - `current_index <= total_items`
/// - `accepted_count + rejected_count <= current_index`, with equality after
///   every completed tick
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    /// Lifecycle status, validated by the transition table
    pub status: BatchStatus,

    /// Identifier of the active batch (empty when no batch has run yet)
    pub batch_id: String,

    /// Preset name the active batch was started with, if any
    pub preset: Option<String>,

    /// 0-based position in the active batch: items before this index have a
    /// final verdict
    pub current_index: usize,

    /// Total items requested by the active batch
    pub total_items: usize,

    /// Items committed after passing the quality gate
    pub accepted_count: usize,

    /// Items rejected by the quality gate (no output committed)
    pub rejected_count: usize,

    /// Message of the failure that drove the `Error` status, if any
    pub last_error: Option<String>,

    /// Seconds since the Unix epoch at the last mutation
    pub updated_at: u64,
}

impl Default for BatchState {
    fn default() -> Self {
        Self {
            status: BatchStatus::Idle,
            batch_id: String::new(),
            preset: None,
            current_index: 0,
            total_items: 0,
            accepted_count: 0,
            rejected_count: 0,
            last_error: None,
            updated_at: epoch_secs(),
        }
    }
}

impl BatchState {
    /// Check the counter invariants that must hold at every observed snapshot.
    pub fn is_consistent(&self) -> bool {
        self.current_index <= self.total_items
            && self.accepted_count + self.rejected_count <= self.current_index
    }

    /// True when every item up to `current_index` has a recorded verdict.
    ///
    /// This is the stronger per-tick guarantee: between ticks the two counter
    /// sums are exactly equal, never merely bounded.
    pub fn counters_balanced(&self) -> bool {
        self.accepted_count + self.rejected_count == self.current_index
    }

    /// Items still pending in the active batch.
    pub fn remaining_items(&self) -> usize {
        self.total_items.saturating_sub(self.current_index)
    }

    /// Record one item's final verdict and advance the index.
    ///
    /// Called exclusively by the state machine after a tick completes.
    pub(crate) fn record_verdict(&mut self, accepted: bool) {
        if accepted {
            self.accepted_count += 1;
        } else {
            self.rejected_count += 1;
        }
        self.current_index += 1;
        self.touch();
    }

    /// Reset all per-batch fields, keeping only the lifecycle status.
    pub(crate) fn reset_batch_fields(&mut self) {
        self.batch_id.clear();
        self.preset = None;
        self.current_index = 0;
        self.total_items = 0;
        self.accepted_count = 0;
        self.rejected_count = 0;
        self.last_error = None;
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = epoch_secs();
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
