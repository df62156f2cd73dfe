// State management module
//
// This module provides the StateMachine which wraps BatchState with
// thread-safe access, validates every lifecycle transition against the
// allowed table, persists accepted mutations, and emits change events.

use crate::error::EngineError;
use crate::models::{BatchConfig, BatchState, BatchStatus};
use crate::persistence::StateStore;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Change events emitted when the batch state is modified
///
/// These are the structured events of the engine's log-sink contract:
/// external observers subscribe to them instead of parsing log text.
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    /// A lifecycle transition was validated and applied
    TransitionApplied {
        from: BatchStatus,
        to: BatchStatus,
    },

    /// A batch was populated and is about to run
    BatchStarted {
        batch_id: String,
        total_items: usize,
    },

    /// One item received its final verdict and the index advanced
    TickCompleted {
        index: usize,
        total: usize,
    },

    /// The item at `index` passed the quality gate and was committed
    ItemAccepted {
        index: usize,
        score: f32,
    },

    /// The item at `index` produced no passing candidate
    ItemRejected {
        index: usize,
        best_score: Option<f32>,
    },

    /// A failure drove the engine into the `Error` status
    ErrorRaised {
        message: String,
    },

    /// A batch reached `Completed` with these final counters
    BatchFinished {
        accepted: usize,
        rejected: usize,
    },

    /// The engine returned to `Idle`; the last run's counters remain
    /// readable until a new batch begins
    StateReset,
}

/// Check a lifecycle transition against the allowed table.
///
/// `Paused` is a first-class state; `Preparing -> Idle` covers aborting
/// preparation (including discarding a recovered batch).
pub fn transition_allowed(from: BatchStatus, to: BatchStatus) -> bool {
    use BatchStatus::*;
    matches!(
        (from, to),
        (Idle, Preparing)
            | (Preparing, Running)
            | (Preparing, Idle)
            | (Preparing, Error)
            | (Running, Completed)
            | (Running, Cancelling)
            | (Running, Error)
            | (Running, Paused)
            | (Paused, Running)
            | (Paused, Cancelling)
            | (Cancelling, Idle)
            | (Error, Idle)
            | (Completed, Idle)
    )
}

/// Thread-safe lifecycle state machine with durable snapshots
///
/// This is the single source of truth for the engine lifecycle:
/// - Provides thread-safe access to [`BatchState`] via `Arc<RwLock<T>>`
/// - Validates every transition against [`transition_allowed`]
/// - Persists every accepted mutation through the [`StateStore`] before
///   reporting success, rolling back on write failure
/// - Emits [`StateChange`] events via a tokio broadcast channel
///
/// # Usage
///
/// Always go through the machine instead of touching [`BatchState`] fields:
/// - [`request_transition()`](Self::request_transition) for lifecycle moves
/// - [`record_item()`](Self::record_item) for per-tick verdicts
/// - [`snapshot()`](Self::snapshot) / [`read()`](Self::read) for observation
/// - [`subscribe()`](Self::subscribe) for change events
pub struct StateMachine {
    /// The batch state protected by RwLock for thread-safe access
    state: Arc<RwLock<BatchState>>,

    /// Durable store; `None` only for detached in-memory machines (tests,
    /// dry runs)
    store: Option<Arc<StateStore>>,

    /// Broadcast channel for emitting state change events
    event_tx: broadcast::Sender<StateChange>,
}

impl StateMachine {
    /// Create a detached StateMachine with default state and no durable store.
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            state: Arc::new(RwLock::new(BatchState::default())),
            store: None,
            event_tx,
        }
    }

    /// Create a StateMachine that persists every accepted mutation.
    pub fn with_store(store: Arc<StateStore>) -> Self {
        let mut machine = Self::new();
        machine.store = Some(store);
        machine
    }

    /// Adopt a previously persisted state (startup/recovery path).
    ///
    /// Bypasses the transition table: the adopted snapshot was validated by
    /// [`StateStore::load_on_startup`](crate::persistence::StateStore::load_on_startup).
    pub fn restore(&self, state: BatchState) {
        let mut guard = self.state.write().unwrap();
        *guard = state;
    }

    /// Get an owned snapshot of the current state.
    pub fn snapshot(&self) -> BatchState {
        self.state.read().unwrap().clone()
    }

    /// Current lifecycle status.
    pub fn status(&self) -> BatchStatus {
        self.state.read().unwrap().status
    }

    /// Execute a function with read access to the state.
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&BatchState) -> R,
    {
        let state = self.state.read().unwrap();
        f(&state)
    }

    /// Subscribe to state change events.
    ///
    /// Returns a receiver notified of all future state changes. Multiple
    /// subscribers can listen simultaneously.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.event_tx.subscribe()
    }

    /// Request a lifecycle transition to `target`.
    ///
    /// Validation, mutation, and persistence happen as one logically atomic
    /// step under the exclusive write lock: no observer ever sees a
    /// half-applied transition, and a persistence failure rolls the mutation
    /// back before the error is reported.
    ///
    /// Returns the resulting snapshot, or:
    /// - [`EngineError::InvalidTransition`] if the pair is not in the table
    ///   (state unchanged; this is an expected rejection, logged at debug)
    /// - [`EngineError::Persistence`] if the durable write failed
    ///   (state unchanged)
    pub fn request_transition(&self, target: BatchStatus) -> Result<BatchState, EngineError> {
        let mut guard = self.state.write().unwrap();
        let from = guard.status;

        if !transition_allowed(from, target) {
            tracing::debug!(?from, to = ?target, "transition rejected");
            return Err(EngineError::InvalidTransition { from, to: target });
        }

        let previous = guard.clone();
        guard.status = target;
        if target == BatchStatus::Idle {
            // Counters stay readable as the record of the last run; only the
            // acknowledged error is cleared. A new batch resets them.
            guard.last_error = None;
        }
        guard.touch();

        if let Err(e) = self.persist(&guard) {
            *guard = previous;
            return Err(e.into());
        }

        tracing::info!(?from, to = ?target, "transition applied");
        self.emit(StateChange::TransitionApplied { from, to: target });

        if target == BatchStatus::Completed {
            self.emit(StateChange::BatchFinished {
                accepted: guard.accepted_count,
                rejected: guard.rejected_count,
            });
        }
        if target == BatchStatus::Idle {
            self.emit(StateChange::StateReset);
        }

        Ok(guard.clone())
    }

    /// Populate the per-batch fields from a config while `Preparing`.
    ///
    /// Called once per batch between the `Idle -> Preparing` and
    /// `Preparing -> Running` transitions.
    pub fn begin_batch(&self, config: &BatchConfig) -> Result<BatchState, EngineError> {
        let mut guard = self.state.write().unwrap();

        if guard.status != BatchStatus::Preparing {
            return Err(EngineError::InvalidTransition {
                from: guard.status,
                to: BatchStatus::Preparing,
            });
        }

        let previous = guard.clone();
        guard.reset_batch_fields();
        guard.batch_id = config.batch_id.clone();
        guard.preset = config.preset.clone();
        guard.total_items = config.total_items;

        if let Err(e) = self.persist(&guard) {
            *guard = previous;
            return Err(e.into());
        }

        self.emit(StateChange::BatchStarted {
            batch_id: guard.batch_id.clone(),
            total_items: guard.total_items,
        });

        Ok(guard.clone())
    }

    /// Adopt a recovered batch's counters without resetting them.
    ///
    /// The recovery counterpart of [`begin_batch`](Self::begin_batch): the
    /// machine must already hold the restored `Preparing` snapshot.
    pub fn resume_batch(&self, config: &BatchConfig) -> Result<BatchState, EngineError> {
        let guard = self.state.read().unwrap();

        if guard.status != BatchStatus::Preparing || guard.batch_id != config.batch_id {
            return Err(EngineError::RecoveryAmbiguity(format!(
                "machine is not holding a recovered snapshot for batch {}",
                config.batch_id
            )));
        }

        self.emit(StateChange::BatchStarted {
            batch_id: guard.batch_id.clone(),
            total_items: guard.total_items,
        });

        Ok(guard.clone())
    }

    /// Record one item's final verdict and advance the index.
    ///
    /// This is the per-tick atomic sync: counters move and the snapshot is
    /// durable before the loop may start the next tick. Rolls back on
    /// persistence failure like a transition.
    pub fn record_item(
        &self,
        accepted: bool,
        score: Option<f32>,
    ) -> Result<BatchState, EngineError> {
        let mut guard = self.state.write().unwrap();

        let previous = guard.clone();
        let index = guard.current_index;
        guard.record_verdict(accepted);

        if let Err(e) = self.persist(&guard) {
            *guard = previous;
            return Err(e.into());
        }

        if accepted {
            self.emit(StateChange::ItemAccepted {
                index,
                score: score.unwrap_or(0.0),
            });
        } else {
            self.emit(StateChange::ItemRejected {
                index,
                best_score: score,
            });
        }
        self.emit(StateChange::TickCompleted {
            index,
            total: guard.total_items,
        });

        Ok(guard.clone())
    }

    /// Drive the machine into `Error` with the failure recorded.
    ///
    /// Valid from any state the table allows to reach `Error`; the message
    /// lands in `last_error` and is the sole user-visible failure channel.
    ///
    /// Unlike a requested transition this one is forced: if the durable
    /// write fails too, the in-memory state still lands on `Error` (a loop
    /// stuck in `Running` with no worker would be worse than a stale
    /// snapshot), and the write failure is logged.
    pub fn fail(&self, message: impl Into<String>) -> Result<BatchState, EngineError> {
        let message = message.into();
        let mut guard = self.state.write().unwrap();
        let from = guard.status;

        if !transition_allowed(from, BatchStatus::Error) {
            return Err(EngineError::InvalidTransition {
                from,
                to: BatchStatus::Error,
            });
        }

        guard.status = BatchStatus::Error;
        guard.last_error = Some(message.clone());
        guard.touch();

        if let Err(e) = self.persist(&guard) {
            tracing::error!("failed to persist error state: {e}");
        }

        tracing::error!(%message, "batch failed");
        self.emit(StateChange::TransitionApplied {
            from,
            to: BatchStatus::Error,
        });
        self.emit(StateChange::ErrorRaised { message });

        Ok(guard.clone())
    }

    fn persist(&self, state: &BatchState) -> Result<(), crate::error::PersistenceError> {
        if let Some(store) = &self.store {
            store.save_state(state)?;
        }
        Ok(())
    }

    fn emit(&self, change: StateChange) {
        // Send errors only mean no one is listening
        let _ = self.event_tx.send(change);
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// Make StateMachine cloneable for sharing across threads
impl Clone for StateMachine {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            store: self.store.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}
