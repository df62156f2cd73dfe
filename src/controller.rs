// Batch Controller - External request surface of the engine
//
// This module coordinates between:
// - External callers (UI or CLI) issuing start/pause/cancel requests
// - StateMachine (lifecycle validation and durable snapshots)
// - BatchQueue / ArtifactCache (per-batch working data)
// - BatchEngine (the sequential loop on its worker thread)
//
// Callers communicate only through transition requests and the cancel flag;
// shared state is never mutated directly from outside.

use crate::cache::ArtifactCache;
use crate::error::EngineError;
use crate::metrics::Metrics;
use crate::models::{BatchConfig, BatchState, BatchStatus};
use crate::persistence::{StartupOutcome, StateStore};
use crate::queue::BatchQueue;
use crate::services::engine::BatchEngine;
use crate::services::generation::{GenerationBackend, GenerationUnit, OutputSink};
use crate::services::quality::{QualityGate, QualityScorer};
use crate::state::{StateChange, StateMachine};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::{broadcast, watch};

/// External request surface for one batch engine instance.
///
/// Owns exactly one state machine, queue, cache, and store - singleton-ness
/// is enforced by the embedding process constructing exactly one controller,
/// not by a language-level global.
///
/// # Example
/// ```ignore
/// let store = Arc::new(StateStore::new("outputs/batches")?);
/// let controller = BatchController::new(store, backend, scorer, sink);
///
/// match controller.startup()? {
///     StartupOutcome::Resumable { remaining, .. } => {
///         // ask the user, then:
///         controller.confirm_resume()?;
///     }
///     _ => {
///         controller.request_start(config)?;
///     }
/// }
/// controller.wait();
/// ```
pub struct BatchController {
    state: StateMachine,
    store: Arc<StateStore>,
    queue: Arc<BatchQueue>,
    cache: Arc<ArtifactCache>,
    metrics: Arc<Metrics>,

    backend: Arc<dyn GenerationBackend>,
    scorer: Arc<dyn QualityScorer>,
    sink: Arc<dyn OutputSink>,

    /// Cancellation flag; the loop observes it at tick boundaries only
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,

    /// Worker thread of the active batch, if one is running
    worker: Mutex<Option<JoinHandle<BatchState>>>,

    /// Config of a recovered batch awaiting resume confirmation
    pending_recovery: Mutex<Option<BatchConfig>>,
}

impl BatchController {
    pub fn new(
        store: Arc<StateStore>,
        backend: Arc<dyn GenerationBackend>,
        scorer: Arc<dyn QualityScorer>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let (cancel_tx, cancel_rx) = watch::channel(false);

        Self {
            state: StateMachine::with_store(Arc::clone(&store)),
            store,
            queue: Arc::new(BatchQueue::new()),
            cache: Arc::new(ArtifactCache::new(Arc::clone(&metrics))),
            metrics,
            backend,
            scorer,
            sink,
            cancel_tx,
            cancel_rx,
            worker: Mutex::new(None),
            pending_recovery: Mutex::new(None),
        }
    }

    /// Read persisted state and prepare recovery if the last run was
    /// interrupted.
    ///
    /// A resumable batch is never resumed silently: the controller holds it
    /// in `Preparing` until [`confirm_resume`](Self::confirm_resume) or
    /// [`discard_recovery`](Self::discard_recovery) is called.
    pub fn startup(&self) -> Result<StartupOutcome, EngineError> {
        let outcome = self.store.load_on_startup()?;

        match &outcome {
            StartupOutcome::FirstLaunch => {
                tracing::info!("first launch: starting from idle");
            }
            StartupOutcome::Clean(state) => {
                self.state.restore(state.clone());
                tracing::info!(status = ?state.status, "previous state restored");
            }
            StartupOutcome::Resumable {
                state,
                config,
                remaining,
            } => {
                self.state.restore(state.clone());
                *self.pending_recovery.lock().unwrap() = Some(config.clone());
                tracing::info!(
                    batch_id = %config.batch_id,
                    remaining,
                    "recovered batch awaiting confirmation"
                );
            }
        }

        Ok(outcome)
    }

    /// Start a new batch: `Idle -> Preparing -> Running`, then spawn the loop.
    ///
    /// The config snapshot is persisted before any work starts so recovery
    /// can always rebuild the remaining queue.
    pub fn request_start(&self, config: BatchConfig) -> Result<BatchState, EngineError> {
        config.validate()?;

        self.state.request_transition(BatchStatus::Preparing)?;

        if let Err(e) = self.store.save_config(&config) {
            // Nothing has run yet; fall back to idle rather than error
            let _ = self.state.request_transition(BatchStatus::Idle);
            return Err(e.into());
        }

        self.state.begin_batch(&config)?;
        self.queue.refill(&config, 0);
        let state = self.state.request_transition(BatchStatus::Running)?;

        self.spawn_worker(config);
        Ok(state)
    }

    /// Resume the recovered batch from its persisted index.
    pub fn confirm_resume(&self) -> Result<BatchState, EngineError> {
        let config = self
            .pending_recovery
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| {
                EngineError::RecoveryAmbiguity(
                    "no recovered batch awaiting confirmation".to_string(),
                )
            })?;

        let recovered = self.state.resume_batch(&config)?;
        self.queue.refill(&config, recovered.current_index);
        let state = self.state.request_transition(BatchStatus::Running)?;

        tracing::info!(
            batch_id = %config.batch_id,
            from_index = recovered.current_index,
            "resuming recovered batch"
        );
        self.spawn_worker(config);
        Ok(state)
    }

    /// Drop the recovered batch and return to idle.
    pub fn discard_recovery(&self) -> Result<BatchState, EngineError> {
        let discarded = self.pending_recovery.lock().unwrap().take();
        if let Some(config) = discarded {
            tracing::info!(batch_id = %config.batch_id, "recovered batch discarded");
        }
        self.state.request_transition(BatchStatus::Idle)
    }

    /// Pause after the in-flight tick finishes.
    pub fn request_pause(&self) -> Result<BatchState, EngineError> {
        self.state.request_transition(BatchStatus::Paused)
    }

    /// Resume a paused batch.
    pub fn request_resume(&self) -> Result<BatchState, EngineError> {
        self.state.request_transition(BatchStatus::Running)
    }

    /// Request cancellation.
    ///
    /// Sets the flag the loop polls at the next tick boundary; the in-flight
    /// generation call is allowed to finish. The loop then performs
    /// `Running -> Cancelling -> Idle` and clears the queue.
    pub fn request_cancel(&self) {
        tracing::info!("cancellation requested; takes effect at the next tick boundary");
        let _ = self.cancel_tx.send(true);
    }

    /// Acknowledge a terminal state: `Completed`/`Error` back to `Idle`.
    pub fn request_acknowledge(&self) -> Result<BatchState, EngineError> {
        self.state.request_transition(BatchStatus::Idle)
    }

    /// Owned snapshot of the current state.
    pub fn snapshot(&self) -> BatchState {
        self.state.snapshot()
    }

    /// Subscribe to structured state-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state.subscribe()
    }

    /// Engine metrics shared with the loop and cache.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Block until the active batch's worker thread finishes, returning its
    /// final snapshot. Returns `None` when no worker is running.
    pub fn wait(&self) -> Option<BatchState> {
        let handle = self.worker.lock().unwrap().take()?;
        match handle.join() {
            Ok(state) => Some(state),
            Err(_) => {
                tracing::error!("batch worker thread panicked");
                None
            }
        }
    }

    fn spawn_worker(&self, config: BatchConfig) {
        // A fresh batch starts with the cancel flag lowered
        self.cancel_tx.send_replace(false);
        self.cache.clear();

        // The gate threshold was validated with the config
        let gate = QualityGate::new(config.quality_threshold)
            .expect("threshold validated by config.validate()");

        let unit = GenerationUnit::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.scorer),
            Arc::clone(&self.sink),
            gate,
            config.best_of_n,
            config.save_rejected,
            Arc::clone(&self.metrics),
        );

        let engine = BatchEngine::new(
            self.state.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.cache),
            Arc::clone(&self.store),
            unit,
            config,
            self.cancel_rx.clone(),
            Arc::clone(&self.metrics),
        );

        let handle = std::thread::Builder::new()
            .name("genbatch-worker".to_string())
            .spawn(move || engine.run())
            .expect("failed to spawn batch worker thread");

        *self.worker.lock().unwrap() = Some(handle);
    }
}
