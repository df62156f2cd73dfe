use crate::cache::ArtifactCache;
use crate::error::EngineError;
use crate::metrics::{BatchReport, Metrics};
use crate::models::{BatchConfig, BatchState, BatchStatus, ItemVerdict};
use crate::persistence::StateStore;
use crate::queue::BatchQueue;
use crate::services::generation::GenerationUnit;
use crate::state::StateMachine;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// How often the parked loop re-checks status and the cancel flag while
/// `Paused`. Bounded so pause never turns into an unobserved hang.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The sequential batch loop.
///
/// Drives one batch to completion or to a controlled stop, one item at a
/// time, on the single worker thread that owns it. Two generation calls
/// never overlap and two persistence writes never race: each tick finishes
/// its durable write before the next tick may start.
///
/// Cancellation is observed at tick boundaries only. An in-flight generation
/// call always finishes; interrupting the model itself is the collaborator's
/// concern, not this loop's.
pub struct BatchEngine {
    state: StateMachine,
    queue: Arc<BatchQueue>,
    cache: Arc<ArtifactCache>,
    store: Arc<StateStore>,
    unit: GenerationUnit,
    config: BatchConfig,
    cancel_rx: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
}

impl BatchEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: StateMachine,
        queue: Arc<BatchQueue>,
        cache: Arc<ArtifactCache>,
        store: Arc<StateStore>,
        unit: GenerationUnit,
        config: BatchConfig,
        cancel_rx: watch::Receiver<bool>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state,
            queue,
            cache,
            store,
            unit,
            config,
            cancel_rx,
            metrics,
        }
    }

    /// Run the batch to its end state and return the final snapshot.
    ///
    /// Exit paths: queue drained (`Completed`), cancel flag observed
    /// (`Cancelling` then `Idle`), failure (`Error` with `last_error`), or
    /// an external status change the loop does not own. The artifact cache
    /// is cleared on every path.
    pub fn run(mut self) -> BatchState {
        tracing::info!(
            batch_id = %self.config.batch_id,
            total = self.config.total_items,
            best_of_n = self.config.best_of_n,
            "batch loop started"
        );

        let started = Instant::now();
        let mut accepted_scores: Vec<f32> = Vec::new();

        loop {
            // (1) Status gate: only RUNNING proceeds
            match self.state.status() {
                BatchStatus::Running => {}
                BatchStatus::Paused => {
                    if !self.park_while_paused() {
                        return self.finish_cancelled();
                    }
                    continue;
                }
                other => {
                    tracing::warn!(status = ?other, "loop stopping: engine no longer running");
                    self.cache.clear();
                    return self.state.snapshot();
                }
            }

            // (2) Cancel flag, observed at the tick boundary only
            if *self.cancel_rx.borrow() {
                return self.finish_cancelled();
            }

            // (3) Dequeue; empty queue means the batch is done
            let Some(item) = self.queue.dequeue() else {
                return self.finish_completed(started, &accepted_scores);
            };

            tracing::info!(
                index = item.index,
                total = self.config.total_items,
                "tick started"
            );

            // (4) One synchronous generation; artifacts resolve through the
            // per-batch cache so only the first tick pays for them
            let verdict = self
                .unit
                .resolve_artifacts(&self.config, &self.cache)
                .and_then(|artifacts| self.unit.generate_item(&item, &artifacts));

            match verdict {
                Ok(ItemVerdict::Accepted { score }) => {
                    accepted_scores.push(score);
                    self.metrics.record_item_accepted();
                    if let Err(e) = self.state.record_item(true, Some(score)) {
                        return self.finish_failed(format!("tick sync failed: {e}"));
                    }
                }
                Ok(ItemVerdict::Rejected { best_score }) => {
                    self.metrics.record_item_rejected();
                    if let Err(e) = self.state.record_item(false, best_score) {
                        return self.finish_failed(format!("tick sync failed: {e}"));
                    }
                }
                Err(e) => {
                    return self.finish_failed(e.to_string());
                }
            }
        }
    }

    /// Park at the tick boundary while paused.
    ///
    /// Returns `true` to resume ticking, `false` when cancellation was
    /// requested while parked.
    fn park_while_paused(&mut self) -> bool {
        tracing::info!("loop parked: batch paused");
        loop {
            if *self.cancel_rx.borrow() {
                return false;
            }
            match self.state.status() {
                BatchStatus::Paused => std::thread::sleep(PAUSE_POLL_INTERVAL),
                BatchStatus::Running => {
                    tracing::info!("loop resumed");
                    return true;
                }
                other => {
                    tracing::warn!(status = ?other, "pause ended by external transition");
                    return true;
                }
            }
        }
    }

    fn finish_completed(self, started: Instant, accepted_scores: &[f32]) -> BatchState {
        let state = match self.state.request_transition(BatchStatus::Completed) {
            Ok(state) => state,
            Err(e) => {
                return self.finish_failed(format!("failed to complete batch: {e}"));
            }
        };

        let report = BatchReport::from_run(
            self.config.batch_id.as_str(),
            self.config.preset.clone(),
            state.total_items,
            state.accepted_count,
            state.rejected_count,
            started.elapsed(),
            accepted_scores,
        );
        if let Err(e) = self.store.save_report(&report) {
            // The report is advisory; the state snapshot already holds the counters
            tracing::warn!("failed to persist batch report: {e}");
        }

        self.cache.clear();
        self.metrics.log_summary();

        tracing::info!(
            batch_id = %self.config.batch_id,
            accepted = state.accepted_count,
            rejected = state.rejected_count,
            "batch completed"
        );
        state
    }

    fn finish_cancelled(self) -> BatchState {
        tracing::info!(batch_id = %self.config.batch_id, "cancel observed at tick boundary");

        if let Err(e) = self.state.request_transition(BatchStatus::Cancelling) {
            tracing::warn!("cancel transition rejected: {e}");
        }
        self.queue.clear();
        self.cache.clear();

        match self.state.request_transition(BatchStatus::Idle) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("failed to settle cancellation: {e}");
                self.state.snapshot()
            }
        }
    }

    fn finish_failed(self, message: String) -> BatchState {
        self.queue.clear();
        self.cache.clear();

        match self.state.fail(message.as_str()) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("failed to record batch error: {e} (original: {message})");
                self.state.snapshot()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawOutput;
    use crate::services::generation::{
        ArtifactRequest, GenerationBackend, InferenceError, OutputSink, ResolvedArtifacts,
    };
    use crate::services::quality::{QualityGate, QualityScorer};
    use crate::cache::ArtifactValue;
    use camino::Utf8PathBuf;
    use indexmap::IndexMap;
    use std::sync::Mutex;

    /// Backend that replays a scripted list of per-call outcomes.
    struct ScriptedBackend {
        outcomes: Mutex<Vec<Result<RawOutput, InferenceError>>>,
    }

    impl ScriptedBackend {
        fn with_outputs(count: usize) -> Self {
            let outcomes = (0..count)
                .map(|_| Ok(varied_output()))
                .collect::<Vec<_>>();
            Self {
                outcomes: Mutex::new(outcomes),
            }
        }
    }

    impl GenerationBackend for ScriptedBackend {
        fn run_inference(
            &self,
            _params: &crate::models::ItemParams,
            _artifacts: &ResolvedArtifacts,
        ) -> Result<RawOutput, InferenceError> {
            self.outcomes
                .lock()
                .unwrap()
                .remove(0)
        }

        fn prepare_artifact(
            &self,
            _request: &ArtifactRequest,
        ) -> Result<ArtifactValue, InferenceError> {
            Ok(ArtifactValue::PoseMap(vec![0u8; 4]))
        }
    }

    struct ConstScorer(f32);

    impl QualityScorer for ConstScorer {
        fn score_output(&self, _output: &RawOutput, _prompt: &str) -> f32 {
            self.0
        }
    }

    #[derive(Default)]
    struct CountingSink {
        committed: Mutex<Vec<usize>>,
    }

    impl OutputSink for CountingSink {
        fn commit(
            &self,
            index: usize,
            _output: &RawOutput,
            _score: f32,
        ) -> anyhow::Result<Utf8PathBuf> {
            self.committed.lock().unwrap().push(index);
            Ok(Utf8PathBuf::from(format!("out/{index}.png")))
        }

        fn commit_rejected(
            &self,
            index: usize,
            _output: &RawOutput,
            _score: f32,
        ) -> anyhow::Result<Utf8PathBuf> {
            Ok(Utf8PathBuf::from(format!("rejected/{index}.png")))
        }
    }

    fn varied_output() -> RawOutput {
        RawOutput {
            pixels: vec![0.2, 0.5, 0.8, 0.4],
            width: 2,
            height: 2,
            metadata: IndexMap::new(),
        }
    }

    fn engine_for(
        config: &BatchConfig,
        backend: Arc<dyn GenerationBackend>,
        score: f32,
        store: Arc<StateStore>,
    ) -> (BatchEngine, StateMachine, watch::Sender<bool>) {
        let metrics = Arc::new(Metrics::new());
        let state = StateMachine::with_store(Arc::clone(&store));
        state.request_transition(BatchStatus::Preparing).unwrap();
        state.begin_batch(config).unwrap();
        state.request_transition(BatchStatus::Running).unwrap();

        let queue = Arc::new(BatchQueue::from_config(config));
        let cache = Arc::new(ArtifactCache::new(Arc::clone(&metrics)));
        let unit = GenerationUnit::new(
            backend,
            Arc::new(ConstScorer(score)),
            Arc::new(CountingSink::default()),
            QualityGate::new(config.quality_threshold).unwrap(),
            config.best_of_n,
            config.save_rejected,
            Arc::clone(&metrics),
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let engine = BatchEngine::new(
            state.clone(),
            queue,
            cache,
            store,
            unit,
            config.clone(),
            cancel_rx,
            metrics,
        );
        (engine, state, cancel_tx)
    }

    fn test_store() -> (Arc<StateStore>, tempfile::TempDir) {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        (Arc::new(StateStore::new(dir).unwrap()), tmp)
    }

    #[test]
    fn test_run_to_completion() {
        let (store, _tmp) = test_store();
        let config = BatchConfig::new("b1", "a cat", 4);
        let backend = Arc::new(ScriptedBackend::with_outputs(4));
        let (engine, _state, _cancel) = engine_for(&config, backend, 0.5, Arc::clone(&store));

        let final_state = engine.run();

        assert_eq!(final_state.status, BatchStatus::Completed);
        assert_eq!(final_state.accepted_count, 4);
        assert_eq!(final_state.current_index, 4);
        assert!(final_state.counters_balanced());

        let report = store.load_report().unwrap().unwrap();
        assert_eq!(report.accepted, 4);
        assert_eq!(report.rejected, 0);
    }

    #[test]
    fn test_low_scores_record_rejections() {
        let (store, _tmp) = test_store();
        let config = BatchConfig::new("b1", "a cat", 3);
        let backend = Arc::new(ScriptedBackend::with_outputs(3));
        let (engine, _state, _cancel) = engine_for(&config, backend, 0.1, store);

        let final_state = engine.run();

        assert_eq!(final_state.status, BatchStatus::Completed);
        assert_eq!(final_state.accepted_count, 0);
        assert_eq!(final_state.rejected_count, 3);
    }

    #[test]
    fn test_oom_drives_error_state() {
        let (store, _tmp) = test_store();
        let config = BatchConfig::new("b1", "a cat", 5);
        let backend = Arc::new(ScriptedBackend {
            outcomes: Mutex::new(vec![
                Ok(varied_output()),
                Err(InferenceError::OutOfMemory("CUDA OOM".to_string())),
            ]),
        });
        let (engine, _state, _cancel) = engine_for(&config, backend, 0.5, store);

        let final_state = engine.run();

        assert_eq!(final_state.status, BatchStatus::Error);
        assert!(
            final_state
                .last_error
                .as_deref()
                .unwrap()
                .contains("CUDA OOM")
        );
        // The completed first tick survived
        assert_eq!(final_state.current_index, 1);
        assert_eq!(final_state.accepted_count, 1);
    }

    #[test]
    fn test_cancel_before_first_tick() {
        let (store, _tmp) = test_store();
        let config = BatchConfig::new("b1", "a cat", 10);
        let backend = Arc::new(ScriptedBackend::with_outputs(10));
        let (engine, _state, cancel_tx) = engine_for(&config, backend, 0.5, store);

        cancel_tx.send(true).unwrap();
        let final_state = engine.run();

        assert_eq!(final_state.status, BatchStatus::Idle);
        assert_eq!(final_state.current_index, 0);
    }
}
