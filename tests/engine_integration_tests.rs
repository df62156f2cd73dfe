//! Integration tests for the full orchestration path
//!
//! These tests drive a BatchController with in-memory collaborators through
//! complete batch runs and verify:
//! - Exactly-once progress accounting across the sequential loop
//! - Best-of-N selection at the whole-engine level
//! - Cancellation semantics at tick boundaries
//! - Per-batch artifact caching
//! - Failure handling (OOM), acknowledgment, and crash recovery

use genbatch::cache::ArtifactValue;
use genbatch::models::{BatchConfig, BatchState, BatchStatus, ItemParams, RawOutput};
use genbatch::persistence::{StartupOutcome, StateStore};
use genbatch::services::generation::{
    ArtifactRequest, GenerationBackend, InferenceError, OutputSink, ResolvedArtifacts,
};
use genbatch::services::quality::QualityScorer;
use genbatch::state::StateChange;
use genbatch::{BatchController, EngineError};
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ===== In-memory collaborators =====

type CallHook = Box<dyn Fn() + Send>;

/// Backend producing well-formed outputs, with an optional scripted OOM and
/// an optional hook fired at the start of a specific inference call.
#[derive(Default)]
struct FakeBackend {
    inference_calls: AtomicUsize,
    artifact_calls: AtomicUsize,
    oom_at_call: Option<usize>,
    hook: Mutex<Option<(usize, CallHook)>>,
}

impl FakeBackend {
    fn with_oom_at(call: usize) -> Self {
        Self {
            oom_at_call: Some(call),
            ..Self::default()
        }
    }

    fn set_hook(&self, at_call: usize, hook: impl Fn() + Send + 'static) {
        *self.hook.lock().unwrap() = Some((at_call, Box::new(hook)));
    }
}

impl GenerationBackend for FakeBackend {
    fn run_inference(
        &self,
        _params: &ItemParams,
        _artifacts: &ResolvedArtifacts,
    ) -> Result<RawOutput, InferenceError> {
        let call = self.inference_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some((at, hook)) = &*self.hook.lock().unwrap() {
            if call == *at {
                hook();
            }
        }

        if self.oom_at_call == Some(call) {
            return Err(InferenceError::OutOfMemory("CUDA out of memory".to_string()));
        }

        Ok(RawOutput {
            pixels: vec![0.2, 0.5, 0.8, 0.4],
            width: 2,
            height: 2,
            metadata: IndexMap::new(),
        })
    }

    fn prepare_artifact(&self, request: &ArtifactRequest) -> Result<ArtifactValue, InferenceError> {
        self.artifact_calls.fetch_add(1, Ordering::SeqCst);
        Ok(match request.kind {
            genbatch::ArtifactKind::FaceEmbedding => ArtifactValue::FaceEmbedding(vec![0.5; 8]),
            genbatch::ArtifactKind::PoseMap => ArtifactValue::PoseMap(vec![1; 16]),
            genbatch::ArtifactKind::DepthMap => ArtifactValue::DepthMap(vec![2; 16]),
        })
    }
}

/// Scorer replaying a scripted score sequence, then a constant fallback.
struct ScriptedScorer {
    scores: Mutex<VecDeque<f32>>,
    fallback: f32,
}

impl ScriptedScorer {
    fn constant(score: f32) -> Self {
        Self {
            scores: Mutex::new(VecDeque::new()),
            fallback: score,
        }
    }

    fn sequence(scores: &[f32], fallback: f32) -> Self {
        Self {
            scores: Mutex::new(scores.iter().copied().collect()),
            fallback,
        }
    }
}

impl QualityScorer for ScriptedScorer {
    fn score_output(&self, _output: &RawOutput, _prompt: &str) -> f32 {
        self.scores
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

/// Sink recording every committed output in memory.
#[derive(Default)]
struct RecordingSink {
    committed: Mutex<Vec<(usize, f32)>>,
    rejected: Mutex<Vec<(usize, f32)>>,
}

impl OutputSink for RecordingSink {
    fn commit(&self, index: usize, _output: &RawOutput, score: f32) -> anyhow::Result<Utf8PathBuf> {
        self.committed.lock().unwrap().push((index, score));
        Ok(Utf8PathBuf::from(format!("out/{index}.png")))
    }

    fn commit_rejected(
        &self,
        index: usize,
        _output: &RawOutput,
        score: f32,
    ) -> anyhow::Result<Utf8PathBuf> {
        self.rejected.lock().unwrap().push((index, score));
        Ok(Utf8PathBuf::from(format!("rejected/{index}.png")))
    }
}

// ===== Harness =====

struct Harness {
    controller: Arc<BatchController>,
    backend: Arc<FakeBackend>,
    sink: Arc<RecordingSink>,
    store: Arc<StateStore>,
    _tmp: TempDir,
}

fn harness(backend: FakeBackend, scorer: ScriptedScorer) -> Harness {
    let tmp = TempDir::new().unwrap();
    let dir = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
    let store = Arc::new(StateStore::new(dir.join("state")).unwrap());

    let backend = Arc::new(backend);
    let sink = Arc::new(RecordingSink::default());

    let controller = Arc::new(BatchController::new(
        Arc::clone(&store),
        Arc::clone(&backend) as Arc<dyn GenerationBackend>,
        Arc::new(scorer),
        Arc::clone(&sink) as Arc<dyn OutputSink>,
    ));

    Harness {
        controller,
        backend,
        sink,
        store,
        _tmp: tmp,
    }
}

fn wait_until(pred: impl Fn() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn config(total_items: usize) -> BatchConfig {
    BatchConfig::new("batch-test", "a lighthouse at dusk", total_items)
}

// ===== Tests =====

#[test]
fn test_full_batch_run_completes() {
    let h = harness(FakeBackend::default(), ScriptedScorer::constant(0.8));

    h.controller.request_start(config(5)).unwrap();
    let final_state = h.controller.wait().unwrap();

    assert_eq!(final_state.status, BatchStatus::Completed);
    assert_eq!(final_state.accepted_count, 5);
    assert_eq!(final_state.rejected_count, 0);
    assert_eq!(final_state.current_index, 5);
    assert!(final_state.counters_balanced());

    let committed = h.sink.committed.lock().unwrap();
    assert_eq!(committed.len(), 5);
    assert_eq!(
        committed.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4],
        "items commit in strict queue order"
    );

    // The durable report matches the final counters
    let report = h.store.load_report().unwrap().unwrap();
    assert_eq!(report.accepted, 5);
    assert_eq!(report.rejected, 0);
    assert_eq!(report.total, 5);
}

#[test]
fn test_best_of_n_selects_highest_scoring_candidate() {
    let mut cfg = config(1);
    cfg.best_of_n = 3;
    cfg.quality_threshold = 0.25;

    let h = harness(
        FakeBackend::default(),
        ScriptedScorer::sequence(&[0.10, 0.40, 0.22], 0.0),
    );

    h.controller.request_start(cfg).unwrap();
    let final_state = h.controller.wait().unwrap();

    assert_eq!(final_state.status, BatchStatus::Completed);
    assert_eq!(final_state.accepted_count, 1);
    assert_eq!(h.backend.inference_calls.load(Ordering::SeqCst), 3);

    let committed = h.sink.committed.lock().unwrap();
    assert_eq!(committed.len(), 1);
    assert!((committed[0].1 - 0.40).abs() < 1e-6);
}

#[test]
fn test_best_of_n_with_no_passing_candidate_commits_nothing() {
    let mut cfg = config(1);
    cfg.best_of_n = 2;
    cfg.quality_threshold = 0.25;

    let h = harness(
        FakeBackend::default(),
        ScriptedScorer::sequence(&[0.10, 0.05], 0.0),
    );

    h.controller.request_start(cfg).unwrap();
    let final_state = h.controller.wait().unwrap();

    assert_eq!(final_state.status, BatchStatus::Completed);
    assert_eq!(final_state.accepted_count, 0);
    assert_eq!(final_state.rejected_count, 1);
    assert!(h.sink.committed.lock().unwrap().is_empty());
}

#[test]
fn test_cancellation_lets_inflight_tick_finish() {
    let h = harness(FakeBackend::default(), ScriptedScorer::constant(0.8));
    let mut events = h.controller.subscribe();

    // Cancel while the 5th item's inference is in flight
    let controller = Arc::clone(&h.controller);
    h.backend.set_hook(5, move || controller.request_cancel());

    h.controller.request_start(config(10)).unwrap();
    let final_state = h.controller.wait().unwrap();

    // Tick 5 finished, tick 6 never started, and the engine settled to idle
    assert_eq!(final_state.status, BatchStatus::Idle);
    assert_eq!(final_state.current_index, 5);
    assert!(final_state.counters_balanced());
    assert_eq!(h.backend.inference_calls.load(Ordering::SeqCst), 5);
    assert_eq!(h.sink.committed.lock().unwrap().len(), 5);

    // The snapshot just before the reset carried current_index == 5
    let mut saw_fifth_tick = false;
    let mut saw_cancelling = false;
    let mut saw_idle = false;
    while let Ok(event) = events.try_recv() {
        match event {
            StateChange::TickCompleted { index: 4, .. } => saw_fifth_tick = true,
            StateChange::TransitionApplied {
                from: BatchStatus::Running,
                to: BatchStatus::Cancelling,
            } => saw_cancelling = true,
            StateChange::TransitionApplied {
                from: BatchStatus::Cancelling,
                to: BatchStatus::Idle,
            } => saw_idle = true,
            _ => {}
        }
    }
    assert!(saw_fifth_tick);
    assert!(saw_cancelling);
    assert!(saw_idle);
}

#[test]
fn test_artifacts_computed_once_per_batch() {
    let tmp = TempDir::new().unwrap();
    let pose_path = Utf8PathBuf::try_from(tmp.path().join("pose.png")).unwrap();
    let face_path = Utf8PathBuf::try_from(tmp.path().join("face.png")).unwrap();
    std::fs::write(&pose_path, b"fake-pose-reference").unwrap();
    std::fs::write(&face_path, b"fake-face-reference").unwrap();

    let mut cfg = config(4);
    cfg.control_image = Some(pose_path);
    cfg.face_image = Some(face_path);

    let h = harness(FakeBackend::default(), ScriptedScorer::constant(0.8));
    h.controller.request_start(cfg).unwrap();
    let final_state = h.controller.wait().unwrap();

    assert_eq!(final_state.status, BatchStatus::Completed);
    assert_eq!(final_state.accepted_count, 4);

    // Pose + depth + face embedding: three expensive computes total, despite
    // four items requesting them every tick
    assert_eq!(h.backend.artifact_calls.load(Ordering::SeqCst), 3);

    let metrics = h.controller.metrics();
    assert_eq!(metrics.cache_misses.load(Ordering::Relaxed), 3);
    assert_eq!(metrics.cache_hits.load(Ordering::Relaxed), 9);
}

#[test]
fn test_oom_drives_error_and_requires_acknowledgment() {
    let h = harness(FakeBackend::with_oom_at(3), ScriptedScorer::constant(0.8));

    h.controller.request_start(config(10)).unwrap();
    let final_state = h.controller.wait().unwrap();

    assert_eq!(final_state.status, BatchStatus::Error);
    assert!(
        final_state
            .last_error
            .as_deref()
            .unwrap()
            .contains("CUDA out of memory")
    );
    // The two completed ticks survived
    assert_eq!(final_state.current_index, 2);
    assert_eq!(final_state.accepted_count, 2);

    // A new batch cannot start until the error is acknowledged
    match h.controller.request_start(config(3)) {
        Err(EngineError::InvalidTransition { .. }) => {}
        other => panic!("expected InvalidTransition, got {other:?}"),
    }

    h.controller.request_acknowledge().unwrap();
    assert_eq!(h.controller.snapshot().status, BatchStatus::Idle);

    h.controller.request_start(config(3)).unwrap();
    let final_state = h.controller.wait().unwrap();
    assert_eq!(final_state.status, BatchStatus::Completed);
}

#[test]
fn test_pause_parks_loop_and_resume_continues() {
    let h = harness(FakeBackend::default(), ScriptedScorer::constant(0.8));

    let controller = Arc::clone(&h.controller);
    h.backend.set_hook(2, move || {
        controller.request_pause().unwrap();
    });

    h.controller.request_start(config(5)).unwrap();

    // The in-flight tick finishes, then the loop parks
    let snapshot = || h.controller.snapshot();
    wait_until(
        || snapshot().status == BatchStatus::Paused && snapshot().current_index == 2,
        "loop to park after tick 2",
    );

    // No further items are consumed while paused
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(h.backend.inference_calls.load(Ordering::SeqCst), 2);

    h.controller.request_resume().unwrap();
    let final_state = h.controller.wait().unwrap();

    assert_eq!(final_state.status, BatchStatus::Completed);
    assert_eq!(final_state.accepted_count, 5);
}

#[test]
fn test_recovery_resumes_remaining_items() {
    let tmp = TempDir::new().unwrap();
    let dir = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
    let store = Arc::new(StateStore::new(dir.join("state")).unwrap());

    // A previous process crashed three ticks into a ten-item batch
    let crashed_config = config(10);
    store.save_config(&crashed_config).unwrap();
    let mut crashed = BatchState::default();
    crashed.status = BatchStatus::Running;
    crashed.batch_id = crashed_config.batch_id.clone();
    crashed.total_items = 10;
    crashed.current_index = 3;
    crashed.accepted_count = 2;
    crashed.rejected_count = 1;
    store.save_state(&crashed).unwrap();

    let backend = Arc::new(FakeBackend::default());
    let sink = Arc::new(RecordingSink::default());
    let controller = BatchController::new(
        Arc::clone(&store),
        Arc::clone(&backend) as Arc<dyn GenerationBackend>,
        Arc::new(ScriptedScorer::constant(0.8)),
        Arc::clone(&sink) as Arc<dyn OutputSink>,
    );

    match controller.startup().unwrap() {
        StartupOutcome::Resumable { remaining, .. } => assert_eq!(remaining, 7),
        other => panic!("expected Resumable, got {other:?}"),
    }
    assert_eq!(controller.snapshot().status, BatchStatus::Preparing);

    controller.confirm_resume().unwrap();
    let final_state = controller.wait().unwrap();

    assert_eq!(final_state.status, BatchStatus::Completed);
    assert_eq!(final_state.current_index, 10);
    // 2 accepted before the crash + 7 after
    assert_eq!(final_state.accepted_count, 9);
    assert_eq!(final_state.rejected_count, 1);
    assert_eq!(backend.inference_calls.load(Ordering::SeqCst), 7);

    // Only the remaining indices were committed by this process
    let committed = sink.committed.lock().unwrap();
    assert_eq!(
        committed.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
        vec![3, 4, 5, 6, 7, 8, 9]
    );
}

#[test]
fn test_discard_recovery_returns_to_idle() {
    let tmp = TempDir::new().unwrap();
    let dir = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
    let store = Arc::new(StateStore::new(dir.join("state")).unwrap());

    let crashed_config = config(10);
    store.save_config(&crashed_config).unwrap();
    let mut crashed = BatchState::default();
    crashed.status = BatchStatus::Running;
    crashed.batch_id = crashed_config.batch_id.clone();
    crashed.total_items = 10;
    crashed.current_index = 3;
    crashed.accepted_count = 3;
    store.save_state(&crashed).unwrap();

    let h_backend = Arc::new(FakeBackend::default());
    let controller = BatchController::new(
        store,
        h_backend as Arc<dyn GenerationBackend>,
        Arc::new(ScriptedScorer::constant(0.8)),
        Arc::new(RecordingSink::default()) as Arc<dyn OutputSink>,
    );

    assert!(matches!(
        controller.startup().unwrap(),
        StartupOutcome::Resumable { .. }
    ));

    controller.discard_recovery().unwrap();
    assert_eq!(controller.snapshot().status, BatchStatus::Idle);

    // Nothing left to confirm
    assert!(matches!(
        controller.confirm_resume(),
        Err(EngineError::RecoveryAmbiguity(_))
    ));
}

#[test]
fn test_second_start_rejected_while_batch_active() {
    let h = harness(FakeBackend::default(), ScriptedScorer::constant(0.8));

    let controller = Arc::clone(&h.controller);
    let gate = Arc::new(Mutex::new(()));
    let guard = gate.lock().unwrap();
    let gate_clone = Arc::clone(&gate);
    h.backend.set_hook(1, move || {
        // Hold the first tick open until the assertion below has run
        drop(gate_clone.lock().unwrap());
    });

    controller.request_start(config(3)).unwrap();

    let result = controller.request_start(config(2));
    assert!(matches!(
        result,
        Err(EngineError::InvalidTransition {
            from: BatchStatus::Running,
            ..
        })
    ));

    drop(guard);
    let final_state = h.controller.wait().unwrap();
    assert_eq!(final_state.status, BatchStatus::Completed);
    assert_eq!(final_state.total_items, 3);
}
