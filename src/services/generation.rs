use crate::cache::{ArtifactCache, ArtifactKey, ArtifactKind, ArtifactValue};
use crate::error::EngineError;
use crate::metrics::Metrics;
use crate::models::{BatchConfig, CandidateResult, ItemParams, ItemVerdict, QueueItem, RawOutput};
use crate::services::quality::{QualityGate, QualityScorer};
use camino::Utf8PathBuf;
use std::fs;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Failures reported by the model collaborator.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// GPU memory exhaustion; drives a forced transition to `Error` and is
    /// never retried within the same run
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Any other inference failure
    #[error("inference failed: {0}")]
    Failed(String),
}

impl From<InferenceError> for EngineError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::OutOfMemory(details) => EngineError::ResourceExhaustion(details),
            InferenceError::Failed(details) => EngineError::Generation(details),
        }
    }
}

/// Inputs for one expensive preprocessing pass (pose/depth extraction, face
/// embedding). The engine caches the result per batch; the collaborator only
/// ever sees cache misses.
#[derive(Debug, Clone)]
pub struct ArtifactRequest {
    pub kind: ArtifactKind,
    pub source: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// The model collaborator boundary.
///
/// Implementations wrap the actual SDXL/ControlNet execution; the engine
/// treats them as a blocking black box and distinguishes only the
/// out-of-memory failure class.
#[cfg_attr(test, mockall::automock)]
pub trait GenerationBackend: Send + Sync {
    /// Produce one image for the given parameters.
    fn run_inference(
        &self,
        params: &ItemParams,
        artifacts: &ResolvedArtifacts,
    ) -> Result<RawOutput, InferenceError>;

    /// Compute one reusable artifact from reference inputs.
    fn prepare_artifact(&self, request: &ArtifactRequest) -> Result<ArtifactValue, InferenceError>;

    /// Release transient model resources (GPU scratch memory).
    ///
    /// Called after every inference attempt and on the error path.
    fn release_resources(&self) {}
}

/// Destination for quality-approved outputs.
#[cfg_attr(test, mockall::automock)]
pub trait OutputSink: Send + Sync {
    /// Commit an accepted output; returns where it was stored.
    fn commit(&self, index: usize, output: &RawOutput, score: f32) -> anyhow::Result<Utf8PathBuf>;

    /// Commit a rejected output to the rejected area (opt-in via config).
    fn commit_rejected(
        &self,
        index: usize,
        output: &RawOutput,
        score: f32,
    ) -> anyhow::Result<Utf8PathBuf>;
}

/// Artifacts resolved for the current batch, shared across items.
#[derive(Debug, Clone, Default)]
pub struct ResolvedArtifacts {
    pub pose: Option<Arc<ArtifactValue>>,
    pub depth: Option<Arc<ArtifactValue>>,
    pub face: Option<Arc<ArtifactValue>>,
}

/// The atomic "produce one image" operation.
///
/// Drives up to `best_of_n` sequential inference calls per queue item,
/// scores each candidate through the quality gate, and commits the single
/// best passing candidate. Candidates are generated strictly one after
/// another; there is no parallel candidate generation.
pub struct GenerationUnit {
    backend: Arc<dyn GenerationBackend>,
    scorer: Arc<dyn QualityScorer>,
    sink: Arc<dyn OutputSink>,
    gate: QualityGate,
    best_of_n: u32,
    save_rejected: bool,
    metrics: Arc<Metrics>,
}

impl GenerationUnit {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        scorer: Arc<dyn QualityScorer>,
        sink: Arc<dyn OutputSink>,
        gate: QualityGate,
        best_of_n: u32,
        save_rejected: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            scorer,
            sink,
            gate,
            best_of_n: best_of_n.max(1),
            save_rejected,
            metrics,
        }
    }

    /// Resolve the batch's reusable artifacts through the cache.
    ///
    /// Called once per tick; after the first item every lookup is a cache
    /// hit, so the expensive preprocessing runs exactly once per batch.
    pub fn resolve_artifacts(
        &self,
        config: &BatchConfig,
        cache: &ArtifactCache,
    ) -> Result<ResolvedArtifacts, EngineError> {
        let mut artifacts = ResolvedArtifacts::default();
        let (width, height) = (config.sampling.width, config.sampling.height);

        if let Some(path) = &config.control_image {
            let source = fs::read(path).map_err(|e| {
                EngineError::Generation(format!("failed to read control image {path}: {e}"))
            })?;

            artifacts.pose = Some(self.cached_artifact(
                cache,
                ArtifactKind::PoseMap,
                &source,
                width,
                height,
            )?);
            artifacts.depth = Some(self.cached_artifact(
                cache,
                ArtifactKind::DepthMap,
                &source,
                width,
                height,
            )?);
        }

        if let Some(path) = &config.face_image {
            let source = fs::read(path).map_err(|e| {
                EngineError::Generation(format!("failed to read face image {path}: {e}"))
            })?;

            artifacts.face = Some(self.cached_artifact(
                cache,
                ArtifactKind::FaceEmbedding,
                &source,
                width,
                height,
            )?);
        }

        Ok(artifacts)
    }

    fn cached_artifact(
        &self,
        cache: &ArtifactCache,
        kind: ArtifactKind,
        source: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Arc<ArtifactValue>, EngineError> {
        let key = ArtifactKey::derive(kind, source, width, height);
        cache.get_or_compute(key, || {
            self.backend
                .prepare_artifact(&ArtifactRequest {
                    kind,
                    source: source.to_vec(),
                    width,
                    height,
                })
                .map_err(EngineError::from)
        })
    }

    /// Run one full item: Best-of-N generation, gating, and commit.
    ///
    /// Inference failures abort the item and surface to the loop, which
    /// terminates the batch; quality rejections are a normal verdict, not an
    /// error.
    pub fn generate_item(
        &self,
        item: &QueueItem,
        artifacts: &ResolvedArtifacts,
    ) -> Result<ItemVerdict, EngineError> {
        let mut best: Option<CandidateResult> = None;

        for attempt in 0..self.best_of_n {
            if self.best_of_n > 1 {
                tracing::debug!(
                    index = item.index,
                    attempt = attempt + 1,
                    of = self.best_of_n,
                    "generating candidate"
                );
            }

            let params = item.params.with_candidate_seed(attempt);
            let started = Instant::now();
            let result = self.backend.run_inference(&params, artifacts);
            self.backend.release_resources();

            let output = result?;
            self.metrics.record_candidate(started.elapsed());

            if QualityGate::is_degenerate(&output) {
                self.metrics.record_degenerate_candidate();
                tracing::warn!(index = item.index, attempt, "candidate rejected as degenerate");
                continue;
            }

            let score = self.gate.evaluate(self.scorer.as_ref(), &output, &params.prompt);

            // Strict > keeps the first-generated candidate on equal scores
            let is_better = best.as_ref().map(|b| score > b.score).unwrap_or(true);
            if is_better {
                best = Some(CandidateResult { output, score });
            }
        }

        match best {
            Some(candidate) if self.gate.accept(candidate.score) => {
                let path = self
                    .sink
                    .commit(item.index, &candidate.output, candidate.score)
                    .map_err(|e| {
                        EngineError::Generation(format!("failed to commit output: {e}"))
                    })?;

                tracing::info!(
                    index = item.index,
                    score = candidate.score,
                    %path,
                    "item accepted"
                );
                Ok(ItemVerdict::Accepted {
                    score: candidate.score,
                })
            }
            Some(candidate) => {
                tracing::info!(
                    index = item.index,
                    best_score = candidate.score,
                    threshold = self.gate.threshold(),
                    "item rejected below threshold"
                );

                if self.save_rejected {
                    if let Err(e) =
                        self.sink
                            .commit_rejected(item.index, &candidate.output, candidate.score)
                    {
                        tracing::warn!(index = item.index, "failed to save rejected output: {e}");
                    }
                }

                Ok(ItemVerdict::Rejected {
                    best_score: Some(candidate.score),
                })
            }
            None => {
                tracing::info!(index = item.index, "item rejected: no usable candidate");
                Ok(ItemVerdict::Rejected { best_score: None })
            }
        }
    }
}
