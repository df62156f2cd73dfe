use crate::error::EngineError;
use crate::models::RawOutput;

/// Pixel-statistics floor below which an output is considered degenerate.
///
/// Black frames and washed-out frames sit outside `[MIN_MEAN, MAX_MEAN]`;
/// mode collapse shows up as a standard deviation under `MIN_STD`.
const MIN_MEAN: f32 = 0.05;
const MAX_MEAN: f32 = 0.95;
const MIN_STD: f32 = 0.02;

/// Scores a candidate output against its prompt and classifies it.
///
/// The gate is side-effect-free with respect to the generation pipeline: it
/// never blocks, cancels, or retries a generation call, only classifies an
/// already-produced output. The acceptance threshold is per-batch
/// configuration, never hard-coded.
#[derive(Debug, Clone, Copy)]
pub struct QualityGate {
    threshold: f32,
}

/// External collaborator that computes a semantic prompt-alignment score.
///
/// The engine consumes only the numeric score; how it is computed (CLIP or
/// otherwise) is the collaborator's concern.
#[cfg_attr(test, mockall::automock)]
pub trait QualityScorer: Send + Sync {
    fn score_output(&self, output: &RawOutput, prompt: &str) -> f32;
}

impl QualityGate {
    /// Create a gate with the given per-batch acceptance threshold.
    pub fn new(threshold: f32) -> Result<Self, EngineError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(EngineError::InvalidConfig(format!(
                "quality threshold must be in [0, 1], got {threshold}"
            )));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Score a candidate against its prompt, clamped to `[0, 1]`.
    pub fn evaluate(&self, scorer: &dyn QualityScorer, output: &RawOutput, prompt: &str) -> f32 {
        let score = scorer.score_output(output, prompt).clamp(0.0, 1.0);
        tracing::debug!(score, "candidate scored");
        score
    }

    /// True iff the score clears the acceptance threshold.
    pub fn accept(&self, score: f32) -> bool {
        score >= self.threshold
    }

    /// Technical check flagging degenerate outputs.
    ///
    /// Near-uniform pixel statistics (black frame, washout, mode collapse)
    /// are automatic rejects regardless of semantic score.
    pub fn is_degenerate(output: &RawOutput) -> bool {
        let (mean, std) = output.pixel_stats();

        if mean < MIN_MEAN || mean > MAX_MEAN {
            tracing::debug!(mean, "degenerate output: mean outside range");
            return true;
        }
        if std < MIN_STD {
            tracing::debug!(std, "degenerate output: near-uniform pixels");
            return true;
        }
        false
    }
}
