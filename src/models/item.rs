use crate::models::config::{BatchConfig, SamplingParams};
use indexmap::IndexMap;

/// Fully resolved parameters for one generation call.
///
/// Derived from the batch config when the queue is built; the seed is the
/// only per-item variation (`base seed + index`), which keeps recovery
/// deterministic: rebuilding the queue from the same config yields the same
/// parameters for every remaining item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub sampling: SamplingParams,
}

impl ItemParams {
    pub fn resolve(config: &BatchConfig, index: usize) -> Self {
        let mut sampling = config.sampling.clone();
        sampling.seed = config.sampling.seed.wrapping_add(index as i64);
        Self {
            prompt: config.prompt.clone(),
            negative_prompt: config.negative_prompt.clone(),
            sampling,
        }
    }

    /// Variant used by the Best-of-N selector: offsets the seed per candidate
    /// so attempts differ while staying reproducible.
    pub fn with_candidate_seed(&self, attempt: u32) -> Self {
        let mut params = self.clone();
        params.sampling.seed = self.sampling.seed.wrapping_add((attempt as i64) << 32);
        params
    }
}

/// One pending unit of work.
///
/// Owned by the queue until dequeued; ownership transfers to the generation
/// unit for the duration of one tick, after which the item is discarded and
/// only its verdict survives in [`BatchState`](crate::models::BatchState).
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub index: usize,
    pub params: ItemParams,
}

/// Raw output handed back by the model collaborator.
///
/// The engine never interprets the image beyond pixel statistics for the
/// degenerate-output check; `pixels` are channel-interleaved values
/// normalized to `[0, 1]`.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub pixels: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub metadata: IndexMap<String, String>,
}

impl RawOutput {
    /// Mean and standard deviation over all pixel values.
    ///
    /// Returns `(0.0, 0.0)` for an empty buffer, which the quality gate
    /// treats as degenerate.
    pub fn pixel_stats(&self) -> (f32, f32) {
        if self.pixels.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.pixels.len() as f32;
        let mean = self.pixels.iter().sum::<f32>() / n;
        let variance = self
            .pixels
            .iter()
            .map(|p| {
                let d = p - mean;
                d * d
            })
            .sum::<f32>()
            / n;
        (mean, variance.sqrt())
    }
}

/// One generation attempt plus its quality score.
///
/// Exists only transiently inside the Best-of-N selector; the single
/// selected candidate (or none) is the only surviving artifact.
#[derive(Debug, Clone)]
pub struct CandidateResult {
    pub output: RawOutput,
    pub score: f32,
}

/// Final verdict for one queue item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemVerdict {
    /// The best candidate passed the gate and was committed
    Accepted { score: f32 },
    /// No candidate passed; nothing was committed
    Rejected { best_score: Option<f32> },
}

impl ItemVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ItemVerdict::Accepted { .. })
    }
}
