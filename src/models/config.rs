use crate::error::EngineError;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// User settings from `Settings.yaml`.
///
/// Controls where the engine keeps its durable files and which filter
/// defaults apply when a batch config leaves them unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "State Directory", default = "default_state_dir")]
    pub state_dir: String,

    #[serde(rename = "Output Directory", default = "default_output_dir")]
    pub output_dir: String,

    #[serde(rename = "Log Directory", default = "default_log_dir")]
    pub log_dir: String,

    #[serde(rename = "Quality Threshold", default = "default_quality_threshold")]
    pub quality_threshold: f32,

    #[serde(rename = "Best Of N", default = "default_best_of_n")]
    pub best_of_n: u32,

    #[serde(rename = "Save Rejected", default)]
    pub save_rejected: bool,

    #[serde(rename = "Debug Mode", default)]
    pub debug_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            output_dir: default_output_dir(),
            log_dir: default_log_dir(),
            quality_threshold: default_quality_threshold(),
            best_of_n: default_best_of_n(),
            save_rejected: false,
            debug_mode: false,
        }
    }
}

fn default_state_dir() -> String {
    "outputs/batches".to_string()
}

fn default_output_dir() -> String {
    "outputs/images".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_quality_threshold() -> f32 {
    0.25
}

fn default_best_of_n() -> u32 {
    1
}

/// A named preset from `presets/<name>.yaml`.
///
/// Presets overlay filter and sampling settings onto a batch config at start
/// time; unset fields leave the config untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresetConfig {
    #[serde(default)]
    pub name: String,

    #[serde(rename = "Quality Threshold", default)]
    pub quality_threshold: Option<f32>,

    #[serde(rename = "Best Of N", default)]
    pub best_of_n: Option<u32>,

    #[serde(rename = "Steps", default)]
    pub steps: Option<u32>,

    #[serde(rename = "Guidance Scale", default)]
    pub guidance_scale: Option<f32>,
}

/// Base sampling parameters shared by every item of a batch.
///
/// Per-item variation is limited to the seed, which the queue derives from
/// `seed + index` when it materializes [`QueueItem`](crate::models::QueueItem)s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub seed: i64,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub guidance_scale: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            seed: 0,
            steps: 30,
            width: 1024,
            height: 1024,
            guidance_scale: 4.0,
        }
    }
}

/// Immutable description of one requested batch.
///
/// Treated as read-only once a batch starts; a new batch requires a new
/// config. Persisted once at batch start and never rewritten mid-batch, so
/// recovery can rebuild the remaining queue from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub batch_id: String,
    pub prompt: String,

    #[serde(default)]
    pub negative_prompt: String,

    pub total_items: usize,

    #[serde(default)]
    pub preset: Option<String>,

    pub quality_threshold: f32,

    pub best_of_n: u32,

    #[serde(default)]
    pub sampling: SamplingParams,

    /// Reference image whose derived pose/depth maps are cached for the batch
    #[serde(default)]
    pub control_image: Option<Utf8PathBuf>,

    /// Reference face whose embedding is cached for the batch
    #[serde(default)]
    pub face_image: Option<Utf8PathBuf>,

    #[serde(default)]
    pub save_rejected: bool,
}

impl BatchConfig {
    /// Create a config with filter defaults taken from [`Settings`].
    pub fn new(batch_id: impl Into<String>, prompt: impl Into<String>, total_items: usize) -> Self {
        let settings = Settings::default();
        Self {
            batch_id: batch_id.into(),
            prompt: prompt.into(),
            negative_prompt: String::new(),
            total_items,
            preset: None,
            quality_threshold: settings.quality_threshold,
            best_of_n: settings.best_of_n,
            sampling: SamplingParams::default(),
            control_image: None,
            face_image: None,
            save_rejected: settings.save_rejected,
        }
    }

    /// Overlay a preset's set fields onto this config.
    pub fn apply_preset(&mut self, preset: &PresetConfig) {
        if !preset.name.is_empty() {
            self.preset = Some(preset.name.clone());
        }
        if let Some(threshold) = preset.quality_threshold {
            self.quality_threshold = threshold;
        }
        if let Some(n) = preset.best_of_n {
            self.best_of_n = n;
        }
        if let Some(steps) = preset.steps {
            self.sampling.steps = steps;
        }
        if let Some(scale) = preset.guidance_scale {
            self.sampling.guidance_scale = scale;
        }
    }

    /// Validate the fields a batch cannot start without.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.batch_id.is_empty() {
            return Err(EngineError::InvalidConfig("batch_id is empty".to_string()));
        }
        if self.total_items == 0 {
            return Err(EngineError::InvalidConfig(
                "total_items must be > 0".to_string(),
            ));
        }
        if self.best_of_n == 0 {
            return Err(EngineError::InvalidConfig(
                "best_of_n must be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(EngineError::InvalidConfig(format!(
                "quality_threshold must be in [0, 1], got {}",
                self.quality_threshold
            )));
        }
        Ok(())
    }
}
