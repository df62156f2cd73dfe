// GenBatch - Unattended batch orchestration for generative image pipelines
//
// Library crate containing the orchestration core: state machine, sequential
// batch loop, persistence/recovery, quality gating, Best-of-N selection, and
// the per-batch artifact cache. Model inference, CLIP scoring, and output
// storage are external collaborators reached through the traits in
// `services`.

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod persistence;
pub mod queue;
pub mod services;
pub mod state;
pub mod ui;

// Re-export commonly used types for convenience
pub use cache::{ArtifactCache, ArtifactKey, ArtifactKind, ArtifactValue};
pub use config::ConfigManager;
pub use controller::BatchController;
pub use error::{EngineError, PersistenceError};
pub use metrics::{BatchReport, Metrics};
pub use models::{BatchConfig, BatchState, BatchStatus, ItemVerdict};
pub use persistence::{StartupOutcome, StateStore};
pub use queue::BatchQueue;
pub use services::{GenerationBackend, OutputSink, QualityGate, QualityScorer};
pub use state::{StateChange, StateMachine};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
