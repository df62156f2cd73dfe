//! Services module - Core orchestration logic for batch image generation.
//!
//! This module contains the engine's working parts. The services are
//! **framework-agnostic** and have no dependencies on any presentation
//! layer, making them testable and reusable.
//!
//! # Components
//!
//! - [`engine::BatchEngine`]: The sequential batch loop. Drives one batch to
//!   completion or a controlled stop, one item at a time:
//!   - Gates every tick on the state machine's status
//!   - Observes the cancel flag only at tick boundaries
//!   - Performs the atomic per-tick persistence sync before the next tick
//!
//! - [`generation::GenerationUnit`]: The atomic "produce one image"
//!   operation, including the Best-of-N candidate selector and the commit of
//!   the single winning output.
//!
//! - [`quality::QualityGate`]: The accept/reject classifier applied to
//!   generated candidates, with a technical check for degenerate outputs.
//!
//! # Collaborator boundaries
//!
//! Actual model execution and semantic scoring live behind traits:
//!
//! - [`generation::GenerationBackend`]: `run_inference`, `prepare_artifact`,
//!   `release_resources` - the SDXL/ControlNet side
//! - [`quality::QualityScorer`]: `score_output` - the CLIP side
//! - [`generation::OutputSink`]: `commit` / `commit_rejected` - where
//!   approved images go
//!
//! The engine treats all three as blocking black boxes and distinguishes
//! only the out-of-memory failure class, which forces the `Error` state.

pub mod engine;
pub mod generation;
pub mod quality;

pub use engine::BatchEngine;
pub use generation::{
    ArtifactRequest, GenerationBackend, GenerationUnit, InferenceError, OutputSink,
    ResolvedArtifacts,
};
pub use quality::{QualityGate, QualityScorer};
