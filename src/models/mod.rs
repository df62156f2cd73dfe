//! Data models for the GenBatch engine.
//!
//! This module contains the core data structures used throughout the crate:
//! - [`BatchState`]: The authoritative lifecycle record (status, counters, last error)
//! - [`BatchStatus`]: The global lifecycle states validated by the state machine
//! - [`BatchConfig`]: Immutable description of one requested batch
//! - [`QueueItem`] / [`ItemParams`]: One pending unit of work and its resolved parameters
//! - [`RawOutput`] / [`CandidateResult`]: Collaborator output and its transient scored form
//! - [`MAX_CONCURRENT_GENERATIONS`]: Critical concurrency limit constant (always 1)
//!
//! # Architecture Note
//!
//! The models are designed to be:
//! - **Serializable**: `BatchState` and the config structs derive `Serialize`/`Deserialize`
//!   for durable snapshots and YAML configuration
//! - **Cloneable**: `BatchState` is wrapped in `Arc<RwLock<>>` by
//!   [`StateMachine`](crate::state::StateMachine) for thread-safe access
//! - **Immutable**: state updates go through the state machine's transition function to
//!   ensure consistency

pub mod batch_state;
pub mod config;
pub mod item;

pub use batch_state::{BatchState, BatchStatus, MAX_CONCURRENT_GENERATIONS};
pub use config::{BatchConfig, PresetConfig, SamplingParams, Settings};
pub use item::{CandidateResult, ItemParams, ItemVerdict, QueueItem, RawOutput};
