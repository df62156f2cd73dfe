//! Durable storage for batch state, config snapshots, and run reports.
//!
//! Every document is written with a write-temp-then-rename discipline so a
//! crash mid-write never corrupts the previously valid file: readers see
//! either the old snapshot or the new one, never a torn intermediate.

use crate::error::{EngineError, PersistenceError};
use crate::metrics::BatchReport;
use crate::models::{BatchConfig, BatchState, BatchStatus};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs::{self, File};
use std::io::Write;

/// Outcome of reading persisted state at process startup.
#[derive(Debug)]
pub enum StartupOutcome {
    /// No snapshot on disk; the engine starts from a default `Idle` state.
    FirstLaunch,

    /// A snapshot exists and describes a finished or idle system.
    Clean(BatchState),

    /// The last run was interrupted mid-batch. The returned state has been
    /// rewritten to `Preparing` and persisted; the caller must explicitly
    /// confirm before the remaining items are run.
    Resumable {
        state: BatchState,
        config: BatchConfig,
        remaining: usize,
    },
}

/// Atomic file store for the engine's durable documents.
///
/// Three documents live under the state directory:
/// - `state.json`: the [`BatchState`] snapshot, rewritten after every tick
/// - `config.json`: the [`BatchConfig`] of the active batch, written once at
///   batch start and treated as immutable until the next batch
/// - `report.json`: the [`BatchReport`] of the last completed run
#[derive(Debug, Clone)]
pub struct StateStore {
    state_dir: Utf8PathBuf,
    state_path: Utf8PathBuf,
    config_path: Utf8PathBuf,
    report_path: Utf8PathBuf,
}

impl StateStore {
    /// Create a StateStore rooted at the given directory, creating it if needed.
    pub fn new<P: AsRef<Utf8Path>>(state_dir: P) -> Result<Self, PersistenceError> {
        let state_dir = state_dir.as_ref().to_path_buf();

        if !state_dir.exists() {
            fs::create_dir_all(&state_dir)
                .map_err(|e| PersistenceError::io(state_dir.as_str(), e))?;
        }

        Ok(Self {
            state_path: state_dir.join("state.json"),
            config_path: state_dir.join("config.json"),
            report_path: state_dir.join("report.json"),
            state_dir,
        })
    }

    /// Directory holding the durable documents.
    pub fn state_dir(&self) -> &Utf8Path {
        &self.state_dir
    }

    /// Persist the state snapshot atomically.
    pub fn save_state(&self, state: &BatchState) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.state_path, &bytes)?;
        tracing::trace!(
            status = ?state.status,
            index = state.current_index,
            "state snapshot persisted"
        );
        Ok(())
    }

    /// Load the last persisted state snapshot, if any.
    pub fn load_state(&self) -> Result<Option<BatchState>, PersistenceError> {
        read_document(&self.state_path)
    }

    /// Persist the batch config snapshot.
    ///
    /// Written once at batch start; the engine never rewrites it mid-batch.
    pub fn save_config(&self, config: &BatchConfig) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(config)?;
        write_atomic(&self.config_path, &bytes)?;
        tracing::debug!(batch_id = %config.batch_id, "config snapshot persisted");
        Ok(())
    }

    /// Load the config snapshot of the last started batch, if any.
    pub fn load_config(&self) -> Result<Option<BatchConfig>, PersistenceError> {
        read_document(&self.config_path)
    }

    /// Persist the summary report of a completed run.
    pub fn save_report(&self, report: &BatchReport) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(report)?;
        write_atomic(&self.report_path, &bytes)?;
        tracing::debug!(batch_id = %report.batch_id, "batch report persisted");
        Ok(())
    }

    /// Load the report of the last completed run, if any.
    pub fn load_report(&self) -> Result<Option<BatchReport>, PersistenceError> {
        read_document(&self.report_path)
    }

    /// Read the last persisted state and classify it for recovery.
    ///
    /// A snapshot whose status says the engine was mid-batch (`Preparing`,
    /// `Running`, or `Paused`) is offered back as resumable: the state is
    /// rewritten to `Preparing` and persisted, and the caller decides whether
    /// to resume the remaining `total_items - current_index` items or discard
    /// them. Progress is never silently discarded and never silently resumed.
    ///
    /// A snapshot interrupted while `Cancelling` is settled to `Idle`, since
    /// the user had already asked for the batch to end.
    pub fn load_on_startup(&self) -> Result<StartupOutcome, EngineError> {
        let Some(state) = self.load_state()? else {
            return Ok(StartupOutcome::FirstLaunch);
        };

        match state.status {
            BatchStatus::Preparing | BatchStatus::Running | BatchStatus::Paused => {
                if !state.is_consistent() || !state.counters_balanced() {
                    return Err(EngineError::RecoveryAmbiguity(format!(
                        "snapshot counters are inconsistent (index {}, accepted {}, rejected {})",
                        state.current_index, state.accepted_count, state.rejected_count
                    )));
                }

                let config = self.load_config()?.ok_or_else(|| {
                    EngineError::RecoveryAmbiguity(
                        "interrupted batch has no config snapshot to rebuild from".to_string(),
                    )
                })?;

                if config.batch_id != state.batch_id {
                    return Err(EngineError::RecoveryAmbiguity(format!(
                        "config snapshot is for batch {} but state is for batch {}",
                        config.batch_id, state.batch_id
                    )));
                }

                let mut resumable = state;
                resumable.status = BatchStatus::Preparing;
                resumable.touch();
                self.save_state(&resumable)?;

                let remaining = resumable.remaining_items();
                tracing::info!(
                    batch_id = %resumable.batch_id,
                    remaining,
                    "interrupted batch found; awaiting resume confirmation"
                );

                Ok(StartupOutcome::Resumable {
                    state: resumable,
                    config,
                    remaining,
                })
            }
            BatchStatus::Cancelling => {
                let mut settled = state;
                settled.status = BatchStatus::Idle;
                settled.touch();
                self.save_state(&settled)?;
                tracing::info!("interrupted cancellation settled to idle");
                Ok(StartupOutcome::Clean(settled))
            }
            _ => Ok(StartupOutcome::Clean(state)),
        }
    }
}

/// Write bytes to `path` through a temp file in the same directory.
///
/// The rename is the commit point; a crash before it leaves the previous
/// file untouched, and a leftover `.tmp` is simply overwritten next time.
fn write_atomic(path: &Utf8Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let tmp_path = Utf8PathBuf::from(format!("{path}.tmp"));

    let mut file =
        File::create(&tmp_path).map_err(|e| PersistenceError::io(tmp_path.as_str(), e))?;
    file.write_all(bytes)
        .map_err(|e| PersistenceError::io(tmp_path.as_str(), e))?;
    file.sync_all()
        .map_err(|e| PersistenceError::io(tmp_path.as_str(), e))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|e| PersistenceError::io(path.as_str(), e))?;
    Ok(())
}

fn read_document<T: serde::de::DeserializeOwned>(
    path: &Utf8Path,
) -> Result<Option<T>, PersistenceError> {
    if !path.exists() {
        return Ok(None);
    }

    let contents =
        fs::read_to_string(path).map_err(|e| PersistenceError::io(path.as_str(), e))?;

    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| PersistenceError::Corrupt {
            path: path.to_string(),
            reason: e.to_string(),
        })
}
