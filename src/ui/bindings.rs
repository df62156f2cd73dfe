use crate::models::{BatchState, BatchStatus};

/// Render instructions derived from one state snapshot.
///
/// Everything a status panel needs, precomputed so the UI layer contains no
/// lifecycle logic of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderModel {
    pub status_label: String,
    pub progress_current: usize,
    pub progress_total: usize,
    pub progress_fraction: f32,
    pub accepted_count: usize,
    pub rejected_count: usize,
    pub error_text: String,

    pub can_start: bool,
    pub can_pause: bool,
    pub can_resume: bool,
    pub can_cancel: bool,
    pub can_acknowledge: bool,
}

/// Map a state snapshot to render instructions.
///
/// Pure function of the snapshot: same input, same output, no side effects.
pub fn render(state: &BatchState) -> RenderModel {
    let status_label = match state.status {
        BatchStatus::Idle => "Ready".to_string(),
        BatchStatus::Preparing => {
            if state.current_index > 0 {
                format!(
                    "Interrupted batch found: {} of {} done, awaiting confirmation",
                    state.current_index, state.total_items
                )
            } else {
                "Preparing batch...".to_string()
            }
        }
        BatchStatus::Running => format!(
            "Generating image {}/{}",
            (state.current_index + 1).min(state.total_items),
            state.total_items
        ),
        BatchStatus::Paused => format!(
            "Paused at {}/{}",
            state.current_index, state.total_items
        ),
        BatchStatus::Cancelling => "Cancelling...".to_string(),
        BatchStatus::Completed => format!(
            "Completed: {} accepted, {} rejected",
            state.accepted_count, state.rejected_count
        ),
        BatchStatus::Error => "Failed".to_string(),
    };

    let progress_fraction = if state.total_items > 0 {
        state.current_index as f32 / state.total_items as f32
    } else {
        0.0
    };

    RenderModel {
        status_label,
        progress_current: state.current_index,
        progress_total: state.total_items,
        progress_fraction,
        accepted_count: state.accepted_count,
        rejected_count: state.rejected_count,
        error_text: state.last_error.clone().unwrap_or_default(),
        can_start: state.status == BatchStatus::Idle,
        can_pause: state.status == BatchStatus::Running,
        can_resume: state.status == BatchStatus::Paused,
        can_cancel: matches!(state.status, BatchStatus::Running | BatchStatus::Paused),
        can_acknowledge: state.status.is_terminal(),
    }
}
