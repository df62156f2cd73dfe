// Performance metrics module
//
// Provides lightweight metrics tracking for monitoring engine throughput

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Global performance metrics
///
/// Uses atomic operations for thread-safe metric tracking without locks.
/// Metrics are collected throughout the engine lifecycle and can be logged
/// periodically or on shutdown for performance analysis.
#[derive(Debug)]
pub struct Metrics {
    /// Items that passed the quality gate and were committed
    pub items_accepted: AtomicUsize,

    /// Items rejected by the quality gate
    pub items_rejected: AtomicUsize,

    /// Individual inference calls (Best-of-N generates several per item)
    pub candidates_generated: AtomicU64,

    /// Candidates discarded by the degenerate-output check
    pub candidates_degenerate: AtomicU64,

    /// Completed ticks across all batches this process has run
    pub ticks_completed: AtomicU64,

    /// Artifact cache hits
    pub cache_hits: AtomicU64,

    /// Artifact cache misses (expensive computes)
    pub cache_misses: AtomicU64,

    /// Total time spent inside inference calls, in milliseconds
    pub total_generation_time_ms: AtomicU64,

    /// Number of durable state writes performed
    pub state_writes: AtomicU64,

    /// Number of state broadcasts sent
    pub state_broadcasts: AtomicU64,

    /// Number of state broadcast sends with no live receiver
    pub state_broadcast_errors: AtomicU64,

    /// Engine start time
    start_time: Instant,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self {
            items_accepted: AtomicUsize::new(0),
            items_rejected: AtomicUsize::new(0),
            candidates_generated: AtomicU64::new(0),
            candidates_degenerate: AtomicU64::new(0),
            ticks_completed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            total_generation_time_ms: AtomicU64::new(0),
            state_writes: AtomicU64::new(0),
            state_broadcasts: AtomicU64::new(0),
            state_broadcast_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record an accepted item
    pub fn record_item_accepted(&self) {
        self.items_accepted.fetch_add(1, Ordering::Relaxed);
        self.ticks_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rejected item
    pub fn record_item_rejected(&self) {
        self.items_rejected.fetch_add(1, Ordering::Relaxed);
        self.ticks_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one inference call and its duration
    pub fn record_candidate(&self, duration: Duration) {
        self.candidates_generated.fetch_add(1, Ordering::Relaxed);
        self.total_generation_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a candidate flagged by the degenerate-output check
    pub fn record_degenerate_candidate(&self) {
        self.candidates_degenerate.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an artifact cache hit
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an artifact cache miss
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a durable state write
    pub fn record_state_write(&self) {
        self.state_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a state broadcast
    pub fn record_state_broadcast(&self) {
        self.state_broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a state broadcast with no live receiver
    pub fn record_state_broadcast_error(&self) {
        self.state_broadcast_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get average inference time per candidate in milliseconds
    pub fn avg_generation_time_ms(&self) -> f64 {
        let total = self.total_generation_time_ms.load(Ordering::Relaxed);
        let count = self.candidates_generated.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        let uptime = self.uptime();
        tracing::info!("=== Performance Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", uptime.as_secs_f64());
        tracing::info!(
            "Items: {} accepted, {} rejected ({} ticks)",
            self.items_accepted.load(Ordering::Relaxed),
            self.items_rejected.load(Ordering::Relaxed),
            self.ticks_completed.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Candidates: {} generated, {} degenerate, avg {:.2}ms per inference",
            self.candidates_generated.load(Ordering::Relaxed),
            self.candidates_degenerate.load(Ordering::Relaxed),
            self.avg_generation_time_ms()
        );
        tracing::info!(
            "Cache: {} hits, {} misses",
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed)
        );
        tracing::info!(
            "State: {} writes, {} broadcasts, {} broadcast errors",
            self.state_writes.load(Ordering::Relaxed),
            self.state_broadcasts.load(Ordering::Relaxed),
            self.state_broadcast_errors.load(Ordering::Relaxed)
        );
    }

    /// Log periodic metrics (for long-running batches)
    pub fn log_periodic(&self) {
        tracing::info!(
            "Metrics: {} ticks, {} candidates, {} cache hits, uptime {:.0}s",
            self.ticks_completed.load(Ordering::Relaxed),
            self.candidates_generated.load(Ordering::Relaxed),
            self.cache_hits.load(Ordering::Relaxed),
            self.uptime().as_secs_f64()
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-batch summary persisted when a run reaches `Completed`.
///
/// Mirrors the final counters in the durable state snapshot, enriched with
/// timing and score distribution for offline analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub preset: Option<String>,
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub elapsed_secs: f64,
    pub avg_secs_per_item: f64,
    pub score_avg: f32,
    pub score_min: f32,
    pub score_max: f32,
}

impl BatchReport {
    /// Build a report from the final counters and the scores of committed items.
    pub fn from_run(
        batch_id: impl Into<String>,
        preset: Option<String>,
        total: usize,
        accepted: usize,
        rejected: usize,
        elapsed: Duration,
        scores: &[f32],
    ) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        let (score_min, score_max, score_avg) = if scores.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
            let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let avg = scores.iter().sum::<f32>() / scores.len() as f32;
            (min, max, avg)
        };
        Self {
            batch_id: batch_id.into(),
            preset,
            total,
            accepted,
            rejected,
            elapsed_secs,
            avg_secs_per_item: elapsed_secs / total.max(1) as f64,
            score_avg,
            score_min,
            score_max,
        }
    }
}
