//! Progress/status channel and cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Severity of a user-facing info message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Info,
    /// Something was skipped or degraded.
    Warning,
    /// The run cannot continue.
    Critical,
    /// The run finished.
    Success,
}

/// Receiver of status, info and progress signals, typically the
/// presentation layer.
pub trait ProgressSink {
    /// Current activity, e.g. "Weighting of pathways".
    fn status(&self, message: &str);

    /// A user-facing message.
    fn info(&self, message: &str, severity: Severity);

    /// Overall completion in `0.0..=1.0`. Never decreases within a run.
    fn progress(&self, fraction: f64);
}

/// Forwards every signal to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn status(&self, message: &str) {
        tracing::info!(status = message);
    }

    fn info(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info | Severity::Success => tracing::info!(?severity, "{message}"),
            Severity::Warning => tracing::warn!("{message}"),
            Severity::Critical => tracing::error!("{message}"),
        }
    }

    fn progress(&self, fraction: f64) {
        tracing::trace!(progress = fraction);
    }
}

/// Shared advisory cancellation flag.
///
/// Clones share the flag, so the caller keeps one clone and hands
/// another to the task.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The run stops at its next checkpoint.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Turns stage positions and per-call ticks into a monotone fraction.
///
/// Each stage owns an equal slice of `0.0..=1.0`. Within a stage every
/// external call moves halfway closer to the end of the slice, so the
/// fraction keeps growing however many calls a stage makes.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    stage_count: usize,
    stage: usize,
    calls: u32,
    reported: f64,
}

impl ProgressTracker {
    /// Tracker over `stage_count` equal slices.
    #[must_use]
    pub const fn new(stage_count: usize) -> Self {
        Self {
            stage_count,
            stage: 0,
            calls: 0,
            reported: 0.0,
        }
    }

    /// Move to the stage at `index`.
    pub const fn enter(&mut self, index: usize) {
        self.stage = index;
        self.calls = 0;
    }

    /// Record one external call and return the new fraction.
    pub fn tick(&mut self) -> f64 {
        self.calls = self.calls.saturating_add(1);
        let within = 1.0 - 0.5_f64.powi(i32::try_from(self.calls).unwrap_or(i32::MAX));
        self.report(within)
    }

    /// Mark the current stage finished and return the new fraction.
    pub fn finish_stage(&mut self) -> f64 {
        self.report(1.0)
    }

    /// The last reported fraction.
    #[must_use]
    pub const fn fraction(&self) -> f64 {
        self.reported
    }

    #[allow(clippy::cast_precision_loss)]
    fn report(&mut self, within: f64) -> f64 {
        if self.stage_count == 0 {
            return self.reported;
        }
        let fraction = ((self.stage as f64 + within) / self.stage_count as f64).min(1.0);
        self.reported = self.reported.max(fraction);
        self.reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let handle = token.clone();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn progress_is_monotone_and_bounded() {
        let mut tracker = ProgressTracker::new(4);
        let mut last = 0.0;
        for stage in 0..4 {
            tracker.enter(stage);
            for _ in 0..50 {
                let f = tracker.tick();
                assert!(f >= last);
                assert!(f <= 1.0);
                last = f;
            }
            let f = tracker.finish_stage();
            assert!(f >= last);
            last = f;
        }
        assert!((last - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ticks_stay_inside_the_stage_slice() {
        let mut tracker = ProgressTracker::new(10);
        tracker.enter(2);
        for _ in 0..100 {
            assert!(tracker.tick() <= 0.3);
        }
        assert!(tracker.fraction() > 0.2);
    }

    #[test]
    fn entering_an_earlier_stage_never_lowers_progress() {
        let mut tracker = ProgressTracker::new(5);
        tracker.enter(3);
        let high = tracker.finish_stage();
        tracker.enter(1);
        assert!(tracker.tick() >= high);
    }
}
