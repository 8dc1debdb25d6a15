//! Run diagnostics: outcome, timing and counts for each stage.
//!
//! Every run collects diagnostics, including runs that fail; the stages
//! recorded are the ones that started.
//!
//! Stage timings come from `web-time` instants.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stages::{StageKind, StageOutcome};

/// Stage timings in JSON are milliseconds, the unit of [`RunDiagnostics::report`].
mod millis {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(super::duration_ms(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(ms / 1000.0)
            .map_err(|_| D::Error::custom(format!("invalid timing {ms} ms")))
    }
}

/// Counters kept by a stage while it runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Layers or activities rewritten.
    pub processed: usize,
    /// Layers or activities left unchanged.
    pub skipped: usize,
    /// External operations invoked.
    pub gateway_calls: usize,
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Which stage.
    pub stage: StageKind,
    /// How it ended. `None` when the stage failed.
    pub outcome: Option<StageOutcome>,
    /// Wall-clock duration, `duration_ms` in JSON.
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
    /// Counters.
    pub metrics: StageMetrics,
}

/// Diagnostics collected from a single scenario run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Stages that started, in execution order.
    pub stages: Vec<StageDiagnostics>,
    /// Total wall-clock duration of the run, `total_duration_ms` in JSON.
    #[serde(rename = "total_duration_ms", with = "millis")]
    pub total_duration: Duration,
}

impl RunDiagnostics {
    pub(crate) fn record(&mut self, stage: StageDiagnostics) {
        self.stages.push(stage);
    }

    /// Diagnostics of one stage, if it started.
    #[must_use]
    pub fn stage(&self, kind: StageKind) -> Option<&StageDiagnostics> {
        self.stages.iter().find(|s| s.stage == kind)
    }

    /// External operations invoked across the run.
    #[must_use]
    pub fn gateway_calls(&self) -> usize {
        self.stages.iter().map(|s| s.metrics.gateway_calls).sum()
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Scenario Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(format!("External operations: {}", self.gateway_calls()));
        lines.push(String::new());

        lines.push(format!(
            "{:<18} {:>10} {:>8}  {:<10} {}",
            "Stage", "Duration", "% Total", "Outcome", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for diag in &self.stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let (outcome, reason) = match &diag.outcome {
                Some(StageOutcome::Applied) => ("applied", None),
                Some(StageOutcome::Skipped { reason }) => ("skipped", Some(reason.as_str())),
                Some(StageOutcome::Declined { reason }) => ("declined", Some(reason.as_str())),
                None => ("failed", None),
            };
            let m = &diag.metrics;
            let mut details = format!(
                "processed={} skipped={} calls={}",
                m.processed, m.skipped, m.gateway_calls
            );
            if let Some(reason) = reason {
                details.push_str(&format!(" ({reason})"));
            }
            lines.push(format!(
                "{:<18} {ms:>8.3}ms {pct:>7.1}%  {outcome:<10} {details}",
                diag.stage.name()
            ));
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
