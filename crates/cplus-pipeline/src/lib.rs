//! cplus-pipeline: Scenario analysis pipeline for conservation planning.
//!
//! Combines pathway rasters into activity rasters and stacks the
//! activities into a single highest-position composite through:
//! no-data harmonization -> snapping -> study-area clipping ->
//! reprojection -> weighting -> composition -> exclusion masks ->
//! sieve filtering -> value cleaning -> highest position.
//!
//! This crate performs **no raster I/O** itself. Every raster and vector
//! operation is a typed request sent through [`RasterGateway`];
//! [`RecordingGateway`] answers them in-process for dry runs and tests.

pub mod align;
pub mod config;
pub mod diagnostics;
pub mod expression;
pub mod gateway;
pub mod pipeline;
pub mod progress;
mod stages;
pub mod state;
pub mod types;
pub mod workspace;

pub use config::{
    AnalysisConfig, MapSettings, PriorityLayerRecord, PriorityLayerResolver, Setting,
    SettingsProvider,
};
pub use diagnostics::{RunDiagnostics, StageDiagnostics, StageMetrics};
pub use gateway::{GatewayError, GatewayRequest, Operation, RasterGateway, RecordingGateway};
pub use pipeline::{RunState, ScenarioTask};
pub use progress::{CancellationToken, ProgressSink, Severity, TracingSink};
pub use stages::{STAGE_COUNT, StageKind, StageOutcome};
pub use types::{
    Activity, Crs, Extent, Pathway, PipelineError, PriorityGroup, PriorityWeightingLayer,
    ReferencedExtent, Scenario, ScenarioResult, SpatialExtent,
};

/// Run a scenario to completion with settings read from `settings`.
///
/// Convenience wrapper around [`ScenarioTask`] for callers that need
/// neither cancellation nor diagnostics.
///
/// # Errors
///
/// Returns the error of the first stage that failed; see
/// [`ScenarioTask::run`].
pub fn run_scenario<S>(
    scenario: Scenario,
    gateway: &dyn RasterGateway,
    settings: &S,
) -> Result<ScenarioResult, PipelineError>
where
    S: SettingsProvider + PriorityLayerResolver,
{
    let config = AnalysisConfig::from_settings(settings);
    let mut task = ScenarioTask::new(scenario, gateway, settings, config);
    task.run().cloned()
}
