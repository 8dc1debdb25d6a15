//! Scenario task: runs every stage in order and keeps the run's state.
//!
//! ```text
//! Pending ──run()──▶ Running ──▶ Completed
//!                            ├─▶ Cancelled   (token observed at a checkpoint)
//!                            └─▶ Failed      (any other stage error)
//! ```
//!
//! Every terminal state is final: a second `run()` returns
//! [`PipelineError::TaskFinished`]. Stages run sequentially and stop at
//! the first error. A stage that declines is recorded in the
//! diagnostics and the run continues.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use web_time::Instant;

use crate::align::align_extent;
use crate::config::{AnalysisConfig, PriorityLayerResolver};
use crate::diagnostics::{RunDiagnostics, StageDiagnostics};
use crate::gateway::RasterGateway;
use crate::progress::{CancellationToken, ProgressSink, Severity, TracingSink};
use crate::stages::clean::Clean;
use crate::stages::clip::Clip;
use crate::stages::compose::Compose;
use crate::stages::highest_position;
use crate::stages::mask::{ExternalMask, InternalMask};
use crate::stages::nodata::ReplaceNodata;
use crate::stages::reproject::Reproject;
use crate::stages::sieve::Sieve;
use crate::stages::snap::Snap;
use crate::stages::weighting::Weighting;
use crate::stages::{Stage, StageContext, StageOutcome};
use crate::state::AnalysisState;
use crate::types::{
    Crs, DEFAULT_CRS_ID, PipelineError, ReferencedExtent, Scenario, ScenarioResult,
};
use crate::workspace::ScenarioWorkspace;

static TRACING_SINK: TracingSink = TracingSink;

/// Lifecycle of a [`ScenarioTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, not yet run.
    Pending,
    /// Stages are executing.
    Running,
    /// Stopped after observing the cancellation token.
    Cancelled,
    /// Every stage succeeded.
    Completed,
    /// A stage failed.
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// One scenario analysis run.
pub struct ScenarioTask<'a> {
    scenario: Scenario,
    gateway: &'a dyn RasterGateway,
    resolver: &'a dyn PriorityLayerResolver,
    config: AnalysisConfig,
    sink: &'a dyn ProgressSink,
    cancel: CancellationToken,
    study_area: Option<PathBuf>,
    started: Option<NaiveDateTime>,
    state: RunState,
    error: Option<PipelineError>,
    result: Option<ScenarioResult>,
    diagnostics: RunDiagnostics,
}

impl<'a> ScenarioTask<'a> {
    /// Create a pending task.
    ///
    /// Progress and messages go to `tracing` until a sink is set with
    /// [`with_sink`](Self::with_sink).
    #[must_use]
    pub fn new(
        scenario: Scenario,
        gateway: &'a dyn RasterGateway,
        resolver: &'a dyn PriorityLayerResolver,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            scenario,
            gateway,
            resolver,
            config,
            sink: &TRACING_SINK,
            cancel: CancellationToken::new(),
            study_area: None,
            started: None,
            state: RunState::Pending,
            error: None,
            result: None,
            diagnostics: RunDiagnostics::default(),
        }
    }

    /// Send status, info and progress to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: &'a dyn ProgressSink) -> Self {
        self.sink = sink;
        self
    }

    /// Use `token` for cancellation, so the caller can keep a clone.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Clip pathways and priority layers to this study-area polygon layer.
    #[must_use]
    pub fn with_study_area(mut self, path: impl Into<PathBuf>) -> Self {
        self.study_area = Some(path.into());
        self
    }

    /// Fix the timestamp naming the scenario directory. Defaults to the
    /// local time when the run starts.
    #[must_use]
    pub const fn with_start_time(mut self, started: NaiveDateTime) -> Self {
        self.started = Some(started);
        self
    }

    /// A clone of the task's cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The scenario being analysed.
    #[must_use]
    pub const fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// The error that ended the run, if it failed or was cancelled.
    #[must_use]
    pub const fn error(&self) -> Option<&PipelineError> {
        self.error.as_ref()
    }

    /// The result of a completed run.
    #[must_use]
    pub const fn result(&self) -> Option<&ScenarioResult> {
        self.result.as_ref()
    }

    /// Per-stage diagnostics of the run.
    #[must_use]
    pub const fn diagnostics(&self) -> &RunDiagnostics {
        &self.diagnostics
    }

    /// Run every stage.
    ///
    /// # Errors
    ///
    /// [`PipelineError::TaskFinished`] if the task already ran. Otherwise
    /// the error of the first stage that failed, which is also kept in
    /// [`error`](Self::error). [`PipelineError::Cancelled`] leaves the
    /// task [`RunState::Cancelled`]; everything else leaves it
    /// [`RunState::Failed`].
    pub fn run(&mut self) -> Result<&ScenarioResult, PipelineError> {
        if self.state != RunState::Pending {
            return Err(PipelineError::TaskFinished(self.state));
        }
        self.state = RunState::Running;
        tracing::info!(scenario = %self.scenario.name, uuid = %self.scenario.uuid, "starting scenario analysis");

        let started = Instant::now();
        let mut diagnostics = RunDiagnostics::default();
        let outcome = self.execute(&mut diagnostics);
        diagnostics.total_duration = started.elapsed();
        self.diagnostics = diagnostics;

        match outcome {
            Ok(result) => {
                self.state = RunState::Completed;
                self.sink.progress(1.0);
                self.sink
                    .info("Scenario analysis completed successfully", Severity::Success);
                tracing::info!(
                    output = %result.output_path().display(),
                    duration_ms = self.diagnostics.total_duration.as_secs_f64() * 1000.0,
                    "scenario analysis completed"
                );
                Ok(self.result.insert(result))
            }
            Err(err) => {
                if matches!(err, PipelineError::Cancelled) {
                    self.state = RunState::Cancelled;
                    self.sink.info(&err.to_string(), Severity::Critical);
                    tracing::info!("scenario analysis cancelled");
                } else {
                    self.state = RunState::Failed;
                    self.sink.info(
                        &format!("An error occurred when running task for scenario analysis: {err}"),
                        Severity::Critical,
                    );
                    tracing::error!(error = %err, "scenario analysis failed");
                }
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn execute(&self, diagnostics: &mut RunDiagnostics) -> Result<ScenarioResult, PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let started = self
            .started
            .unwrap_or_else(|| Local::now().naive_local());
        let workspace = ScenarioWorkspace::create(&self.config.base_dir, &self.scenario, started)?;
        tracing::info!(directory = %workspace.root().display(), "created scenario directory");

        let state = AnalysisState::new(&self.scenario.activities, self.resolver);
        let extent = self.processing_extent(&state);

        let mut ctx = StageContext::new(
            self.gateway,
            &self.config,
            &workspace,
            &self.scenario,
            &extent,
            self.sink,
            &self.cancel,
        )
        .with_study_area(self.study_area.as_deref());

        let state = step::<ReplaceNodata>(&mut ctx, diagnostics, state)?;
        let state = step::<Snap>(&mut ctx, diagnostics, state)?;
        let state = step::<Clip>(&mut ctx, diagnostics, state)?;
        let state = step::<Reproject>(&mut ctx, diagnostics, state)?;
        let state = step::<Weighting>(&mut ctx, diagnostics, state)?;
        let state = step::<Compose>(&mut ctx, diagnostics, state)?;
        let state = step::<ExternalMask>(&mut ctx, diagnostics, state)?;
        let state = step::<InternalMask>(&mut ctx, diagnostics, state)?;
        let state = step::<Sieve>(&mut ctx, diagnostics, state)?;
        let state = step::<Clean>(&mut ctx, diagnostics, state)?;

        ctx.checkpoint()?;
        ctx.begin(highest_position::KIND);
        let stage_started = Instant::now();
        let outcome = highest_position::run(&mut ctx, state);
        let metrics = ctx.finish();
        diagnostics.record(StageDiagnostics {
            stage: highest_position::KIND,
            outcome: outcome.is_ok().then_some(StageOutcome::Applied),
            duration: stage_started.elapsed(),
            metrics,
        });
        outcome.map(|(_, result)| result)
    }

    /// The scenario bounding box snapped to the grid of the first layer,
    /// tagged with the scenario CRS, else that layer's CRS, else the
    /// default CRS.
    fn processing_extent(&self, state: &AnalysisState) -> ReferencedExtent {
        let bbox = self.scenario.extent.bbox;
        let first_layer = state
            .pathways()
            .find(|p| p.is_computed())
            .map(|p| p.path.clone())
            .or_else(|| {
                state
                    .activities()
                    .iter()
                    .find_map(|a| a.layer_path().map(Path::to_path_buf))
            });
        let info = first_layer.as_deref().and_then(|path| {
            self.gateway
                .raster_info(path)
                .inspect_err(|err| {
                    tracing::warn!(layer = %path.display(), error = %err, "cannot snap the extent to the layer grid");
                })
                .ok()
        });
        let extent = info.as_ref().map_or(bbox, |info| align_extent(info, &bbox));
        let crs = self
            .scenario
            .extent
            .crs
            .clone()
            .or_else(|| info.map(|i| i.crs))
            .unwrap_or_else(|| Crs::epsg(DEFAULT_CRS_ID));
        tracing::info!(original = %bbox.to_wkt(), "original area of interest extent");
        tracing::info!(snapped = %extent.to_wkt(), %crs, "snapped area of interest extent");
        ReferencedExtent { extent, crs }
    }
}

/// Run one stage, or record why it was skipped.
fn step<S: Stage>(
    ctx: &mut StageContext<'_>,
    diagnostics: &mut RunDiagnostics,
    state: AnalysisState,
) -> Result<AnalysisState, PipelineError> {
    ctx.checkpoint()?;
    ctx.begin(S::KIND);
    let started = Instant::now();
    let result = match S::skip_reason(ctx) {
        Some(reason) => {
            tracing::info!(stage = S::KIND.name(), %reason, "skipping stage");
            Ok((state, StageOutcome::Skipped { reason }))
        }
        None => {
            tracing::debug!(stage = S::KIND.name(), "running stage");
            S::run(ctx, state)
        }
    };
    let metrics = ctx.finish();
    diagnostics.record(StageDiagnostics {
        stage: S::KIND,
        outcome: result.as_ref().ok().map(|(_, outcome)| outcome.clone()),
        duration: started.elapsed(),
        metrics,
    });

    let (state, outcome) = result.inspect_err(|err| {
        tracing::error!(stage = S::KIND.name(), error = %err, "stage failed");
    })?;
    if let StageOutcome::Declined { reason } = &outcome {
        tracing::warn!(stage = S::KIND.name(), %reason, "stage declined");
    }
    Ok(state)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::MapSettings;
    use crate::gateway::{RasterInfo, RecordingGateway};
    use crate::types::{Activity, Extent, Pathway, SpatialExtent};
    use uuid::Uuid;

    fn scenario(bbox: Extent, path: PathBuf) -> Scenario {
        Scenario {
            uuid: Uuid::from_u128(0x1234_0000_0000_4000_8000_0000_0000_0000),
            name: "Test".to_string(),
            description: String::new(),
            extent: SpatialExtent { bbox, crs: None },
            activities: vec![Activity {
                uuid: Uuid::from_u128(10),
                name: "A".to_string(),
                description: String::new(),
                path: None,
                pathways: vec![Pathway {
                    uuid: Uuid::from_u128(1),
                    name: "grass".to_string(),
                    path,
                    priority_layers: vec![],
                    carbon_paths: vec![],
                }],
                mask_paths: vec![],
                style_pixel_value: 1,
            }],
            priority_layer_groups: vec![],
        }
    }

    #[test]
    fn run_state_display() {
        assert_eq!(RunState::Cancelled.to_string(), "cancelled");
        assert_eq!(
            PipelineError::TaskFinished(RunState::Completed).to_string(),
            "the task has already finished (completed)"
        );
    }

    #[test]
    fn processing_extent_snaps_to_first_pathway() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::new(dir.path());
        let layer = dir.path().join("grass.tif");
        gateway.add_raster(
            &layer,
            RasterInfo {
                extent: Extent::new(0.0, 0.0, 1000.0, 1000.0),
                crs: Crs::epsg(32735),
                pixel_size_x: 10.0,
                pixel_size_y: 10.0,
                nodata: None,
            },
        );
        let settings = MapSettings::new();
        let scenario = scenario(Extent::new(3.0, 4.0, 996.0, 995.0), layer);
        let state = AnalysisState::new(&scenario.activities, &settings);
        let task = ScenarioTask::new(scenario, &gateway, &settings, AnalysisConfig::default());

        let extent = task.processing_extent(&state);
        assert_eq!(extent.extent, Extent::new(0.0, 0.0, 1000.0, 1000.0));
        assert_eq!(extent.crs, Crs::epsg(32735));
    }

    #[test]
    fn unknown_layer_keeps_the_bbox_and_default_crs() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::new(dir.path());
        let settings = MapSettings::new();
        let bbox = Extent::new(3.0, 4.0, 996.0, 995.0);
        let scenario = scenario(bbox, dir.path().join("missing.tif"));
        let state = AnalysisState::new(&scenario.activities, &settings);
        let task = ScenarioTask::new(scenario, &gateway, &settings, AnalysisConfig::default());

        let extent = task.processing_extent(&state);
        assert_eq!(extent.extent, bbox);
        assert_eq!(extent.crs, Crs::epsg(DEFAULT_CRS_ID));
    }

    #[test]
    fn cancelled_before_start_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::new(dir.path().join("scratch"));
        let settings = MapSettings::new();
        let config = AnalysisConfig {
            base_dir: dir.path().join("runs"),
            ..AnalysisConfig::default()
        };
        let token = CancellationToken::new();
        let mut task = ScenarioTask::new(
            scenario(Extent::new(0.0, 0.0, 1.0, 1.0), dir.path().join("x.tif")),
            &gateway,
            &settings,
            config,
        )
        .with_cancellation(token.clone());
        token.cancel();

        assert!(matches!(task.run(), Err(PipelineError::Cancelled)));
        assert_eq!(task.state(), RunState::Cancelled);
        assert!(!dir.path().join("runs").exists());
        assert!(matches!(
            task.run(),
            Err(PipelineError::TaskFinished(RunState::Cancelled))
        ));
    }
}
