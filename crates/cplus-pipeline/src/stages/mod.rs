//! Pipeline stages and the context they run in.
//!
//! Each stage is a function from [`AnalysisState`] to a rewritten
//! [`AnalysisState`] plus a [`StageOutcome`]. All external work goes
//! through [`StageContext::call`], which checks for cancellation first,
//! counts the call, and advances progress.

pub(crate) mod clean;
pub(crate) mod clip;
pub(crate) mod compose;
pub(crate) mod highest_position;
pub(crate) mod mask;
pub(crate) mod nodata;
pub(crate) mod reproject;
pub(crate) mod sieve;
pub(crate) mod snap;
pub(crate) mod weighting;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;
use crate::diagnostics::StageMetrics;
use crate::gateway::{
    DataType, ExtentToLayerRequest, GatewayError, MergeVectorsRequest, OutputTarget,
    RasterGateway, RasterInfo, SymmetricDifferenceRequest, TranslateRequest, VectorInfo,
    WarpRequest,
};
use crate::progress::{CancellationToken, ProgressSink, ProgressTracker, Severity};
use crate::state::AnalysisState;
use crate::types::{PipelineError, ReferencedExtent, Scenario};
use crate::workspace::ScenarioWorkspace;

/// Total number of stages in the pipeline.
pub const STAGE_COUNT: usize = 11;

/// The pipeline's stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// No-data harmonization of pathways and priority layers.
    ReplaceNodata,
    /// Pixel-grid snapping to the reference raster.
    Snap,
    /// Clipping to the study area.
    Clip,
    /// Reprojection into the scenario CRS.
    Reproject,
    /// Pathway weighting.
    Weighting,
    /// Activity composition.
    Compose,
    /// Scenario-wide exclusion masks.
    ExternalMask,
    /// Per-activity exclusion masks.
    InternalMask,
    /// Sieve filtering.
    Sieve,
    /// Zero-value cleaning.
    Clean,
    /// Highest-position composite.
    HighestPosition,
}

impl StageKind {
    /// Every stage, in execution order.
    pub const ALL: [Self; STAGE_COUNT] = [
        Self::ReplaceNodata,
        Self::Snap,
        Self::Clip,
        Self::Reproject,
        Self::Weighting,
        Self::Compose,
        Self::ExternalMask,
        Self::InternalMask,
        Self::Sieve,
        Self::Clean,
        Self::HighestPosition,
    ];

    /// Machine name (e.g. `"replace_nodata"`).
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ReplaceNodata => "replace_nodata",
            Self::Snap => "snap",
            Self::Clip => "clip",
            Self::Reproject => "reproject",
            Self::Weighting => "weighting",
            Self::Compose => "compose",
            Self::ExternalMask => "external_mask",
            Self::InternalMask => "internal_mask",
            Self::Sieve => "sieve",
            Self::Clean => "clean",
            Self::HighestPosition => "highest_position",
        }
    }

    /// Zero-based position in the pipeline.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compile-time guard: if a [`StageKind`] variant is added, this match
/// becomes non-exhaustive and the build fails, a reminder to bump
/// [`STAGE_COUNT`].
#[allow(dead_code, clippy::match_same_arms)]
const fn _stage_count_guard(s: StageKind) {
    match s {
        StageKind::ReplaceNodata
        | StageKind::Snap
        | StageKind::Clip
        | StageKind::Reproject
        | StageKind::Weighting
        | StageKind::Compose
        | StageKind::ExternalMask
        | StageKind::InternalMask
        | StageKind::Sieve
        | StageKind::Clean
        | StageKind::HighestPosition => {}
    }
}

/// How a stage ended, when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The stage ran.
    Applied,
    /// The stage is disabled or has nothing to work on.
    Skipped {
        /// Why.
        reason: String,
    },
    /// The stage did not apply and reported failure without aborting
    /// the run.
    Declined {
        /// Why.
        reason: String,
    },
}

impl StageOutcome {
    pub(crate) fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

/// A pipeline stage.
pub(crate) trait Stage {
    /// Which stage this is.
    const KIND: StageKind;

    /// Reason the stage does not run at all, if any.
    fn skip_reason(_ctx: &StageContext<'_>) -> Option<String> {
        None
    }

    /// Run the stage.
    fn run(
        ctx: &mut StageContext<'_>,
        state: AnalysisState,
    ) -> Result<(AnalysisState, StageOutcome), PipelineError>;
}

/// Everything a stage may read, plus the run's progress and counters.
pub struct StageContext<'a> {
    pub(crate) gateway: &'a dyn RasterGateway,
    pub(crate) config: &'a AnalysisConfig,
    pub(crate) workspace: &'a ScenarioWorkspace,
    pub(crate) scenario: &'a Scenario,
    /// Processing extent, snapped to the first layer's grid.
    pub(crate) extent: &'a ReferencedExtent,
    pub(crate) study_area: Option<&'a Path>,
    sink: &'a dyn ProgressSink,
    cancel: &'a CancellationToken,
    tracker: ProgressTracker,
    kind: StageKind,
    metrics: StageMetrics,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(
        gateway: &'a dyn RasterGateway,
        config: &'a AnalysisConfig,
        workspace: &'a ScenarioWorkspace,
        scenario: &'a Scenario,
        extent: &'a ReferencedExtent,
        sink: &'a dyn ProgressSink,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            gateway,
            config,
            workspace,
            scenario,
            extent,
            study_area: None,
            sink,
            cancel,
            tracker: ProgressTracker::new(STAGE_COUNT),
            kind: StageKind::ReplaceNodata,
            metrics: StageMetrics::default(),
        }
    }

    pub(crate) fn with_study_area(mut self, study_area: Option<&'a Path>) -> Self {
        self.study_area = study_area;
        self
    }

    /// Start a stage: reset counters and move progress to its slice.
    pub(crate) fn begin(&mut self, kind: StageKind) {
        self.kind = kind;
        self.metrics = StageMetrics::default();
        self.tracker.enter(kind.index());
    }

    /// End the current stage and return its counters.
    pub(crate) fn finish(&mut self) -> StageMetrics {
        self.sink.progress(self.tracker.finish_stage());
        std::mem::take(&mut self.metrics)
    }

    /// Last reported progress fraction.
    #[cfg(test)]
    pub(crate) const fn progress(&self) -> f64 {
        self.tracker.fraction()
    }

    /// Fail with [`PipelineError::Cancelled`] if cancellation was requested.
    pub(crate) fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    pub(crate) fn status(&self, message: &str) {
        self.sink.status(message);
    }

    pub(crate) fn critical(&self, message: &str) {
        self.sink.info(message, Severity::Critical);
    }

    pub(crate) fn processed(&mut self) {
        self.metrics.processed += 1;
    }

    pub(crate) fn skipped(&mut self) {
        self.metrics.skipped += 1;
    }

    pub(crate) fn raster_info(&self, path: &Path) -> Result<RasterInfo, GatewayError> {
        self.gateway.raster_info(path)
    }

    pub(crate) fn vector_info(&self, path: &Path) -> Result<VectorInfo, GatewayError> {
        self.gateway.vector_info(path)
    }

    /// Run one external operation.
    pub(crate) fn call<T>(
        &mut self,
        f: impl FnOnce(&dyn RasterGateway) -> Result<T, GatewayError>,
    ) -> Result<T, PipelineError> {
        self.checkpoint()?;
        self.metrics.gateway_calls += 1;
        let result = f(self.gateway);
        self.sink.progress(self.tracker.tick());
        result.map_err(PipelineError::gateway(self.kind.name()))
    }

    /// Check the required layers, reporting a configuration problem on
    /// the info channel before failing.
    pub(crate) fn require_layers(&self, state: &AnalysisState) -> Result<(), PipelineError> {
        state.require_layers().inspect_err(|err| {
            self.critical(&err.to_string());
        })
    }
}

/// Turn a gateway failure into `None` with a warning, so a single layer
/// can fall back to its previous path. Every other error passes through.
pub(crate) fn degrade<T>(
    result: Result<T, PipelineError>,
    layer: &Path,
) -> Result<Option<T>, PipelineError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(PipelineError::Gateway { stage, source }) => {
            tracing::warn!(
                stage,
                layer = %layer.display(),
                error = %source,
                "problem processing layer, keeping the previous path"
            );
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Rewrite the no-data value of `input` into `output`: a Float32
/// translate to a temporary file followed by a warp that assigns
/// `nodata`.
pub(crate) fn replace_nodata(
    ctx: &mut StageContext<'_>,
    input: &Path,
    output: PathBuf,
    nodata: f64,
) -> Result<PathBuf, PipelineError> {
    let translate = TranslateRequest {
        input: input.to_path_buf(),
        data_type: DataType::Float32,
        output: OutputTarget::Temporary,
    };
    let normalized = ctx.call(|g| g.translate(&translate))?;
    let warp = WarpRequest {
        input: normalized,
        nodata: Some(nodata),
        target_crs: None,
        target_extent: None,
        resampling: crate::config::ResamplingMethod::Nearest,
        data_type: DataType::SameAsInput,
        output: OutputTarget::File(output),
    };
    ctx.call(|g| g.warp(&warp))
}

/// Single mask layer from a list of candidates: invalid ones are
/// skipped with a warning, one valid layer is used as-is, several are
/// merged. `None` when no candidate is valid.
pub(crate) fn mask_source(
    ctx: &mut StageContext<'_>,
    paths: &[PathBuf],
) -> Result<Option<PathBuf>, PipelineError> {
    let valid: Vec<PathBuf> = paths
        .iter()
        .filter(|path| match ctx.vector_info(path) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(mask = %path.display(), error = %err, "skipping invalid mask layer");
                false
            }
        })
        .cloned()
        .collect();
    match valid.len() {
        0 => Ok(None),
        1 => Ok(valid.into_iter().next()),
        _ => {
            ctx.status("Merging mask layers");
            let request = MergeVectorsRequest { layers: valid };
            ctx.call(|g| g.merge_vectors(&request)).map(Some)
        }
    }
}

/// Exclusion mask: the symmetric difference of `mask` and a polygon
/// covering the processing extent, so clipping by it removes the
/// masked region.
pub(crate) fn exclusion_mask(
    ctx: &mut StageContext<'_>,
    mask: &Path,
) -> Result<PathBuf, PipelineError> {
    let extent = ExtentToLayerRequest {
        extent: ctx.extent.clone(),
    };
    let extent_layer = ctx.call(|g| g.extent_to_layer(&extent))?;
    let difference = SymmetricDifferenceRequest {
        input: mask.to_path_buf(),
        overlay: extent_layer,
    };
    ctx.call(|g| g.symmetric_difference(&difference))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod fixture {
    //! Stage test harness: a scratch directory, a recording gateway and
    //! a workspace, with helpers to register input layers.

    use std::path::PathBuf;

    use chrono::NaiveDate;
    use tempfile::TempDir;
    use uuid::Uuid;

    use super::StageContext;
    use crate::config::AnalysisConfig;
    use crate::gateway::{GeometryType, RasterInfo, RecordingGateway, VectorInfo};
    use crate::progress::{CancellationToken, TracingSink};
    use crate::types::{Activity, Crs, Extent, Pathway, ReferencedExtent, Scenario, SpatialExtent};
    use crate::workspace::ScenarioWorkspace;

    pub const CRS: u32 = 32735;

    pub fn grid() -> Extent {
        Extent::new(0.0, 0.0, 1000.0, 1000.0)
    }

    pub struct Fixture {
        pub dir: TempDir,
        pub gateway: RecordingGateway,
        pub config: AnalysisConfig,
        pub workspace: ScenarioWorkspace,
        pub scenario: Scenario,
        pub extent: ReferencedExtent,
        pub cancel: CancellationToken,
        pub sink: TracingSink,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let gateway = RecordingGateway::new(dir.path().join("scratch"));
            let config = AnalysisConfig {
                base_dir: dir.path().join("runs"),
                ..AnalysisConfig::default()
            };
            let scenario = Scenario {
                uuid: Uuid::from_u128(0xabcd_0000_0000_4000_8000_0000_0000_0001),
                name: "Fixture".to_string(),
                description: String::new(),
                extent: SpatialExtent {
                    bbox: grid(),
                    crs: None,
                },
                activities: vec![],
                priority_layer_groups: vec![],
            };
            let started = NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap();
            let workspace = ScenarioWorkspace::create(&config.base_dir, &scenario, started).unwrap();
            Self {
                dir,
                gateway,
                config,
                workspace,
                scenario,
                extent: ReferencedExtent {
                    extent: grid(),
                    crs: Crs::epsg(CRS),
                },
                cancel: CancellationToken::new(),
                sink: TracingSink,
            }
        }

        pub fn context(&self) -> StageContext<'_> {
            StageContext::new(
                &self.gateway,
                &self.config,
                &self.workspace,
                &self.scenario,
                &self.extent,
                &self.sink,
                &self.cancel,
            )
        }

        /// Create an input raster file and register it.
        pub fn raster(&self, name: &str, nodata: Option<f64>) -> PathBuf {
            self.raster_in(name, nodata, Crs::epsg(CRS))
        }

        pub fn raster_in(&self, name: &str, nodata: Option<f64>, crs: Crs) -> PathBuf {
            let path = self.dir.path().join("inputs").join(format!("{name}.tif"));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"").unwrap();
            self.gateway.add_raster(
                &path,
                RasterInfo {
                    extent: grid(),
                    crs,
                    pixel_size_x: 10.0,
                    pixel_size_y: 10.0,
                    nodata,
                },
            );
            path
        }

        /// Create an input vector file and register it.
        pub fn vector(&self, name: &str, geometry_type: GeometryType, extent: Extent) -> PathBuf {
            let path = self.dir.path().join("inputs").join(format!("{name}.shp"));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"").unwrap();
            self.gateway.add_vector(
                &path,
                VectorInfo {
                    crs: Crs::epsg(CRS),
                    extent,
                    geometry_type,
                },
            );
            path
        }
    }

    pub fn pathway(n: u128, name: &str, path: PathBuf) -> Pathway {
        Pathway {
            uuid: Uuid::from_u128(n),
            name: name.to_string(),
            path,
            priority_layers: vec![],
            carbon_paths: vec![],
        }
    }

    pub fn activity(n: u128, name: &str, pathways: Vec<Pathway>) -> Activity {
        Activity {
            uuid: Uuid::from_u128(n),
            name: name.to_string(),
            description: String::new(),
            path: None,
            pathways,
            mask_paths: vec![],
            style_pixel_value: 0,
        }
    }

    pub fn direct_activity(n: u128, name: &str, path: PathBuf) -> Activity {
        Activity {
            path: Some(path),
            ..activity(n, name, vec![])
        }
    }
}
