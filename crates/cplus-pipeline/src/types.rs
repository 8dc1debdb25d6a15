//! Shared types for the scenario analysis pipeline.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use geo::Intersects;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::GatewayError;
use crate::pipeline::RunState;

/// EPSG code used when neither the scenario nor its layers carry a CRS.
pub const DEFAULT_CRS_ID: u32 = 4326;

/// Base file name of the final scenario composite raster.
pub const SCENARIO_OUTPUT_FILE_NAME: &str = "cplus_scenario_output";

/// A coordinate reference system identified by its authority id
/// (e.g. `EPSG:4326`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Crs(String);

impl Crs {
    /// Create a CRS from an authority id such as `EPSG:32735`.
    #[must_use]
    pub fn new(authid: impl Into<String>) -> Self {
        Self(authid.into())
    }

    /// Create an EPSG CRS from its numeric code.
    #[must_use]
    pub fn epsg(code: u32) -> Self {
        Self(format!("EPSG:{code}"))
    }

    /// The authority id string.
    #[must_use]
    pub fn authid(&self) -> &str {
        &self.0
    }

    /// Whether the authority id has the `AUTHORITY:CODE` shape with
    /// both parts non-empty.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.0
            .split_once(':')
            .is_some_and(|(authority, code)| {
                !authority.trim().is_empty() && !code.trim().is_empty()
            })
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An axis-aligned bounding box in map units.
///
/// Stored as plain bounds so it serializes cleanly; geometric predicates
/// go through [`geo::Rect`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    /// Minimum x (left edge).
    pub xmin: f64,
    /// Minimum y (bottom edge).
    pub ymin: f64,
    /// Maximum x (right edge).
    pub xmax: f64,
    /// Maximum y (top edge).
    pub ymax: f64,
}

impl Extent {
    /// Create an extent from its bounds.
    #[must_use]
    pub const fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    /// The extent as a `geo` rectangle.
    #[must_use]
    pub fn to_rect(&self) -> geo::Rect<f64> {
        geo::Rect::new(
            geo::coord! { x: self.xmin, y: self.ymin },
            geo::coord! { x: self.xmax, y: self.ymax },
        )
    }

    /// Whether the two extents share at least one point.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.to_rect().intersects(&other.to_rect())
    }

    /// Whether `other` lies entirely inside this extent (edges included).
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.xmin <= other.xmin
            && self.ymin <= other.ymin
            && self.xmax >= other.xmax
            && self.ymax >= other.ymax
    }

    /// Smallest extent covering both.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self::new(
            self.xmin.min(other.xmin),
            self.ymin.min(other.ymin),
            self.xmax.max(other.xmax),
            self.ymax.max(other.ymax),
        )
    }

    /// Closed WKT polygon of the extent, used in log messages.
    #[must_use]
    pub fn to_wkt(&self) -> String {
        let Self {
            xmin,
            ymin,
            xmax,
            ymax,
        } = self;
        format!(
            "POLYGON(({xmin} {ymin}, {xmax} {ymin}, {xmax} {ymax}, {xmin} {ymax}, {xmin} {ymin}))"
        )
    }
}

/// An extent tagged with the CRS its coordinates are expressed in.
///
/// Renders as `xmin,xmax,ymin,ymax [AUTH:CODE]`, the form raster
/// operations accept for target extents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencedExtent {
    /// The bounds.
    pub extent: Extent,
    /// CRS of the bounds.
    pub crs: Crs,
}

impl fmt::Display for ReferencedExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = &self.extent;
        write!(
            f,
            "{},{},{},{} [{}]",
            e.xmin, e.xmax, e.ymin, e.ymax, self.crs
        )
    }
}

/// The analysis area of a scenario: a bounding box and an optional CRS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialExtent {
    /// Bounding box of the area of interest.
    pub bbox: Extent,
    /// Target CRS. When set, pathways are reprojected into it.
    #[serde(default)]
    pub crs: Option<Crs>,
}

/// Weight attached to a named priority group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityGroup {
    /// Group name (e.g. "Biodiversity").
    pub name: String,
    /// Group coefficient.
    pub value: f64,
}

/// A priority weighting layer (PWL) referenced by a pathway.
///
/// Callers usually only set `uuid` and `name`; `path` and `groups` are
/// filled in from the priority-layer resolver when the analysis state is
/// built, and `path` is then rewritten by every stage that transforms
/// the layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityWeightingLayer {
    /// Identifier used to look the layer up in the settings store.
    pub uuid: Uuid,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Raster path, once resolved.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Priority groups the layer belongs to.
    #[serde(default)]
    pub groups: Vec<PriorityGroup>,
}

impl PriorityWeightingLayer {
    /// The resolved path, if it points at an existing file.
    #[must_use]
    pub fn existing_path(&self) -> Option<&Path> {
        self.path.as_deref().filter(|p| p.exists())
    }
}

/// A single land-use / ecosystem-service raster contributing to an
/// activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pathway {
    /// Identifier. Pathways shared between activities are processed once.
    pub uuid: Uuid,
    /// Display name.
    pub name: String,
    /// Current raster path. Empty means "not yet computed".
    #[serde(default)]
    pub path: PathBuf,
    /// Priority weighting layers, in order.
    #[serde(default)]
    pub priority_layers: Vec<PriorityWeightingLayer>,
    /// Auxiliary carbon layers.
    #[serde(default)]
    pub carbon_paths: Vec<PathBuf>,
}

impl Pathway {
    /// Whether the pathway has a raster path.
    #[must_use]
    pub fn is_computed(&self) -> bool {
        !self.path.as_os_str().is_empty()
    }
}

/// A land-management intervention, represented either by a direct
/// raster layer or by a composition of pathways.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Identifier.
    pub uuid: Uuid,
    /// Display name, also used to derive output file names.
    pub name: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Direct raster path; rewritten by every stage that recomputes the
    /// activity raster.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Pathways composed into this activity.
    #[serde(default)]
    pub pathways: Vec<Pathway>,
    /// Polygon layers masked out of this activity only.
    #[serde(default)]
    pub mask_paths: Vec<PathBuf>,
    /// Position in the final highest-position stack.
    #[serde(default)]
    pub style_pixel_value: i64,
}

impl Activity {
    /// The direct raster path, ignoring empty paths.
    #[must_use]
    pub fn layer_path(&self) -> Option<&Path> {
        non_empty(self.path.as_deref())
    }
}

/// Returns `path` unless it is empty.
pub(crate) fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}

/// Identity and inputs of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Identifier; its first four characters tag the run's output files.
    pub uuid: Uuid,
    /// Display name.
    pub name: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Analysis extent.
    pub extent: SpatialExtent,
    /// Activities to analyse.
    pub activities: Vec<Activity>,
    /// Weights assigned to priority groups for this scenario.
    #[serde(default)]
    pub priority_layer_groups: Vec<PriorityGroup>,
}

impl Scenario {
    /// First four characters of the scenario UUID.
    #[must_use]
    pub fn short_id(&self) -> String {
        crate::workspace::short_uuid(&self.uuid)
    }
}

/// Record of a successful run, created once by the final stage.
///
/// Fields are private; the value cannot be changed after construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioResult {
    scenario: Scenario,
    scenario_directory: PathBuf,
    output_path: PathBuf,
    activities: Vec<Activity>,
    created: DateTime<Utc>,
}

impl ScenarioResult {
    pub(crate) fn new(
        scenario: Scenario,
        scenario_directory: PathBuf,
        output_path: PathBuf,
        activities: Vec<Activity>,
    ) -> Self {
        Self {
            scenario,
            scenario_directory,
            output_path,
            activities,
            created: Utc::now(),
        }
    }

    /// The scenario this result belongs to.
    #[must_use]
    pub const fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Working directory of the run.
    #[must_use]
    pub fn scenario_directory(&self) -> &Path {
        &self.scenario_directory
    }

    /// Path of the final highest-position composite.
    #[must_use]
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Activities as they stood after the final stage, in stack order.
    #[must_use]
    pub fn activities(&self) -> &[Activity] {
        &self.activities
    }

    /// When the result was constructed.
    #[must_use]
    pub const fn created(&self) -> DateTime<Utc> {
        self.created
    }
}

/// Errors that end a scenario run.
///
/// `Clone` so the task can keep the terminal error while also returning
/// it to the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    /// The cancellation token was observed at a checkpoint.
    #[error("processing has been cancelled by the user")]
    Cancelled,

    /// The scenario has no activities.
    #[error("no defined activities for the scenario")]
    NoActivities,

    /// An activity has neither a direct layer nor pathways.
    #[error("no defined activity pathways or activity layer for the activity `{activity}`")]
    MissingLayers {
        /// Activity name.
        activity: String,
    },

    /// A stage that works on activity rasters found one without a layer.
    #[error("there is no map layer for the activity `{activity}`")]
    MissingActivityLayer {
        /// Activity name.
        activity: String,
    },

    /// Reprojection was requested into an unusable CRS.
    #[error("invalid target CRS `{0}` for reprojecting pathways")]
    InvalidTargetCrs(Crs),

    /// A mask or study-area layer could not be opened.
    #[error("invalid mask layer: {0}")]
    InvalidMaskLayer(String),

    /// A mask layer does not contain polygons.
    #[error("mask layer {} is not a polygon layer", .0.display())]
    NotPolygonMask(PathBuf),

    /// A sieve step returned no output file.
    #[error("{step} produced no output for the activity `{activity}`")]
    MissingIntermediate {
        /// Which step failed to produce output.
        step: &'static str,
        /// Activity name.
        activity: String,
    },

    /// An external raster operation failed.
    #[error("{stage} stage failed: {source}")]
    Gateway {
        /// Stage name.
        stage: &'static str,
        /// Underlying failure.
        #[source]
        source: GatewayError,
    },

    /// The scenario working directory could not be prepared.
    #[error("failed to prepare {}: {source}", path.display())]
    Io {
        /// Directory or file involved.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// `run` was called on a task that already ran.
    #[error("the task has already finished ({0})")]
    TaskFinished(RunState),
}

impl PipelineError {
    /// Adapter for `map_err` tagging a gateway failure with its stage.
    pub fn gateway(stage: &'static str) -> impl FnOnce(GatewayError) -> Self {
        move |source| Self::Gateway { stage, source }
    }

    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }

    /// Whether the error comes from the scenario's configuration rather
    /// than from an operation failing.
    #[must_use]
    pub const fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::NoActivities
                | Self::MissingLayers { .. }
                | Self::MissingActivityLayer { .. }
                | Self::InvalidTargetCrs(_)
                | Self::InvalidMaskLayer(_)
                | Self::NotPolygonMask(_)
        )
    }
}
