//! Typed boundary to the host's raster-algebra engine.
//!
//! Every external operation the pipeline invokes has its own request
//! struct. A [`RasterGateway`] implementation executes them and answers
//! layer inspections; the pipeline never touches raster data directly.
//! [`GatewayRequest`] wraps any request for logging and recording.

mod recording;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ResamplingMethod;
use crate::types::{Crs, Extent, ReferencedExtent};

pub use recording::{LayerCatalog, RecordingGateway};

/// Kind of external operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Format and data-type normalization.
    Translate,
    /// Warp: no-data reassignment and reprojection.
    Warp,
    /// Pixel-grid alignment to a reference raster.
    Align,
    /// Per-pixel statistic over a raster stack.
    CellStatistics,
    /// Raster calculator expression.
    RasterCalculator,
    /// Removal of small connected regions.
    Sieve,
    /// Clip a raster by a polygon mask.
    ClipByMask,
    /// Merge vector layers into one.
    MergeVectors,
    /// Polygon layer covering an extent.
    ExtentToLayer,
    /// Symmetric difference of two vector layers.
    SymmetricDifference,
    /// Highest position in a raster stack.
    HighestPosition,
}

impl Operation {
    /// Every operation kind.
    pub const ALL: [Self; 11] = [
        Self::Translate,
        Self::Warp,
        Self::Align,
        Self::CellStatistics,
        Self::RasterCalculator,
        Self::Sieve,
        Self::ClipByMask,
        Self::MergeVectors,
        Self::ExtentToLayer,
        Self::SymmetricDifference,
        Self::HighestPosition,
    ];

    /// Short machine name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Translate => "translate",
            Self::Warp => "warp",
            Self::Align => "align",
            Self::CellStatistics => "cell_statistics",
            Self::RasterCalculator => "raster_calculator",
            Self::Sieve => "sieve",
            Self::ClipByMask => "clip_by_mask",
            Self::MergeVectors => "merge_vectors",
            Self::ExtentToLayer => "extent_to_layer",
            Self::SymmetricDifference => "symmetric_difference",
            Self::HighestPosition => "highest_position",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where an operation writes its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTarget {
    /// A temporary file chosen by the gateway.
    Temporary,
    /// The given file.
    File(PathBuf),
}

impl OutputTarget {
    /// `File(path)` when `save` is set, `Temporary` otherwise.
    #[must_use]
    pub fn file_or_temporary(save: bool, path: PathBuf) -> Self {
        if save { Self::File(path) } else { Self::Temporary }
    }

    /// The explicit output file, if any.
    #[must_use]
    pub fn file(&self) -> Option<&Path> {
        match self {
            Self::Temporary => None,
            Self::File(path) => Some(path),
        }
    }
}

/// Output data type of a translate or warp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// 32-bit float.
    Float32,
    /// Keep the input's type.
    SameAsInput,
}

/// Per-pixel statistic for [`CellStatisticsRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    /// Sum of stack values.
    Sum,
}

/// Copy a raster, normalizing its format and data type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslateRequest {
    /// Input raster.
    pub input: PathBuf,
    /// Output data type.
    pub data_type: DataType,
    /// Output location.
    pub output: OutputTarget,
}

/// Warp a raster: reassign no-data and/or reproject.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarpRequest {
    /// Input raster.
    pub input: PathBuf,
    /// No-data value written to the output, if reassigning.
    pub nodata: Option<f64>,
    /// Target CRS, if reprojecting.
    pub target_crs: Option<Crs>,
    /// Target extent, if cropping while reprojecting.
    pub target_extent: Option<ReferencedExtent>,
    /// Resampling method.
    pub resampling: ResamplingMethod,
    /// Output data type.
    pub data_type: DataType,
    /// Output location.
    pub output: OutputTarget,
}

/// Align a raster to the pixel grid of a reference raster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignRequest {
    /// Input raster.
    pub input: PathBuf,
    /// Reference raster whose grid is adopted.
    pub reference: PathBuf,
    /// Clip extent, already snapped to the reference grid.
    pub extent: ReferencedExtent,
    /// Directory the aligned raster is written to.
    pub output_directory: PathBuf,
    /// Whether pixel values are rescaled with the cell size change.
    pub rescale_values: bool,
    /// Resampling method.
    pub resampling: ResamplingMethod,
}

/// Compute a per-pixel statistic over a raster stack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellStatisticsRequest {
    /// Stack members.
    pub inputs: Vec<PathBuf>,
    /// Statistic to compute.
    pub statistic: Statistic,
    /// Whether no-data cells are skipped rather than propagated.
    pub ignore_nodata: bool,
    /// Raster defining the output grid.
    pub reference_layer: PathBuf,
    /// No-data value of the output.
    pub output_nodata: f64,
    /// Output extent, if restricting.
    pub extent: Option<ReferencedExtent>,
    /// Output location.
    pub output: OutputTarget,
}

/// Evaluate a raster calculator expression.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RasterCalculatorRequest {
    /// Expression referencing layers as `"stem@band"`.
    pub expression: String,
    /// Layers referenced by the expression.
    pub layers: Vec<PathBuf>,
    /// Output extent, if restricting.
    pub extent: Option<ReferencedExtent>,
    /// Output location.
    pub output: OutputTarget,
}

/// Remove connected regions smaller than a pixel threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SieveRequest {
    /// Input raster.
    pub input: PathBuf,
    /// Minimum region size in pixels.
    pub threshold: f64,
    /// Whether diagonal neighbours are connected.
    pub eight_connectedness: bool,
    /// Optional layer restricting where sieving applies.
    pub mask: Option<PathBuf>,
    /// Output location.
    pub output: OutputTarget,
}

/// Clip a raster by a polygon mask layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClipByMaskRequest {
    /// Input raster.
    pub input: PathBuf,
    /// Polygon mask layer.
    pub mask: PathBuf,
    /// CRS of the input, used for source and destination.
    pub crs: Crs,
    /// Output extent, if restricting.
    pub target_extent: Option<ReferencedExtent>,
    /// No-data value for clipped-out cells.
    pub nodata: f64,
    /// Whether the output is cropped to the mask's extent.
    pub crop_to_cutline: bool,
    /// Output location.
    pub output: OutputTarget,
}

/// Merge several vector layers into one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeVectorsRequest {
    /// Layers to merge.
    pub layers: Vec<PathBuf>,
}

/// Create a polygon layer covering an extent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtentToLayerRequest {
    /// The extent.
    pub extent: ReferencedExtent,
}

/// Symmetric difference of two vector layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymmetricDifferenceRequest {
    /// Input layer.
    pub input: PathBuf,
    /// Overlay layer.
    pub overlay: PathBuf,
}

/// Per-pixel index of the highest-valued layer in an ordered stack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HighestPositionRequest {
    /// Stack members, bottom first.
    pub inputs: Vec<PathBuf>,
    /// Whether no-data cells are skipped rather than propagated.
    pub ignore_nodata: bool,
    /// Output extent.
    pub extent: ReferencedExtent,
    /// No-data value of the output.
    pub output_nodata: f64,
    /// Raster defining the output grid.
    pub reference_layer: Option<PathBuf>,
    /// Output location.
    pub output: OutputTarget,
}

/// Any gateway request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum GatewayRequest {
    /// See [`TranslateRequest`].
    Translate(TranslateRequest),
    /// See [`WarpRequest`].
    Warp(WarpRequest),
    /// See [`AlignRequest`].
    Align(AlignRequest),
    /// See [`CellStatisticsRequest`].
    CellStatistics(CellStatisticsRequest),
    /// See [`RasterCalculatorRequest`].
    RasterCalculator(RasterCalculatorRequest),
    /// See [`SieveRequest`].
    Sieve(SieveRequest),
    /// See [`ClipByMaskRequest`].
    ClipByMask(ClipByMaskRequest),
    /// See [`MergeVectorsRequest`].
    MergeVectors(MergeVectorsRequest),
    /// See [`ExtentToLayerRequest`].
    ExtentToLayer(ExtentToLayerRequest),
    /// See [`SymmetricDifferenceRequest`].
    SymmetricDifference(SymmetricDifferenceRequest),
    /// See [`HighestPositionRequest`].
    HighestPosition(HighestPositionRequest),
}

impl GatewayRequest {
    /// The operation kind.
    #[must_use]
    pub const fn operation(&self) -> Operation {
        match self {
            Self::Translate(_) => Operation::Translate,
            Self::Warp(_) => Operation::Warp,
            Self::Align(_) => Operation::Align,
            Self::CellStatistics(_) => Operation::CellStatistics,
            Self::RasterCalculator(_) => Operation::RasterCalculator,
            Self::Sieve(_) => Operation::Sieve,
            Self::ClipByMask(_) => Operation::ClipByMask,
            Self::MergeVectors(_) => Operation::MergeVectors,
            Self::ExtentToLayer(_) => Operation::ExtentToLayer,
            Self::SymmetricDifference(_) => Operation::SymmetricDifference,
            Self::HighestPosition(_) => Operation::HighestPosition,
        }
    }

    /// The explicit output file, if the request names one.
    #[must_use]
    pub fn output_file(&self) -> Option<&Path> {
        match self {
            Self::Translate(r) => r.output.file(),
            Self::Warp(r) => r.output.file(),
            Self::CellStatistics(r) => r.output.file(),
            Self::RasterCalculator(r) => r.output.file(),
            Self::Sieve(r) => r.output.file(),
            Self::ClipByMask(r) => r.output.file(),
            Self::HighestPosition(r) => r.output.file(),
            Self::Align(_)
            | Self::MergeVectors(_)
            | Self::ExtentToLayer(_)
            | Self::SymmetricDifference(_) => None,
        }
    }
}

/// Metadata of a raster layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterInfo {
    /// Layer extent.
    pub extent: Extent,
    /// Layer CRS.
    pub crs: Crs,
    /// Horizontal pixel size in map units.
    pub pixel_size_x: f64,
    /// Vertical pixel size in map units.
    pub pixel_size_y: f64,
    /// Band 1 no-data value, if set.
    #[serde(default)]
    pub nodata: Option<f64>,
}

/// Geometry type of a vector layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryType {
    /// Points.
    Point,
    /// Lines.
    Line,
    /// Polygons.
    Polygon,
}

/// Metadata of a vector layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorInfo {
    /// Layer CRS.
    pub crs: Crs,
    /// Layer extent.
    pub extent: Extent,
    /// Geometry type.
    pub geometry_type: GeometryType,
}

/// Failure of a single gateway call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// The layer could not be opened or is not valid.
    #[error("invalid layer {}", path.display())]
    InvalidLayer {
        /// Layer path.
        path: PathBuf,
    },

    /// The engine reported an error running the operation.
    #[error("{operation} failed: {message}")]
    OperationFailed {
        /// Which operation.
        operation: Operation,
        /// Engine message.
        message: String,
    },

    /// Reading or writing a file failed.
    #[error("i/o error on {}: {message}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Error message.
        message: String,
    },
}

/// The host's raster-algebra engine.
///
/// Each operation returns the path of its output. Calls are synchronous;
/// the pipeline issues them one at a time.
pub trait RasterGateway {
    /// Inspect a raster layer.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidLayer`] if the layer cannot be opened.
    fn raster_info(&self, path: &Path) -> Result<RasterInfo, GatewayError>;

    /// Inspect a vector layer.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidLayer`] if the layer cannot be opened.
    fn vector_info(&self, path: &Path) -> Result<VectorInfo, GatewayError>;

    /// Run a [`TranslateRequest`].
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`] the engine reports.
    fn translate(&self, request: &TranslateRequest) -> Result<PathBuf, GatewayError>;

    /// Run a [`WarpRequest`].
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`] the engine reports.
    fn warp(&self, request: &WarpRequest) -> Result<PathBuf, GatewayError>;

    /// Run an [`AlignRequest`].
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`] the engine reports.
    fn align(&self, request: &AlignRequest) -> Result<PathBuf, GatewayError>;

    /// Run a [`CellStatisticsRequest`].
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`] the engine reports.
    fn cell_statistics(&self, request: &CellStatisticsRequest) -> Result<PathBuf, GatewayError>;

    /// Run a [`RasterCalculatorRequest`].
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`] the engine reports.
    fn raster_calculator(
        &self,
        request: &RasterCalculatorRequest,
    ) -> Result<PathBuf, GatewayError>;

    /// Run a [`SieveRequest`].
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`] the engine reports.
    fn sieve(&self, request: &SieveRequest) -> Result<PathBuf, GatewayError>;

    /// Run a [`ClipByMaskRequest`].
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`] the engine reports.
    fn clip_by_mask(&self, request: &ClipByMaskRequest) -> Result<PathBuf, GatewayError>;

    /// Run a [`MergeVectorsRequest`].
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`] the engine reports.
    fn merge_vectors(&self, request: &MergeVectorsRequest) -> Result<PathBuf, GatewayError>;

    /// Run an [`ExtentToLayerRequest`].
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`] the engine reports.
    fn extent_to_layer(&self, request: &ExtentToLayerRequest) -> Result<PathBuf, GatewayError>;

    /// Run a [`SymmetricDifferenceRequest`].
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`] the engine reports.
    fn symmetric_difference(
        &self,
        request: &SymmetricDifferenceRequest,
    ) -> Result<PathBuf, GatewayError>;

    /// Run a [`HighestPositionRequest`].
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`] the engine reports.
    fn highest_position(&self, request: &HighestPositionRequest)
    -> Result<PathBuf, GatewayError>;
}
