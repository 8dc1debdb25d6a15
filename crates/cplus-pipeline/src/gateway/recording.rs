//! Dry-run gateway that records requests instead of computing rasters.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{
    AlignRequest, CellStatisticsRequest, ClipByMaskRequest, ExtentToLayerRequest, GatewayError,
    GatewayRequest, GeometryType, HighestPositionRequest, MergeVectorsRequest, Operation,
    OutputTarget, RasterCalculatorRequest, RasterGateway, RasterInfo, SieveRequest,
    SymmetricDifferenceRequest, TranslateRequest, VectorInfo, WarpRequest,
};

/// Known layers keyed by path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerCatalog {
    /// Raster layers.
    #[serde(default)]
    pub rasters: HashMap<String, RasterInfo>,
    /// Vector layers.
    #[serde(default)]
    pub vectors: HashMap<String, VectorInfo>,
}

impl LayerCatalog {
    fn key(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }
}

/// A [`RasterGateway`] that answers inspections from a [`LayerCatalog`],
/// logs every request in order, and writes empty placeholder files as
/// outputs.
///
/// Output metadata is derived from the request (e.g. a warp with a
/// no-data value yields a layer with that no-data value), so later
/// stages see consistent layer information. Temporary outputs are
/// placed in the scratch directory.
#[derive(Debug)]
pub struct RecordingGateway {
    scratch_dir: PathBuf,
    catalog: RefCell<LayerCatalog>,
    requests: RefCell<Vec<GatewayRequest>>,
    failing: RefCell<HashSet<Operation>>,
    temporaries: Cell<usize>,
}

impl RecordingGateway {
    /// Empty gateway writing temporaries under `scratch_dir`.
    #[must_use]
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self::with_catalog(scratch_dir, LayerCatalog::default())
    }

    /// Gateway pre-loaded with known layers.
    #[must_use]
    pub fn with_catalog(scratch_dir: impl Into<PathBuf>, catalog: LayerCatalog) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            catalog: RefCell::new(catalog),
            requests: RefCell::new(Vec::new()),
            failing: RefCell::new(HashSet::new()),
            temporaries: Cell::new(0),
        }
    }

    /// Register a raster layer.
    pub fn add_raster(&self, path: impl AsRef<Path>, info: RasterInfo) {
        self.catalog
            .borrow_mut()
            .rasters
            .insert(LayerCatalog::key(path.as_ref()), info);
    }

    /// Register a vector layer.
    pub fn add_vector(&self, path: impl AsRef<Path>, info: VectorInfo) {
        self.catalog
            .borrow_mut()
            .vectors
            .insert(LayerCatalog::key(path.as_ref()), info);
    }

    /// Make every subsequent call of `operation` fail.
    pub fn fail_on(&self, operation: Operation) {
        self.failing.borrow_mut().insert(operation);
    }

    /// Requests received so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<GatewayRequest> {
        self.requests.borrow().clone()
    }

    /// Operation kinds received so far, in order.
    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        self.requests
            .borrow()
            .iter()
            .map(GatewayRequest::operation)
            .collect()
    }

    /// Number of requests of the given kind.
    #[must_use]
    pub fn count(&self, operation: Operation) -> usize {
        self.requests
            .borrow()
            .iter()
            .filter(|r| r.operation() == operation)
            .count()
    }

    fn record(&self, request: GatewayRequest) -> Result<(), GatewayError> {
        let operation = request.operation();
        self.requests.borrow_mut().push(request);
        if self.failing.borrow().contains(&operation) {
            return Err(GatewayError::OperationFailed {
                operation,
                message: "operation configured to fail".to_string(),
            });
        }
        Ok(())
    }

    fn raster(&self, path: &Path) -> Result<RasterInfo, GatewayError> {
        self.catalog
            .borrow()
            .rasters
            .get(&LayerCatalog::key(path))
            .cloned()
            .ok_or_else(|| GatewayError::InvalidLayer {
                path: path.to_path_buf(),
            })
    }

    fn vector(&self, path: &Path) -> Result<VectorInfo, GatewayError> {
        self.catalog
            .borrow()
            .vectors
            .get(&LayerCatalog::key(path))
            .cloned()
            .ok_or_else(|| GatewayError::InvalidLayer {
                path: path.to_path_buf(),
            })
    }

    fn temporary(&self, operation: Operation, extension: &str) -> PathBuf {
        let n = self.temporaries.get() + 1;
        self.temporaries.set(n);
        self.scratch_dir
            .join(format!("{}_{n:04}.{extension}", operation.name()))
    }

    fn resolve(&self, target: &OutputTarget, operation: Operation) -> PathBuf {
        match target {
            OutputTarget::Temporary => self.temporary(operation, "tif"),
            OutputTarget::File(path) => path.clone(),
        }
    }

    fn emit_raster(&self, path: PathBuf, info: RasterInfo) -> Result<PathBuf, GatewayError> {
        touch(&path)?;
        self.add_raster(&path, info);
        Ok(path)
    }

    fn emit_vector(&self, path: PathBuf, info: VectorInfo) -> Result<PathBuf, GatewayError> {
        touch(&path)?;
        self.add_vector(&path, info);
        Ok(path)
    }
}

fn touch(path: &Path) -> Result<(), GatewayError> {
    let io_err = |e: std::io::Error| GatewayError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(path, b"").map_err(io_err)
}

impl RasterGateway for RecordingGateway {
    fn raster_info(&self, path: &Path) -> Result<RasterInfo, GatewayError> {
        self.raster(path)
    }

    fn vector_info(&self, path: &Path) -> Result<VectorInfo, GatewayError> {
        self.vector(path)
    }

    fn translate(&self, request: &TranslateRequest) -> Result<PathBuf, GatewayError> {
        self.record(GatewayRequest::Translate(request.clone()))?;
        let info = self.raster(&request.input)?;
        let output = self.resolve(&request.output, Operation::Translate);
        self.emit_raster(output, info)
    }

    fn warp(&self, request: &WarpRequest) -> Result<PathBuf, GatewayError> {
        self.record(GatewayRequest::Warp(request.clone()))?;
        let mut info = self.raster(&request.input)?;
        if let Some(nodata) = request.nodata {
            info.nodata = Some(nodata);
        }
        if let Some(crs) = &request.target_crs {
            info.crs = crs.clone();
        }
        if let Some(extent) = &request.target_extent {
            info.extent = extent.extent;
        }
        let output = self.resolve(&request.output, Operation::Warp);
        self.emit_raster(output, info)
    }

    fn align(&self, request: &AlignRequest) -> Result<PathBuf, GatewayError> {
        self.record(GatewayRequest::Align(request.clone()))?;
        self.raster(&request.input)?;
        let reference = self.raster(&request.reference)?;
        let stem = request
            .input
            .file_stem()
            .map_or_else(|| "layer".into(), |s| s.to_string_lossy());
        let output = request.output_directory.join(format!("{stem}_aligned.tif"));
        let info = RasterInfo {
            extent: request.extent.extent,
            crs: reference.crs,
            pixel_size_x: reference.pixel_size_x,
            pixel_size_y: reference.pixel_size_y,
            nodata: None,
        };
        self.emit_raster(output, info)
    }

    fn cell_statistics(&self, request: &CellStatisticsRequest) -> Result<PathBuf, GatewayError> {
        self.record(GatewayRequest::CellStatistics(request.clone()))?;
        for input in &request.inputs {
            self.raster(input)?;
        }
        let mut info = self.raster(&request.reference_layer)?;
        info.nodata = Some(request.output_nodata);
        if let Some(extent) = &request.extent {
            info.extent = extent.extent;
        }
        let output = self.resolve(&request.output, Operation::CellStatistics);
        self.emit_raster(output, info)
    }

    fn raster_calculator(
        &self,
        request: &RasterCalculatorRequest,
    ) -> Result<PathBuf, GatewayError> {
        self.record(GatewayRequest::RasterCalculator(request.clone()))?;
        let Some(first) = request.layers.first() else {
            return Err(GatewayError::OperationFailed {
                operation: Operation::RasterCalculator,
                message: "no input layers".to_string(),
            });
        };
        let mut info = self.raster(first)?;
        for layer in &request.layers[1..] {
            self.raster(layer)?;
        }
        if let Some(extent) = &request.extent {
            info.extent = extent.extent;
        }
        let output = self.resolve(&request.output, Operation::RasterCalculator);
        self.emit_raster(output, info)
    }

    fn sieve(&self, request: &SieveRequest) -> Result<PathBuf, GatewayError> {
        self.record(GatewayRequest::Sieve(request.clone()))?;
        let info = self.raster(&request.input)?;
        let output = self.resolve(&request.output, Operation::Sieve);
        self.emit_raster(output, info)
    }

    fn clip_by_mask(&self, request: &ClipByMaskRequest) -> Result<PathBuf, GatewayError> {
        self.record(GatewayRequest::ClipByMask(request.clone()))?;
        let mut info = self.raster(&request.input)?;
        self.vector(&request.mask)?;
        info.nodata = Some(request.nodata);
        if let Some(extent) = &request.target_extent {
            info.extent = extent.extent;
        }
        let output = self.resolve(&request.output, Operation::ClipByMask);
        self.emit_raster(output, info)
    }

    fn merge_vectors(&self, request: &MergeVectorsRequest) -> Result<PathBuf, GatewayError> {
        self.record(GatewayRequest::MergeVectors(request.clone()))?;
        let mut merged: Option<VectorInfo> = None;
        for layer in &request.layers {
            let info = self.vector(layer)?;
            merged = Some(match merged {
                None => info,
                Some(mut acc) => {
                    acc.extent = acc.extent.union(&info.extent);
                    acc
                }
            });
        }
        let info = merged.ok_or(GatewayError::OperationFailed {
            operation: Operation::MergeVectors,
            message: "no input layers".to_string(),
        })?;
        let output = self.temporary(Operation::MergeVectors, "gpkg");
        self.emit_vector(output, info)
    }

    fn extent_to_layer(&self, request: &ExtentToLayerRequest) -> Result<PathBuf, GatewayError> {
        self.record(GatewayRequest::ExtentToLayer(request.clone()))?;
        let info = VectorInfo {
            crs: request.extent.crs.clone(),
            extent: request.extent.extent,
            geometry_type: GeometryType::Polygon,
        };
        let output = self.temporary(Operation::ExtentToLayer, "gpkg");
        self.emit_vector(output, info)
    }

    fn symmetric_difference(
        &self,
        request: &SymmetricDifferenceRequest,
    ) -> Result<PathBuf, GatewayError> {
        self.record(GatewayRequest::SymmetricDifference(request.clone()))?;
        let input = self.vector(&request.input)?;
        let overlay = self.vector(&request.overlay)?;
        let info = VectorInfo {
            crs: input.crs,
            extent: input.extent.union(&overlay.extent),
            geometry_type: GeometryType::Polygon,
        };
        let output = self.temporary(Operation::SymmetricDifference, "gpkg");
        self.emit_vector(output, info)
    }

    fn highest_position(
        &self,
        request: &HighestPositionRequest,
    ) -> Result<PathBuf, GatewayError> {
        self.record(GatewayRequest::HighestPosition(request.clone()))?;
        for input in &request.inputs {
            self.raster(input)?;
        }
        let reference = request
            .reference_layer
            .as_ref()
            .or_else(|| request.inputs.first())
            .ok_or(GatewayError::OperationFailed {
                operation: Operation::HighestPosition,
                message: "no input layers".to_string(),
            })?;
        let mut info = self.raster(reference)?;
        info.extent = request.extent.extent;
        info.crs = request.extent.crs.clone();
        info.nodata = Some(request.output_nodata);
        let output = self.resolve(&request.output, Operation::HighestPosition);
        self.emit_raster(output, info)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::ResamplingMethod;
    use crate::gateway::DataType;
    use crate::types::{Crs, Extent};

    fn info(nodata: Option<f64>) -> RasterInfo {
        RasterInfo {
            extent: Extent::new(0.0, 0.0, 100.0, 100.0),
            crs: Crs::epsg(32735),
            pixel_size_x: 10.0,
            pixel_size_y: 10.0,
            nodata,
        }
    }

    #[test]
    fn unknown_layers_are_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::new(dir.path());
        assert!(matches!(
            gateway.raster_info(Path::new("/nope.tif")),
            Err(GatewayError::InvalidLayer { .. })
        ));
    }

    #[test]
    fn warp_output_carries_requested_nodata_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::new(dir.path().join("tmp"));
        gateway.add_raster("in.tif", info(Some(0.0)));

        let output = dir.path().join("out/fixed.tif");
        let path = gateway
            .warp(&WarpRequest {
                input: PathBuf::from("in.tif"),
                nodata: Some(-9999.0),
                target_crs: None,
                target_extent: None,
                resampling: ResamplingMethod::Nearest,
                data_type: DataType::SameAsInput,
                output: OutputTarget::File(output.clone()),
            })
            .unwrap();

        assert_eq!(path, output);
        assert!(path.exists());
        assert_eq!(gateway.raster_info(&path).unwrap().nodata, Some(-9999.0));
        assert_eq!(gateway.operations(), vec![Operation::Warp]);
    }

    #[test]
    fn temporaries_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::new(dir.path());
        gateway.add_raster("in.tif", info(None));
        let request = TranslateRequest {
            input: PathBuf::from("in.tif"),
            data_type: DataType::Float32,
            output: OutputTarget::Temporary,
        };
        let a = gateway.translate(&request).unwrap();
        let b = gateway.translate(&request).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(dir.path()));
        assert_eq!(gateway.count(Operation::Translate), 2);
    }

    #[test]
    fn failing_operation_is_still_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::new(dir.path());
        gateway.add_raster("in.tif", info(None));
        gateway.fail_on(Operation::Sieve);
        let result = gateway.sieve(&SieveRequest {
            input: PathBuf::from("in.tif"),
            threshold: 10.0,
            eight_connectedness: true,
            mask: None,
            output: OutputTarget::Temporary,
        });
        assert!(matches!(
            result,
            Err(GatewayError::OperationFailed {
                operation: Operation::Sieve,
                ..
            })
        ));
        assert_eq!(gateway.operations(), vec![Operation::Sieve]);
    }

    #[test]
    fn symmetric_difference_yields_polygon_over_both_extents() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = RecordingGateway::new(dir.path());
        gateway.add_vector(
            "mask.shp",
            VectorInfo {
                crs: Crs::epsg(4326),
                extent: Extent::new(5.0, 5.0, 20.0, 20.0),
                geometry_type: GeometryType::Polygon,
            },
        );
        let extent_layer = gateway
            .extent_to_layer(&ExtentToLayerRequest {
                extent: crate::types::ReferencedExtent {
                    extent: Extent::new(0.0, 0.0, 10.0, 10.0),
                    crs: Crs::epsg(4326),
                },
            })
            .unwrap();
        let diff = gateway
            .symmetric_difference(&SymmetricDifferenceRequest {
                input: PathBuf::from("mask.shp"),
                overlay: extent_layer,
            })
            .unwrap();
        let info = gateway.vector_info(&diff).unwrap();
        assert_eq!(info.extent, Extent::new(0.0, 0.0, 20.0, 20.0));
        assert_eq!(info.geometry_type, GeometryType::Polygon);
    }
}
