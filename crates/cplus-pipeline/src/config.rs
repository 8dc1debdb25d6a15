//! Settings access and the typed configuration snapshot a run uses.
//!
//! The host application owns a key/value settings store. The pipeline
//! reads it through [`SettingsProvider`] once, at the start of a run,
//! into an [`AnalysisConfig`]; stages only ever see the snapshot.
//! Priority weighting layers are looked up by UUID through
//! [`PriorityLayerResolver`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::PriorityGroup;

/// Keys of the settings the pipeline reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    /// Whether pathways are snapped to the reference raster grid.
    SnappingEnabled,
    /// Reference raster used for snapping.
    SnapLayer,
    /// Resampling method index used when snapping.
    ResampleMethod,
    /// Whether snapped pixel values are rescaled.
    RescaleValues,
    /// No-data value written into every produced raster.
    NoDataValue,
    /// Suitability index applied to each pathway during weighting.
    SuitabilityIndex,
    /// Whether sieve filtering runs.
    SieveEnabled,
    /// Minimum region size in pixels kept by the sieve.
    SieveThreshold,
    /// Optional mask restricting where sieving applies.
    SieveMaskPath,
    /// Comma-joined list of scenario-wide exclusion mask layers.
    MaskLayerPaths,
    /// Directory under which scenario directories are created.
    BaseDir,
    /// Whether weighted pathways are saved (else temporary).
    SaveWeightedPathways,
    /// Whether composed activities are saved (else temporary).
    SaveActivities,
    /// Whether cleaned activities are saved (else temporary).
    SaveCleanedActivities,
    /// Whether the final composite is saved (else temporary).
    SaveHighestPosition,
}

impl Setting {
    /// Every setting, in declaration order.
    pub const ALL: [Self; 15] = [
        Self::SnappingEnabled,
        Self::SnapLayer,
        Self::ResampleMethod,
        Self::RescaleValues,
        Self::NoDataValue,
        Self::SuitabilityIndex,
        Self::SieveEnabled,
        Self::SieveThreshold,
        Self::SieveMaskPath,
        Self::MaskLayerPaths,
        Self::BaseDir,
        Self::SaveWeightedPathways,
        Self::SaveActivities,
        Self::SaveCleanedActivities,
        Self::SaveHighestPosition,
    ];

    /// Key under which the setting is stored.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::SnappingEnabled => "snapping_enabled",
            Self::SnapLayer => "snap_layer",
            Self::ResampleMethod => "resample_method",
            Self::RescaleValues => "rescale_values",
            Self::NoDataValue => "ncs_no_data_value",
            Self::SuitabilityIndex => "pathway_suitability_index",
            Self::SieveEnabled => "sieve_enabled",
            Self::SieveThreshold => "sieve_threshold",
            Self::SieveMaskPath => "sieve_mask_path",
            Self::MaskLayerPaths => "mask_layers_paths",
            Self::BaseDir => "base_dir",
            Self::SaveWeightedPathways => "ncs_weighted",
            Self::SaveActivities => "landuse_project",
            Self::SaveCleanedActivities => "landuse_normalized",
            Self::SaveHighestPosition => "highest_position",
        }
    }
}

/// Read-only access to the host settings store.
///
/// Implementors only provide [`raw`](Self::raw); the typed getters parse
/// the raw string and fall back to the given default when the key is
/// missing or unparseable.
pub trait SettingsProvider {
    /// The stored value as a string, if present.
    fn raw(&self, setting: Setting) -> Option<String>;

    /// Boolean setting (`true`/`false`, `1`/`0`, `yes`/`no`).
    fn bool_or(&self, setting: Setting, default: bool) -> bool {
        match self.raw(setting).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("true" | "1" | "yes") => true,
            Some("false" | "0" | "no") => false,
            _ => default,
        }
    }

    /// Numeric setting.
    fn f64_or(&self, setting: Setting, default: f64) -> f64 {
        self.raw(setting)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .unwrap_or(default)
    }

    /// Optional path setting; empty strings count as unset.
    fn path(&self, setting: Setting) -> Option<PathBuf> {
        self.raw(setting)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }

    /// Comma-joined path list; empty entries are dropped.
    fn path_list(&self, setting: Setting) -> Vec<PathBuf> {
        self.raw(setting)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A priority weighting layer as stored in the settings store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityLayerRecord {
    /// Identifier.
    pub uuid: Uuid,
    /// Display name.
    pub name: String,
    /// Raster path.
    pub path: PathBuf,
    /// Group memberships with their coefficients.
    #[serde(default)]
    pub groups: Vec<PriorityGroup>,
}

/// Looks up priority weighting layers by UUID.
pub trait PriorityLayerResolver {
    /// The layer with this UUID, or `None` if unknown.
    fn priority_layer(&self, uuid: &Uuid) -> Option<PriorityLayerRecord>;

    /// All known layers.
    fn priority_layers(&self) -> Vec<PriorityLayerRecord>;
}

/// In-memory settings store, deserializable from JSON.
///
/// ```json
/// {
///   "values": { "snapping_enabled": true, "ncs_no_data_value": -9999 },
///   "priority_layers": [
///     { "uuid": "…", "name": "Biodiversity", "path": "/data/bio.tif",
///       "groups": [{ "name": "Biodiversity", "value": 5 }] }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapSettings {
    #[serde(default)]
    values: HashMap<String, serde_json::Value>,
    #[serde(default)]
    priority_layers: Vec<PriorityLayerRecord>,
}

impl MapSettings {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a store from JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Builder-style setter.
    #[must_use]
    pub fn with(mut self, setting: Setting, value: impl Into<serde_json::Value>) -> Self {
        self.set(setting, value);
        self
    }

    /// Store a value.
    pub fn set(&mut self, setting: Setting, value: impl Into<serde_json::Value>) {
        self.values.insert(setting.key().to_string(), value.into());
    }

    /// Builder-style priority layer registration.
    #[must_use]
    pub fn with_priority_layer(mut self, record: PriorityLayerRecord) -> Self {
        self.priority_layers.push(record);
        self
    }
}

impl SettingsProvider for MapSettings {
    fn raw(&self, setting: Setting) -> Option<String> {
        match self.values.get(setting.key())? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            other => Some(other.to_string()),
        }
    }
}

impl PriorityLayerResolver for MapSettings {
    fn priority_layer(&self, uuid: &Uuid) -> Option<PriorityLayerRecord> {
        self.priority_layers.iter().find(|l| l.uuid == *uuid).cloned()
    }

    fn priority_layers(&self) -> Vec<PriorityLayerRecord> {
        self.priority_layers.clone()
    }
}

/// Resampling methods offered by the raster alignment tool, stored in
/// settings by index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingMethod {
    /// Nearest neighbour.
    #[default]
    Nearest,
    /// Bilinear.
    Bilinear,
    /// Cubic convolution.
    Cubic,
    /// Cubic B-spline.
    CubicSpline,
    /// Lanczos windowed sinc.
    Lanczos,
    /// Average of contributing pixels.
    Average,
    /// Most frequent value.
    Mode,
    /// Maximum value.
    Max,
    /// Minimum value.
    Min,
    /// Median value.
    Median,
    /// First quartile.
    FirstQuartile,
    /// Third quartile.
    ThirdQuartile,
}

impl ResamplingMethod {
    const ORDER: [Self; 12] = [
        Self::Nearest,
        Self::Bilinear,
        Self::Cubic,
        Self::CubicSpline,
        Self::Lanczos,
        Self::Average,
        Self::Mode,
        Self::Max,
        Self::Min,
        Self::Median,
        Self::FirstQuartile,
        Self::ThirdQuartile,
    ];

    /// Method stored at `index`, if any.
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ORDER.get(index).copied()
    }
}

/// Which stage outputs are written to the scenario directory rather
/// than to temporary files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveOutputs {
    /// Weighted pathways.
    pub weighted_pathways: bool,
    /// Composed activities.
    pub activities: bool,
    /// Cleaned activities.
    pub cleaned_activities: bool,
    /// Final highest-position composite.
    pub highest_position: bool,
}

impl Default for SaveOutputs {
    fn default() -> Self {
        Self {
            weighted_pathways: true,
            activities: true,
            cleaned_activities: true,
            highest_position: true,
        }
    }
}

/// Typed snapshot of every setting a run reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Directory under which the scenario directory is created.
    pub base_dir: PathBuf,
    /// No-data value harmonized across inputs and written to outputs.
    pub nodata_value: f64,
    /// Whether snapping is enabled.
    pub snapping_enabled: bool,
    /// Reference raster for snapping.
    pub snap_layer: Option<PathBuf>,
    /// Resampling method used when snapping.
    pub resampling: ResamplingMethod,
    /// Whether snapped values are rescaled.
    pub rescale_values: bool,
    /// Pathway suitability index; zero disables the suitability term.
    pub suitability_index: f64,
    /// Whether sieve filtering runs.
    pub sieve_enabled: bool,
    /// Sieve threshold in pixels.
    pub sieve_threshold: f64,
    /// Optional sieve mask layer.
    pub sieve_mask: Option<PathBuf>,
    /// Scenario-wide exclusion masks.
    pub mask_layers: Vec<PathBuf>,
    /// Save-vs-temporary flags.
    pub save: SaveOutputs,
}

impl AnalysisConfig {
    /// Default no-data value.
    pub const DEFAULT_NODATA_VALUE: f64 = -9999.0;
    /// Default sieve threshold in pixels.
    pub const DEFAULT_SIEVE_THRESHOLD: f64 = 10.0;
    /// Default suitability index.
    pub const DEFAULT_SUITABILITY_INDEX: f64 = 0.0;

    /// Read every setting from `settings`, applying defaults.
    #[must_use]
    pub fn from_settings(settings: &dyn SettingsProvider) -> Self {
        let defaults = Self::default();
        let resampling = settings
            .raw(Setting::ResampleMethod)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .and_then(ResamplingMethod::from_index)
            .unwrap_or_default();
        Self {
            base_dir: settings.path(Setting::BaseDir).unwrap_or(defaults.base_dir),
            nodata_value: settings.f64_or(Setting::NoDataValue, Self::DEFAULT_NODATA_VALUE),
            snapping_enabled: settings.bool_or(Setting::SnappingEnabled, false),
            snap_layer: settings.path(Setting::SnapLayer),
            resampling,
            rescale_values: settings.bool_or(Setting::RescaleValues, false),
            suitability_index: settings
                .f64_or(Setting::SuitabilityIndex, Self::DEFAULT_SUITABILITY_INDEX),
            sieve_enabled: settings.bool_or(Setting::SieveEnabled, false),
            sieve_threshold: settings.f64_or(Setting::SieveThreshold, Self::DEFAULT_SIEVE_THRESHOLD),
            sieve_mask: settings.path(Setting::SieveMaskPath),
            mask_layers: settings.path_list(Setting::MaskLayerPaths),
            save: SaveOutputs {
                weighted_pathways: settings.bool_or(Setting::SaveWeightedPathways, true),
                activities: settings.bool_or(Setting::SaveActivities, true),
                cleaned_activities: settings.bool_or(Setting::SaveCleanedActivities, true),
                highest_position: settings.bool_or(Setting::SaveHighestPosition, true),
            },
        }
    }

    /// The snapping reference raster, when snapping is enabled and the
    /// configured reference is an existing file.
    #[must_use]
    pub fn reference_layer(&self) -> Option<&Path> {
        if !self.snapping_enabled {
            return None;
        }
        self.snap_layer.as_deref().filter(|p| p.is_file())
    }

    /// The sieve mask, when configured and present on disk.
    #[must_use]
    pub fn sieve_mask_layer(&self) -> Option<&Path> {
        self.sieve_mask.as_deref().filter(|p| p.exists())
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("cplus"),
            nodata_value: Self::DEFAULT_NODATA_VALUE,
            snapping_enabled: false,
            snap_layer: None,
            resampling: ResamplingMethod::default(),
            rescale_values: false,
            suitability_index: Self::DEFAULT_SUITABILITY_INDEX,
            sieve_enabled: false,
            sieve_threshold: Self::DEFAULT_SIEVE_THRESHOLD,
            sieve_mask: None,
            mask_layers: Vec::new(),
            save: SaveOutputs::default(),
        }
    }
}
