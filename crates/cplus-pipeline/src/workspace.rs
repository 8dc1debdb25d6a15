//! Per-run scenario working directory and output file naming.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use uuid::Uuid;

use crate::types::{PipelineError, SCENARIO_OUTPUT_FILE_NAME, Scenario};

/// Subdirectories of the scenario directory, one per kind of output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageDir {
    /// Pathways with harmonized no-data.
    ReplacedNodataPathways,
    /// Priority layers with harmonized no-data.
    ReplacedNodataPriorityLayers,
    /// Snapped pathways.
    Pathways,
    /// Snapped carbon layers.
    CarbonLayers,
    /// Snapped priority layers.
    PriorityLayers,
    /// Pathways clipped to the study area.
    ClippedPathways,
    /// Priority layers clipped to the study area.
    ClippedPriorityLayers,
    /// Reprojected pathways.
    ReprojectedPathways,
    /// Reprojected priority layers.
    ReprojectedPriorityLayers,
    /// Composed activities.
    Activities,
    /// Activities after scenario-wide masking.
    MaskedActivities,
    /// Activities after per-activity masking.
    FinalMaskedActivities,
    /// Sieved activities.
    SievedActivities,
    /// Weighted pathways, also home of cleaned activities.
    WeightedPathways,
}

impl StageDir {
    /// Every directory.
    pub const ALL: [Self; 14] = [
        Self::ReplacedNodataPathways,
        Self::ReplacedNodataPriorityLayers,
        Self::Pathways,
        Self::CarbonLayers,
        Self::PriorityLayers,
        Self::ClippedPathways,
        Self::ClippedPriorityLayers,
        Self::ReprojectedPathways,
        Self::ReprojectedPriorityLayers,
        Self::Activities,
        Self::MaskedActivities,
        Self::FinalMaskedActivities,
        Self::SievedActivities,
        Self::WeightedPathways,
    ];

    /// Directory name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ReplacedNodataPathways => "replaced_nodata_pathways",
            Self::ReplacedNodataPriorityLayers => "replaced_nodata_priority_layers",
            Self::Pathways => "pathways",
            Self::CarbonLayers => "carbon_layers",
            Self::PriorityLayers => "priority_layers",
            Self::ClippedPathways => "clipped_pathways",
            Self::ClippedPriorityLayers => "clipped_priority_layers",
            Self::ReprojectedPathways => "reprojected_pathways",
            Self::ReprojectedPriorityLayers => "reprojected_priority_layers",
            Self::Activities => "activities",
            Self::MaskedActivities => "masked_activities",
            Self::FinalMaskedActivities => "final_masked_activities",
            Self::SievedActivities => "sieved_activities",
            Self::WeightedPathways => "weighted_pathways",
        }
    }
}

/// First four characters of a UUID's hyphenated form.
#[must_use]
pub fn short_uuid(uuid: &Uuid) -> String {
    uuid.hyphenated().to_string().chars().take(4).collect()
}

/// File-system safe form of a display name: spaces become underscores,
/// characters other than alphanumerics, `_`, `-` and `.` are dropped.
#[must_use]
pub fn clean_filename(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            ' ' => Some('_'),
            c if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') => Some(c),
            _ => None,
        })
        .collect()
}

/// The scenario directory of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioWorkspace {
    root: PathBuf,
    tag: String,
}

impl ScenarioWorkspace {
    /// Create `{base_dir}/scenario_{YYYY_MM_DD_HH_MM_SS}` for a run
    /// started at `started`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Io`] if the directory cannot be created.
    pub fn create(
        base_dir: &Path,
        scenario: &Scenario,
        started: NaiveDateTime,
    ) -> Result<Self, PipelineError> {
        let root = base_dir.join(format!("scenario_{}", started.format("%Y_%m_%d_%H_%M_%S")));
        std::fs::create_dir_all(&root).map_err(PipelineError::io(&root))?;
        Ok(Self {
            root,
            tag: scenario.short_id(),
        })
    }

    /// The scenario directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Short scenario tag embedded in file names.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Path of `dir`, created on first use.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Io`] if the directory cannot be created.
    pub fn stage_dir(&self, dir: StageDir) -> Result<PathBuf, PipelineError> {
        let path = self.root.join(dir.name());
        std::fs::create_dir_all(&path).map_err(PipelineError::io(&path))?;
        Ok(path)
    }

    /// `{dir}/{source stem}_{scenario tag}.tif`, for outputs derived from
    /// a single input layer.
    ///
    /// The file is reserved by creating it empty. When another input with
    /// the same stem already claimed that name in this run, a random tag
    /// is appended: `{source stem}_{scenario tag}_{random tag}.tif`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Io`] if the directory or file cannot be created.
    pub fn scenario_file(&self, dir: StageDir, source: &Path) -> Result<PathBuf, PipelineError> {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = self.stage_dir(dir)?;
        let mut path = dir.join(format!("{stem}_{}.tif", self.tag));
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(path),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    let random = short_uuid(&Uuid::new_v4());
                    path = dir.join(format!("{stem}_{}_{random}.tif", self.tag));
                }
                Err(err) => return Err(PipelineError::io(&path)(err)),
            }
        }
    }

    /// `{dir}/{clean name}_{random tag}[_{suffix}].tif`, for outputs named
    /// after a pathway or activity.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Io`] if the directory cannot be created.
    pub fn unique_file(
        &self,
        dir: StageDir,
        name: &str,
        suffix: Option<&str>,
    ) -> Result<PathBuf, PipelineError> {
        let random = short_uuid(&Uuid::new_v4());
        let file = match suffix {
            Some(suffix) => format!("{}_{random}_{suffix}.tif", clean_filename(name)),
            None => format!("{}_{random}.tif", clean_filename(name)),
        };
        Ok(self.stage_dir(dir)?.join(file))
    }

    /// Path of the final highest-position composite.
    #[must_use]
    pub fn final_output(&self) -> PathBuf {
        self.root
            .join(format!("{SCENARIO_OUTPUT_FILE_NAME}_{}.tif", self.tag))
    }
}
