//! Reprojection of pathways and priority layers into the scenario CRS.

use std::path::{Path, PathBuf};

use super::{Stage, StageContext, StageKind, StageOutcome};
use crate::config::ResamplingMethod;
use crate::gateway::{DataType, OutputTarget, WarpRequest};
use crate::state::AnalysisState;
use crate::types::{Crs, Pathway, PipelineError};
use crate::workspace::StageDir;

pub(crate) struct Reproject;

impl Stage for Reproject {
    const KIND: StageKind = StageKind::Reproject;

    fn skip_reason(ctx: &StageContext<'_>) -> Option<String> {
        ctx.scenario
            .extent
            .crs
            .is_none()
            .then(|| "scenario has no target CRS".to_string())
    }

    fn run(
        ctx: &mut StageContext<'_>,
        mut state: AnalysisState,
    ) -> Result<(AnalysisState, StageOutcome), PipelineError> {
        let Some(target) = ctx.scenario.extent.crs.clone() else {
            return Ok((state, StageOutcome::skipped("scenario has no target CRS")));
        };
        if !target.is_valid() {
            ctx.critical(&format!(
                "Invalid target CRS `{target}` for reprojecting the activity pathways"
            ));
            return Err(PipelineError::InvalidTargetCrs(target));
        }

        ctx.status("Reprojecting the activity pathways and priority layers");
        ctx.require_layers(&state)?;

        state.try_for_each_pathway(|pathway| reproject_pathway(ctx, pathway, &target))?;
        Ok((state, StageOutcome::Applied))
    }
}

fn reproject_pathway(
    ctx: &mut StageContext<'_>,
    pathway: &mut Pathway,
    target: &Crs,
) -> Result<(), PipelineError> {
    ctx.checkpoint()?;
    let source = pathway.path.clone();
    match reproject_layer(ctx, &source, target, StageDir::ReprojectedPathways)? {
        Some(path) => {
            pathway.path = path;
            ctx.processed();
        }
        None => ctx.skipped(),
    }

    for layer in &mut pathway.priority_layers {
        let Some(source) = layer.existing_path().map(Path::to_path_buf) else {
            continue;
        };
        ctx.checkpoint()?;
        if let Some(path) =
            reproject_layer(ctx, &source, target, StageDir::ReprojectedPriorityLayers)?
        {
            layer.path = Some(path);
        }
    }
    Ok(())
}

/// Warp `source` into `target`, or `None` if it is invalid or already
/// there.
fn reproject_layer(
    ctx: &mut StageContext<'_>,
    source: &Path,
    target: &Crs,
    dir: StageDir,
) -> Result<Option<PathBuf>, PipelineError> {
    let info = match ctx.raster_info(source) {
        Ok(info) => info,
        Err(err) => {
            tracing::warn!(layer = %source.display(), error = %err, "skipping invalid layer");
            return Ok(None);
        }
    };
    if info.crs == *target {
        tracing::debug!(layer = %source.display(), crs = %target, "layer already in target CRS");
        return Ok(None);
    }
    tracing::info!(layer = %source.display(), from = %info.crs, to = %target, "reprojecting layer");
    let request = WarpRequest {
        input: source.to_path_buf(),
        nodata: None,
        target_crs: Some(target.clone()),
        target_extent: Some(ctx.extent.clone()),
        resampling: ResamplingMethod::Nearest,
        data_type: DataType::SameAsInput,
        output: OutputTarget::File(ctx.workspace.scenario_file(dir, source)?),
    };
    ctx.call(|g| g.warp(&request)).map(Some)
}
