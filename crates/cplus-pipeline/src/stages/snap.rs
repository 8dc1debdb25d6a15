//! Snapping of pathways, carbon layers and priority layers to the
//! reference raster's pixel grid.

use std::path::{Path, PathBuf};

use super::{Stage, StageContext, StageKind, StageOutcome, degrade, replace_nodata};
use crate::align::align_extent;
use crate::gateway::AlignRequest;
use crate::state::AnalysisState;
use crate::types::{Pathway, PipelineError, ReferencedExtent};
use crate::workspace::StageDir;

pub(crate) struct Snap;

impl Stage for Snap {
    const KIND: StageKind = StageKind::Snap;

    fn skip_reason(ctx: &StageContext<'_>) -> Option<String> {
        if !ctx.config.snapping_enabled {
            return Some("snapping is disabled".to_string());
        }
        if ctx.config.reference_layer().is_none() {
            return Some("no snapping reference layer".to_string());
        }
        None
    }

    fn run(
        ctx: &mut StageContext<'_>,
        mut state: AnalysisState,
    ) -> Result<(AnalysisState, StageOutcome), PipelineError> {
        let Some(reference) = ctx.config.reference_layer().map(Path::to_path_buf) else {
            return Ok((state, StageOutcome::skipped("no snapping reference layer")));
        };
        ctx.status("Snapping the selected activity pathways, carbon layers and priority layers");
        ctx.require_layers(&state)?;

        let grid = match ctx.raster_info(&reference) {
            Ok(info) => ReferencedExtent {
                extent: align_extent(&info, &ctx.extent.extent),
                crs: ctx.extent.crs.clone(),
            },
            Err(err) => {
                tracing::warn!(
                    reference = %reference.display(),
                    error = %err,
                    "cannot read the snapping reference, using the processing extent"
                );
                ctx.extent.clone()
            }
        };
        let target = Target {
            reference: &reference,
            extent: &grid,
        };
        state.try_for_each_pathway(|pathway| snap_pathway(ctx, pathway, &target))?;
        Ok((state, StageOutcome::Applied))
    }
}

/// Reference raster and the processing extent snapped to its grid.
struct Target<'a> {
    reference: &'a Path,
    extent: &'a ReferencedExtent,
}

fn snap_pathway(
    ctx: &mut StageContext<'_>,
    pathway: &mut Pathway,
    target: &Target<'_>,
) -> Result<(), PipelineError> {
    ctx.checkpoint()?;
    let Ok(info) = ctx.raster_info(&pathway.path) else {
        tracing::warn!(pathway = %pathway.name, "pathway layer is not valid, skipping snapping");
        ctx.skipped();
        return Ok(());
    };

    if !pathway.carbon_paths.is_empty() {
        tracing::info!(pathway = %pathway.name, "snapping carbon layers");
        let mut snapped = Vec::with_capacity(pathway.carbon_paths.len());
        for carbon in std::mem::take(&mut pathway.carbon_paths) {
            let nodata = ctx.raster_info(&carbon).ok().and_then(|i| i.nodata);
            let result = snap_layer(ctx, &carbon, target, StageDir::CarbonLayers, nodata);
            snapped.push(degrade(result, &carbon)?.unwrap_or(carbon));
        }
        pathway.carbon_paths = snapped;
    }

    tracing::info!(pathway = %pathway.name, "snapping pathway layer");
    pathway.path = snap_layer(
        ctx,
        &pathway.path,
        target,
        StageDir::Pathways,
        info.nodata,
    )?;
    ctx.processed();

    for layer in &mut pathway.priority_layers {
        let Some(source) = layer.existing_path().map(Path::to_path_buf) else {
            continue;
        };
        let nodata = ctx.raster_info(&source).ok().and_then(|i| i.nodata);
        let result = snap_layer(ctx, &source, target, StageDir::PriorityLayers, nodata);
        if let Some(path) = degrade(result, &source)? {
            layer.path = Some(path);
        }
    }
    Ok(())
}

/// Align `input` to the reference grid inside the snapped extent,
/// then restore the input's original no-data value on the aligned
/// output as `{stem}_final.tif`.
fn snap_layer(
    ctx: &mut StageContext<'_>,
    input: &Path,
    target: &Target<'_>,
    dir: StageDir,
    nodata: Option<f64>,
) -> Result<PathBuf, PipelineError> {
    let request = AlignRequest {
        input: input.to_path_buf(),
        reference: target.reference.to_path_buf(),
        extent: target.extent.clone(),
        output_directory: ctx.workspace.stage_dir(dir)?,
        rescale_values: ctx.config.rescale_values,
        resampling: ctx.config.resampling,
    };
    let aligned = ctx.call(|g| g.align(&request))?;
    let Some(nodata) = nodata else {
        return Ok(aligned);
    };
    let stem = aligned
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let output = aligned.with_file_name(format!("{stem}_final.tif"));
    replace_nodata(ctx, &aligned, output, nodata)
}
