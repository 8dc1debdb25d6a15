//! No-data harmonization of pathways and their priority layers.

use std::path::{Path, PathBuf};

use super::{Stage, StageContext, StageKind, StageOutcome, replace_nodata};
use crate::state::AnalysisState;
use crate::types::{Pathway, PipelineError};
use crate::workspace::StageDir;

pub(crate) struct ReplaceNodata;

impl Stage for ReplaceNodata {
    const KIND: StageKind = StageKind::ReplaceNodata;

    fn run(
        ctx: &mut StageContext<'_>,
        mut state: AnalysisState,
    ) -> Result<(AnalysisState, StageOutcome), PipelineError> {
        ctx.status("Replacing the nodata value for the activity pathways and priority layers");
        ctx.require_layers(&state)?;
        let nodata = ctx.config.nodata_value;
        tracing::info!(nodata, "replacing nodata value for the pathways and priority layers");

        state.try_for_each_pathway(|pathway| harmonize_pathway(ctx, pathway, nodata))?;
        Ok((state, StageOutcome::Applied))
    }
}

fn harmonize_pathway(
    ctx: &mut StageContext<'_>,
    pathway: &mut Pathway,
    nodata: f64,
) -> Result<(), PipelineError> {
    ctx.checkpoint()?;
    let source = pathway.path.clone();
    match harmonize(ctx, &source, StageDir::ReplacedNodataPathways, nodata)? {
        Harmonized::Replaced(path) => pathway.path = path,
        Harmonized::Unchanged => {}
        Harmonized::Invalid => {
            tracing::warn!(pathway = %pathway.name, "pathway layer is not valid, skipping nodata replacement");
        }
    }

    let mut kept = Vec::with_capacity(pathway.priority_layers.len());
    for mut layer in std::mem::take(&mut pathway.priority_layers) {
        let Some(source) = layer.existing_path().map(Path::to_path_buf) else {
            kept.push(layer);
            continue;
        };
        ctx.checkpoint()?;
        match harmonize(ctx, &source, StageDir::ReplacedNodataPriorityLayers, nodata)? {
            Harmonized::Replaced(path) => layer.path = Some(path),
            Harmonized::Unchanged => {}
            Harmonized::Invalid => {
                tracing::warn!(
                    layer = %layer.name,
                    pathway = %pathway.name,
                    "priority layer is not valid, dropping it"
                );
                continue;
            }
        }
        kept.push(layer);
    }
    pathway.priority_layers = kept;
    Ok(())
}

enum Harmonized {
    Replaced(PathBuf),
    Unchanged,
    Invalid,
}

fn harmonize(
    ctx: &mut StageContext<'_>,
    source: &Path,
    dir: StageDir,
    nodata: f64,
) -> Result<Harmonized, PipelineError> {
    let Ok(info) = ctx.raster_info(source) else {
        ctx.skipped();
        return Ok(Harmonized::Invalid);
    };
    if info.nodata == Some(nodata) {
        tracing::debug!(layer = %source.display(), nodata, "layer already has the nodata value");
        ctx.skipped();
        return Ok(Harmonized::Unchanged);
    }
    tracing::info!(layer = %source.display(), nodata, "replacing nodata value");
    let output = ctx.workspace.scenario_file(dir, source)?;
    let path = replace_nodata(ctx, source, output, nodata)?;
    ctx.processed();
    Ok(Harmonized::Replaced(path))
}
