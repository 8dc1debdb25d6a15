//! Sieve filtering of activity rasters.
//!
//! Small connected regions are removed from a binary mask of the
//! activity; the sieved mask then zeroes those regions in the activity
//! and the zeros become no-data.

use std::path::{Path, PathBuf};

use super::{Stage, StageContext, StageKind, StageOutcome};
use crate::expression;
use crate::gateway::{
    CellStatisticsRequest, OutputTarget, RasterCalculatorRequest, SieveRequest, Statistic,
};
use crate::state::AnalysisState;
use crate::types::PipelineError;
use crate::workspace::StageDir;

pub(crate) struct Sieve;

impl Stage for Sieve {
    const KIND: StageKind = StageKind::Sieve;

    fn skip_reason(ctx: &StageContext<'_>) -> Option<String> {
        (!ctx.config.sieve_enabled).then(|| "sieve filtering is disabled".to_string())
    }

    fn run(
        ctx: &mut StageContext<'_>,
        mut state: AnalysisState,
    ) -> Result<(AnalysisState, StageOutcome), PipelineError> {
        ctx.status("Applying sieve function to the activities");
        for index in 0..state.activities().len() {
            ctx.checkpoint()?;
            let activity = &state.activities()[index];
            let name = activity.name.clone();
            let Some(layer) = activity.layer_path().map(Path::to_path_buf) else {
                let err = PipelineError::MissingActivityLayer { activity: name };
                ctx.critical(&format!("Problem when running sieve function on activities, {err}"));
                return Err(err);
            };
            let sieved = sieve_activity(ctx, &name, &layer)?;
            if let Some(activity) = state.activities_mut().get_mut(index) {
                activity.path = Some(sieved);
            }
            ctx.processed();
        }
        Ok((state, StageOutcome::Applied))
    }
}

fn sieve_activity(
    ctx: &mut StageContext<'_>,
    name: &str,
    layer: &Path,
) -> Result<PathBuf, PipelineError> {
    let nodata = ctx.config.nodata_value;
    tracing::info!(activity = %name, threshold = ctx.config.sieve_threshold, "sieving activity");

    let binary = calculate(ctx, expression::binary_mask(layer), vec![layer.to_path_buf()])?;
    let binary = ensure_exists(binary, "binary mask", name)?;

    let request = SieveRequest {
        input: binary,
        threshold: ctx.config.sieve_threshold,
        eight_connectedness: true,
        mask: ctx.config.sieve_mask_layer().map(Path::to_path_buf),
        output: OutputTarget::Temporary,
    };
    tracing::debug!(?request, "sieve parameters");
    let sieved = ensure_exists(ctx.call(|g| g.sieve(&request))?, "sieve", name)?;

    let cleaned = calculate(ctx, expression::positive_part(&sieved), vec![sieved])?;
    let cleaned = ensure_exists(cleaned, "sieved mask cleanup", name)?;

    let kept = calculate(
        ctx,
        expression::product(layer, &cleaned),
        vec![layer.to_path_buf(), cleaned],
    )?;
    let kept = ensure_exists(kept, "mask application", name)?;

    let restored = calculate(ctx, expression::zero_to_nodata(&kept, nodata), vec![kept])?;
    let restored = ensure_exists(restored, "no-data restoration", name)?;

    ctx.checkpoint()?;
    let request = CellStatisticsRequest {
        inputs: vec![restored.clone()],
        statistic: Statistic::Sum,
        ignore_nodata: false,
        reference_layer: restored,
        output_nodata: nodata,
        extent: None,
        output: OutputTarget::File(ctx.workspace.unique_file(StageDir::SievedActivities, name, None)?),
    };
    ctx.call(|g| g.cell_statistics(&request))
}

fn calculate(
    ctx: &mut StageContext<'_>,
    expression: String,
    layers: Vec<PathBuf>,
) -> Result<PathBuf, PipelineError> {
    let request = RasterCalculatorRequest {
        expression,
        layers,
        extent: None,
        output: OutputTarget::Temporary,
    };
    ctx.call(|g| g.raster_calculator(&request))
}

fn ensure_exists(path: PathBuf, step: &'static str, activity: &str) -> Result<PathBuf, PipelineError> {
    if path.exists() {
        Ok(path)
    } else {
        tracing::error!(step, activity, path = %path.display(), "sieve intermediate layer not found");
        Err(PipelineError::MissingIntermediate {
            step,
            activity: activity.to_string(),
        })
    }
}
