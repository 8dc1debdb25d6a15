//! Pathway weighting.
//!
//! Each pathway becomes `(suitability * pathway) + Σ(coefficient * PWL)`
//! through the raster calculator. The suitability term is unweighted
//! when the index is zero, and a pathway with nothing to weight keeps
//! its path without any external call.

use super::compose::compose_activities;
use super::{Stage, StageContext, StageKind, StageOutcome};
use crate::expression::WeightedSum;
use crate::gateway::{OutputTarget, RasterCalculatorRequest};
use crate::state::AnalysisState;
use crate::types::{Pathway, PipelineError, PriorityGroup};
use crate::workspace::StageDir;

pub(crate) struct Weighting;

impl Stage for Weighting {
    const KIND: StageKind = StageKind::Weighting;

    fn run(
        ctx: &mut StageContext<'_>,
        mut state: AnalysisState,
    ) -> Result<(AnalysisState, StageOutcome), PipelineError> {
        ctx.status("Weighting of pathways");
        ctx.require_layers(&state)?;

        // Activities made only of direct layers: compose them right away and
        // report that weighting did not apply.
        if !state.has_pathways() && state.activities().iter().any(|a| a.layer_path().is_some()) {
            tracing::info!("no pathways to weight, composing activities from their layers");
            compose_activities(ctx, &mut state)?;
            return Ok((
                state,
                StageOutcome::Declined {
                    reason: "no pathways to weight, activities were composed from their layers"
                        .to_string(),
                },
            ));
        }

        let suitability = ctx.config.suitability_index;
        let scenario = ctx.scenario;
        state.try_for_each_pathway(|pathway| {
            weight_pathway(ctx, pathway, suitability, &scenario.priority_layer_groups)
        })?;
        Ok((state, StageOutcome::Applied))
    }
}

fn weight_pathway(
    ctx: &mut StageContext<'_>,
    pathway: &mut Pathway,
    suitability: f64,
    groups: &[PriorityGroup],
) -> Result<(), PipelineError> {
    ctx.checkpoint()?;
    let mut sum = WeightedSum::new();
    let mut layers = vec![pathway.path.clone()];
    let mut weighted = false;

    if suitability > 0.0 {
        sum.push_weighted(suitability, &pathway.path);
        weighted = true;
    } else {
        sum.push_layer(&pathway.path);
    }

    if groups.is_empty() {
        if !pathway.priority_layers.is_empty() {
            tracing::info!(
                pathway = %pathway.name,
                "no priority groups defined, skipping priority layers in weighting"
            );
        }
    } else {
        for layer in &pathway.priority_layers {
            let Some(path) = layer.existing_path() else {
                tracing::warn!(
                    layer = %layer.name,
                    pathway = %pathway.name,
                    "priority layer file does not exist, skipping it in weighting"
                );
                continue;
            };
            for group in &layer.groups {
                let coefficient = groups
                    .iter()
                    .find(|g| g.name == group.name)
                    .map_or(group.value, |g| g.value);
                if coefficient > 0.0 {
                    if !layers.iter().any(|l| l == path) {
                        layers.push(path.to_path_buf());
                    }
                    sum.push_weighted(coefficient, path);
                    weighted = true;
                }
            }
        }
    }

    if !weighted {
        tracing::debug!(pathway = %pathway.name, "nothing to weight, keeping the pathway layer");
        ctx.skipped();
        return Ok(());
    }

    let file = ctx
        .workspace
        .unique_file(StageDir::WeightedPathways, &pathway.name, None)?;
    let request = RasterCalculatorRequest {
        expression: sum.to_string(),
        layers,
        extent: Some(ctx.extent.clone()),
        output: OutputTarget::file_or_temporary(ctx.config.save.weighted_pathways, file),
    };
    tracing::info!(pathway = %pathway.name, expression = %request.expression, "weighting pathway");
    pathway.path = ctx.call(|g| g.raster_calculator(&request))?;
    ctx.processed();
    Ok(())
}
