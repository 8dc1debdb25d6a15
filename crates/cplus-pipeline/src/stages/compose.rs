//! Activity composition: one raster per activity, the cell-wise sum of
//! its direct layer and pathways.

use std::path::{Path, PathBuf};

use super::{Stage, StageContext, StageKind, StageOutcome};
use crate::gateway::{CellStatisticsRequest, OutputTarget, Statistic};
use crate::state::AnalysisState;
use crate::types::PipelineError;
use crate::workspace::StageDir;

pub(crate) struct Compose;

impl Stage for Compose {
    const KIND: StageKind = StageKind::Compose;

    fn run(
        ctx: &mut StageContext<'_>,
        mut state: AnalysisState,
    ) -> Result<(AnalysisState, StageOutcome), PipelineError> {
        compose_activities(ctx, &mut state)?;
        Ok((state, StageOutcome::Applied))
    }
}

/// Sum each activity's layers into a new activity raster and point the
/// activity at it.
///
/// The snapping reference raster, when active, is the output grid;
/// otherwise the activity's first layer is.
pub(crate) fn compose_activities(
    ctx: &mut StageContext<'_>,
    state: &mut AnalysisState,
) -> Result<(), PipelineError> {
    ctx.status("Creating activity layers from pathways");
    ctx.require_layers(state)?;
    let reference = ctx.config.reference_layer().map(Path::to_path_buf);

    for index in 0..state.activities().len() {
        ctx.checkpoint()?;
        let activity = &state.activities()[index];
        let layers: Vec<PathBuf> = activity
            .layer_path()
            .map(Path::to_path_buf)
            .into_iter()
            .chain(state.activity_pathways(activity).map(|p| p.path.clone()))
            .collect();
        let Some(first) = layers.first().cloned() else {
            tracing::warn!(activity = %activity.name, "activity has no layers to compose");
            ctx.skipped();
            continue;
        };
        let name = activity.name.clone();
        let output = ctx.workspace.unique_file(StageDir::Activities, &name, None)?;
        let request = CellStatisticsRequest {
            inputs: layers,
            statistic: Statistic::Sum,
            ignore_nodata: true,
            reference_layer: reference.clone().unwrap_or(first),
            output_nodata: ctx.config.nodata_value,
            extent: Some(ctx.extent.clone()),
            output: OutputTarget::file_or_temporary(ctx.config.save.activities, output),
        };
        tracing::debug!(activity = %name, ?request, "composing activity");
        let path = ctx.call(|g| g.cell_statistics(&request))?;
        if let Some(activity) = state.activities_mut().get_mut(index) {
            activity.path = Some(path);
        }
        ctx.processed();
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::MapSettings;
    use crate::gateway::{GatewayRequest, Operation, RasterGateway};
    use crate::stages::fixture::{Fixture, activity, direct_activity, pathway};

    #[test]
    fn pathways_are_summed_on_the_first_layer_grid() {
        let fx = Fixture::new();
        let grass = fx.raster("grass", None);
        let tree = fx.raster("tree", None);
        let activities = [activity(
            10,
            "Agro forestry",
            vec![pathway(1, "grass", grass.clone()), pathway(2, "tree", tree.clone())],
        )];
        let state = AnalysisState::new(&activities, &MapSettings::new());

        let (state, outcome) = Compose::run(&mut fx.context(), state).unwrap();
        assert_eq!(outcome, StageOutcome::Applied);

        let requests = fx.gateway.requests();
        let GatewayRequest::CellStatistics(request) = &requests[0] else {
            panic!("expected cell statistics");
        };
        assert_eq!(request.inputs, vec![grass.clone(), tree]);
        assert_eq!(request.reference_layer, grass);
        assert_eq!(request.statistic, Statistic::Sum);
        assert!(request.ignore_nodata);
        assert_eq!(request.output_nodata, -9999.0);

        let path = state.activities()[0].path.clone().unwrap();
        assert!(path.starts_with(fx.workspace.root().join("activities")));
        let file = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file.starts_with("Agro_forestry_"), "{file}");
        assert_eq!(fx.gateway.raster_info(&path).unwrap().nodata, Some(-9999.0));
    }

    #[test]
    fn direct_layer_leads_the_stack_and_reference_layer_wins() {
        let mut fx = Fixture::new();
        let reference = fx.raster("reference", None);
        fx.config.snapping_enabled = true;
        fx.config.snap_layer = Some(reference.clone());
        fx.config.save.activities = false;
        let direct = fx.raster("direct", None);
        let state = AnalysisState::new(&[direct_activity(10, "A", direct.clone())], &MapSettings::new());

        let (state, _) = Compose::run(&mut fx.context(), state).unwrap();
        let requests = fx.gateway.requests();
        let GatewayRequest::CellStatistics(request) = &requests[0] else {
            panic!("expected cell statistics");
        };
        assert_eq!(request.inputs, vec![direct]);
        assert_eq!(request.reference_layer, reference);
        assert_eq!(request.output, OutputTarget::Temporary);
        assert!(
            state.activities()[0]
                .path
                .as_deref()
                .unwrap()
                .starts_with(fx.dir.path().join("scratch"))
        );
    }

    #[test]
    fn gateway_failure_aborts() {
        let fx = Fixture::new();
        let grass = fx.raster("grass", None);
        fx.gateway.fail_on(Operation::CellStatistics);
        let state = AnalysisState::new(
            &[activity(10, "A", vec![pathway(1, "grass", grass)])],
            &MapSettings::new(),
        );
        let mut ctx = fx.context();
        ctx.begin(StageKind::Compose);
        assert!(matches!(
            Compose::run(&mut ctx, state),
            Err(PipelineError::Gateway { stage: "compose", .. })
        ));
    }
}
