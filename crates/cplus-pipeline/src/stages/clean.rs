//! Value cleaning: a single-layer sum that turns zero cells into no-data.

use std::path::Path;

use super::{Stage, StageContext, StageKind, StageOutcome};
use crate::gateway::{CellStatisticsRequest, OutputTarget, Statistic};
use crate::state::AnalysisState;
use crate::types::PipelineError;
use crate::workspace::StageDir;

/// No-data value of cleaned activities.
const CLEANED_NODATA: f64 = 0.0;

pub(crate) struct Clean;

impl Stage for Clean {
    const KIND: StageKind = StageKind::Clean;

    fn run(
        ctx: &mut StageContext<'_>,
        mut state: AnalysisState,
    ) -> Result<(AnalysisState, StageOutcome), PipelineError> {
        ctx.status("Updating activity values");
        ctx.require_layers(&state)?;

        for index in 0..state.activities().len() {
            ctx.checkpoint()?;
            let activity = &state.activities()[index];
            let name = activity.name.clone();
            let Some(layer) = activity.layer_path().map(Path::to_path_buf) else {
                let err = PipelineError::MissingActivityLayer { activity: name };
                ctx.critical(&format!("Problem when running activity updates, {err}"));
                return Err(err);
            };
            let file = ctx
                .workspace
                .unique_file(StageDir::WeightedPathways, &name, Some("cleaned"))?;
            let request = CellStatisticsRequest {
                inputs: vec![layer.clone()],
                statistic: Statistic::Sum,
                ignore_nodata: true,
                reference_layer: layer,
                output_nodata: CLEANED_NODATA,
                extent: Some(ctx.extent.clone()),
                output: OutputTarget::file_or_temporary(ctx.config.save.cleaned_activities, file),
            };
            let cleaned = ctx.call(|g| g.cell_statistics(&request))?;
            if let Some(activity) = state.activities_mut().get_mut(index) {
                activity.path = Some(cleaned);
            }
            ctx.processed();
        }
        Ok((state, StageOutcome::Applied))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::MapSettings;
    use crate::gateway::{GatewayRequest, RasterGateway};
    use crate::stages::fixture::{Fixture, activity, direct_activity, pathway};

    #[test]
    fn zero_becomes_nodata() {
        let fx = Fixture::new();
        let layer = fx.raster("a", Some(-9999.0));
        let state = AnalysisState::new(&[direct_activity(10, "Land use", layer.clone())], &MapSettings::new());

        let (state, _) = Clean::run(&mut fx.context(), state).unwrap();

        let requests = fx.gateway.requests();
        let GatewayRequest::CellStatistics(request) = &requests[0] else {
            panic!("expected cell statistics");
        };
        assert_eq!(request.inputs, vec![layer.clone()]);
        assert_eq!(request.reference_layer, layer);
        assert!(request.ignore_nodata);

        let cleaned = state.activities()[0].path.clone().unwrap();
        assert!(cleaned.starts_with(fx.workspace.root().join("weighted_pathways")));
        let file = cleaned.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file.starts_with("Land_use_") && file.ends_with("_cleaned.tif"), "{file}");
        assert_eq!(fx.gateway.raster_info(&cleaned).unwrap().nodata, Some(0.0));
    }

    #[test]
    fn uncomposed_activity_aborts() {
        let fx = Fixture::new();
        let grass = fx.raster("grass", None);
        let state = AnalysisState::new(
            &[activity(10, "A", vec![pathway(1, "grass", grass)])],
            &MapSettings::new(),
        );
        let err = Clean::run(&mut fx.context(), state).unwrap_err();
        assert!(matches!(err, PipelineError::MissingActivityLayer { .. }));
        assert!(fx.gateway.requests().is_empty());
    }
}
