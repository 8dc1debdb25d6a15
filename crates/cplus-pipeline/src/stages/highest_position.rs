//! Highest-position compositing, the pipeline's final stage.

use std::path::{Path, PathBuf};

use super::{StageContext, StageKind};
use crate::gateway::{HighestPositionRequest, OutputTarget};
use crate::state::AnalysisState;
use crate::types::{Crs, DEFAULT_CRS_ID, PipelineError, ReferencedExtent, ScenarioResult};

pub(crate) const KIND: StageKind = StageKind::HighestPosition;

/// Stack the activities by position and write the final composite.
///
/// Activities are sorted by `style_pixel_value` and renumbered `1..=N`.
/// An activity without its own layer contributes its last pathway. The
/// composite covers the scenario bounding box in the CRS of the first
/// layer of the stack.
pub(crate) fn run(
    ctx: &mut StageContext<'_>,
    mut state: AnalysisState,
) -> Result<(AnalysisState, ScenarioResult), PipelineError> {
    ctx.status("Calculating the highest position");
    state.restack();

    let mut sources: Vec<PathBuf> = Vec::with_capacity(state.activities().len());
    for activity in state.activities() {
        let source = activity
            .layer_path()
            .map(Path::to_path_buf)
            .or_else(|| state.activity_pathways(activity).last().map(|p| p.path.clone()));
        let Some(source) = source else {
            let err = PipelineError::MissingActivityLayer {
                activity: activity.name.clone(),
            };
            ctx.critical(&err.to_string());
            return Err(err);
        };
        sources.push(source);
    }
    let Some(first) = sources.first().cloned() else {
        ctx.critical(&PipelineError::NoActivities.to_string());
        return Err(PipelineError::NoActivities);
    };

    let crs = ctx.raster_info(&first).map(|info| info.crs).unwrap_or_else(|err| {
        tracing::warn!(layer = %first.display(), error = %err, "using the default CRS for the composite");
        Crs::epsg(DEFAULT_CRS_ID)
    });
    let extent = ReferencedExtent {
        extent: ctx.scenario.extent.bbox,
        crs,
    };
    tracing::info!(
        sources = ?sources.iter().filter_map(|s| s.file_stem()).collect::<Vec<_>>(),
        %extent,
        "layer sources for the highest position analysis"
    );

    let request = HighestPositionRequest {
        inputs: sources,
        ignore_nodata: true,
        extent,
        output_nodata: ctx.config.nodata_value,
        reference_layer: Some(first),
        output: OutputTarget::file_or_temporary(
            ctx.config.save.highest_position,
            ctx.workspace.final_output(),
        ),
    };
    let output = ctx.call(|g| g.highest_position(&request))?;

    let result = ScenarioResult::new(
        ctx.scenario.clone(),
        ctx.workspace.root().to_path_buf(),
        output,
        state.to_activities(),
    );
    Ok((state, result))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::MapSettings;
    use crate::gateway::{GatewayRequest, RasterGateway};
    use crate::stages::fixture::{CRS, Fixture, activity, direct_activity, pathway};
    use crate::types::Activity;

    fn positioned(activity: Activity, position: i64) -> Activity {
        Activity {
            style_pixel_value: position,
            ..activity
        }
    }

    #[test]
    fn activities_are_stacked_by_position() {
        let fx = Fixture::new();
        let a = fx.raster("a", None);
        let b = fx.raster("b", None);
        let tree = fx.raster("tree", None);
        let activities = [
            positioned(direct_activity(10, "A", a.clone()), 9),
            positioned(
                activity(
                    11,
                    "B",
                    vec![pathway(1, "grass", b), pathway(2, "tree", tree.clone())],
                ),
                3,
            ),
        ];
        let state = AnalysisState::new(&activities, &MapSettings::new());

        let (state, result) = run(&mut fx.context(), state).unwrap();

        let positions: Vec<_> = state
            .activities()
            .iter()
            .map(|a| (a.name.as_str(), a.style_pixel_value))
            .collect();
        assert_eq!(positions, vec![("B", 1), ("A", 2)]);

        let requests = fx.gateway.requests();
        let GatewayRequest::HighestPosition(request) = &requests[0] else {
            panic!("expected highest position request");
        };
        assert_eq!(request.inputs, vec![tree.clone(), a]);
        assert_eq!(request.reference_layer, Some(tree));
        assert_eq!(request.extent.crs, Crs::epsg(CRS));
        assert_eq!(request.extent.extent, fx.scenario.extent.bbox);

        let expected = fx.workspace.root().join("cplus_scenario_output_abcd.tif");
        assert_eq!(result.output_path(), expected);
        assert_eq!(result.scenario_directory(), fx.workspace.root());
        assert_eq!(result.activities()[0].style_pixel_value, 1);
        assert_eq!(
            fx.gateway.raster_info(&expected).unwrap().nodata,
            Some(-9999.0)
        );
    }

    #[test]
    fn no_activities_fail() {
        let fx = Fixture::new();
        let state = AnalysisState::new(&[], &MapSettings::new());
        assert!(matches!(
            run(&mut fx.context(), state),
            Err(PipelineError::NoActivities)
        ));
    }

    #[test]
    fn unreadable_first_layer_falls_back_to_default_crs() {
        let mut fx = Fixture::new();
        fx.config.save.highest_position = false;
        let ghost = fx.dir.path().join("ghost.tif");
        let b = fx.raster("b", None);
        let activities = [
            positioned(direct_activity(10, "Ghost", ghost.clone()), 1),
            positioned(direct_activity(11, "B", b), 2),
        ];
        let state = AnalysisState::new(&activities, &MapSettings::new());
        let mut ctx = fx.context();
        ctx.begin(StageKind::HighestPosition);
        // The recording gateway rejects the unknown input itself.
        assert!(matches!(
            run(&mut ctx, state),
            Err(PipelineError::Gateway {
                stage: "highest_position",
                ..
            })
        ));
        let requests = fx.gateway.requests();
        let GatewayRequest::HighestPosition(request) = &requests[0] else {
            panic!("expected highest position request");
        };
        assert_eq!(request.extent.crs, Crs::epsg(DEFAULT_CRS_ID));
        assert_eq!(request.output, OutputTarget::Temporary);
        assert_eq!(request.reference_layer, Some(ghost));
    }
}
