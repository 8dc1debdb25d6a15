//! Clipping of pathways and priority layers to the study area.

use std::path::{Path, PathBuf};

use super::{Stage, StageContext, StageKind, StageOutcome, degrade};
use crate::gateway::{ClipByMaskRequest, OutputTarget};
use crate::state::AnalysisState;
use crate::types::{Pathway, PipelineError};
use crate::workspace::StageDir;

pub(crate) struct Clip;

impl Stage for Clip {
    const KIND: StageKind = StageKind::Clip;

    fn skip_reason(ctx: &StageContext<'_>) -> Option<String> {
        match ctx.study_area {
            None => Some("no study area".to_string()),
            Some(path) if !path.exists() => {
                Some(format!("study area {} does not exist", path.display()))
            }
            Some(_) => None,
        }
    }

    fn run(
        ctx: &mut StageContext<'_>,
        mut state: AnalysisState,
    ) -> Result<(AnalysisState, StageOutcome), PipelineError> {
        let Some(study_area) = ctx.study_area.map(Path::to_path_buf) else {
            return Ok((state, StageOutcome::skipped("no study area")));
        };
        if let Err(err) = ctx.vector_info(&study_area) {
            let message = format!("{err}, skipping clipping of activity pathways and priority layers");
            ctx.critical(&message);
            return Err(PipelineError::InvalidMaskLayer(study_area.display().to_string()));
        }

        ctx.status("Clipping the activity pathways and priority layers by the study area layer");
        ctx.require_layers(&state)?;

        state.try_for_each_pathway(|pathway| clip_pathway(ctx, pathway, &study_area))?;
        Ok((state, StageOutcome::Applied))
    }
}

fn clip_pathway(
    ctx: &mut StageContext<'_>,
    pathway: &mut Pathway,
    study_area: &Path,
) -> Result<(), PipelineError> {
    ctx.checkpoint()?;
    let source = pathway.path.clone();
    match clip_layer(ctx, &source, study_area, StageDir::ClippedPathways)? {
        Clipped::Done(path) => {
            pathway.path = path;
            ctx.processed();
        }
        Clipped::Kept => ctx.skipped(),
        Clipped::Invalid => {
            tracing::warn!(pathway = %pathway.name, "pathway layer is not valid, skipping clipping");
            ctx.skipped();
        }
    }

    let mut kept = Vec::with_capacity(pathway.priority_layers.len());
    for mut layer in std::mem::take(&mut pathway.priority_layers) {
        let Some(source) = layer.existing_path().map(Path::to_path_buf) else {
            kept.push(layer);
            continue;
        };
        ctx.checkpoint()?;
        match clip_layer(ctx, &source, study_area, StageDir::ClippedPriorityLayers)? {
            Clipped::Done(path) => layer.path = Some(path),
            Clipped::Kept => {}
            Clipped::Invalid => {
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

enum Clipped {
    Done(PathBuf),
    Kept,
    Invalid,
}

fn clip_layer(
    ctx: &mut StageContext<'_>,
    source: &Path,
    study_area: &Path,
    dir: StageDir,
) -> Result<Clipped, PipelineError> {
    let Ok(info) = ctx.raster_info(source) else {
        return Ok(Clipped::Invalid);
    };
    let output = ctx.workspace.scenario_file(dir, source)?;
    let request = ClipByMaskRequest {
        input: source.to_path_buf(),
        mask: study_area.to_path_buf(),
        crs: info.crs,
        target_extent: None,
        nodata: ctx.config.nodata_value,
        crop_to_cutline: true,
        output: OutputTarget::File(output.clone()),
    };
    let result = ctx.call(|g| g.clip_by_mask(&request));
    match degrade(result, source)? {
        Some(path) => Ok(Clipped::Done(path)),
        None => {
            if let Err(err) = std::fs::remove_file(&output) {
                tracing::debug!(path = %output.display(), error = %err, "could not remove unused output file");
            }
            Ok(Clipped::Kept)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::MapSettings;
    use crate::gateway::{GatewayRequest, GeometryType, Operation};
    use crate::stages::fixture::{Fixture, activity, grid, pathway};
    use uuid::Uuid;

    #[test]
    fn invalid_study_area_aborts() {
        let fx = Fixture::new();
        let bogus = fx.dir.path().join("area.shp");
        std::fs::write(&bogus, b"").unwrap();
        let grass = fx.raster("grass", None);
        let state = AnalysisState::new(
            &[activity(10, "A", vec![pathway(1, "grass", grass)])],
            &MapSettings::new(),
        );
        let mut ctx = fx.context().with_study_area(Some(&bogus));
        assert!(Clip::skip_reason(&ctx).is_none());
        assert!(matches!(
            Clip::run(&mut ctx, state),
            Err(PipelineError::InvalidMaskLayer(_))
        ));
    }

    #[test]
    fn pathways_are_clipped_and_failures_keep_the_path() {
        let fx = Fixture::new();
        let area = fx.vector("area", GeometryType::Polygon, grid());
        let grass = fx.raster("grass", None);
        let tree = fx.raster("tree", None);
        let activities = [activity(
            10,
            "A",
            vec![pathway(1, "grass", grass), pathway(2, "tree", tree)],
        )];
        let state = AnalysisState::new(&activities, &MapSettings::new());

        let mut ctx = fx.context().with_study_area(Some(&area));
        let (state, _) = Clip::run(&mut ctx, state).unwrap();
        let clipped = &state.pathway(&Uuid::from_u128(1)).unwrap().path;
        assert_eq!(
            clipped,
            &fx.workspace.root().join("clipped_pathways").join("grass_abcd.tif")
        );
        let requests = fx.gateway.requests();
        assert_eq!(requests.len(), 2);
        let GatewayRequest::ClipByMask(request) = &requests[0] else {
            unreachable!();
        };
        assert!(request.crop_to_cutline);
        assert_eq!(request.mask, area);

        fx.gateway.fail_on(Operation::ClipByMask);
        let before = state.pathway(&Uuid::from_u128(2)).unwrap().path.clone();
        let (state, _) = Clip::run(&mut ctx, state).unwrap();
        assert_eq!(state.pathway(&Uuid::from_u128(2)).unwrap().path, before);
    }

    #[test]
    fn pathways_sharing_a_file_name_are_clipped_apart() {
        let fx = Fixture::new();
        let area = fx.vector("area", GeometryType::Polygon, grid());
        let first = fx.raster("a/grass", None);
        let second = fx.raster("b/grass", None);
        let activities = [activity(
            10,
            "A",
            vec![pathway(1, "grass", first), pathway(2, "grass", second)],
        )];
        let state = AnalysisState::new(&activities, &MapSettings::new());

        let mut ctx = fx.context().with_study_area(Some(&area));
        let (state, _) = Clip::run(&mut ctx, state).unwrap();

        let first = &state.pathway(&Uuid::from_u128(1)).unwrap().path;
        let second = &state.pathway(&Uuid::from_u128(2)).unwrap().path;
        assert_ne!(first, second);
        let dir = fx.workspace.root().join("clipped_pathways");
        assert!(first.starts_with(&dir) && second.starts_with(&dir));
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 2);
    }

    #[test]
    fn failed_clip_leaves_no_output_behind() {
        let fx = Fixture::new();
        let area = fx.vector("area", GeometryType::Polygon, grid());
        let grass = fx.raster("grass", None);
        let state = AnalysisState::new(
            &[activity(10, "A", vec![pathway(1, "grass", grass.clone())])],
            &MapSettings::new(),
        );
        fx.gateway.fail_on(Operation::ClipByMask);

        let mut ctx = fx.context().with_study_area(Some(&area));
        let (state, _) = Clip::run(&mut ctx, state).unwrap();

        assert_eq!(state.pathway(&Uuid::from_u128(1)).unwrap().path, grass);
        let dir = fx.workspace.root().join("clipped_pathways");
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 0);
    }

    #[test]
    fn missing_study_area_is_skipped() {
        let fx = Fixture::new();
        let ctx = fx.context();
        assert!(Clip::skip_reason(&ctx).is_some());
        let missing = fx.dir.path().join("nowhere.shp");
        let ctx = fx.context().with_study_area(Some(&missing));
        assert!(Clip::skip_reason(&ctx).is_some());
    }
}
