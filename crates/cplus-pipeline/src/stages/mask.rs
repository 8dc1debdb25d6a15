//! Exclusion masking of activity rasters.
//!
//! Both stages clip each activity by the symmetric difference of the
//! mask and the processing extent, which removes the masked region.
//! [`ExternalMask`] uses the scenario-wide mask layers and aborts on a
//! bad mask. [`InternalMask`] uses each activity's own masks and only
//! ever skips the activity.

use std::path::{Path, PathBuf};

use super::{Stage, StageContext, StageKind, StageOutcome, exclusion_mask, mask_source};
use crate::gateway::{ClipByMaskRequest, GeometryType, OutputTarget, VectorInfo};
use crate::state::AnalysisState;
use crate::types::PipelineError;
use crate::workspace::StageDir;

pub(crate) struct ExternalMask;

impl Stage for ExternalMask {
    const KIND: StageKind = StageKind::ExternalMask;

    fn skip_reason(ctx: &StageContext<'_>) -> Option<String> {
        ctx.config
            .mask_layers
            .is_empty()
            .then(|| "no mask layers configured".to_string())
    }

    fn run(
        ctx: &mut StageContext<'_>,
        mut state: AnalysisState,
    ) -> Result<(AnalysisState, StageOutcome), PipelineError> {
        ctx.status("Masking activities using the saved mask layers");
        let config = ctx.config;
        let invalid = || {
            let paths: Vec<String> = config
                .mask_layers
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            PipelineError::InvalidMaskLayer(paths.join(","))
        };

        let Some(mask) = mask_source(ctx, &config.mask_layers)? else {
            ctx.critical("None of the configured mask layers is a valid layer");
            return Err(invalid());
        };
        let info = ctx.vector_info(&mask).map_err(|_| invalid())?;
        if info.geometry_type != GeometryType::Polygon {
            ctx.critical(&format!("Mask layer {} is not a polygon layer", mask.display()));
            return Err(PipelineError::NotPolygonMask(mask));
        }

        let difference = exclusion_mask(ctx, &mask)?;
        let difference_info = ctx.vector_info(&difference).map_err(|err| {
            PipelineError::InvalidMaskLayer(format!("{}: {err}", difference.display()))
        })?;

        for index in 0..state.activities().len() {
            ctx.checkpoint()?;
            let activity = &state.activities()[index];
            let name = activity.name.clone();
            let Some(layer) = activity.layer_path().map(Path::to_path_buf) else {
                let err = PipelineError::MissingActivityLayer { activity: name };
                ctx.critical(&format!("Problem when masking activities, {err}"));
                return Err(err);
            };
            let masked = mask_activity(
                ctx,
                &name,
                &layer,
                (&difference, &difference_info),
                StageDir::MaskedActivities,
            )?;
            set_activity_path(ctx, &mut state, index, masked);
        }
        Ok((state, StageOutcome::Applied))
    }
}

pub(crate) struct InternalMask;

impl Stage for InternalMask {
    const KIND: StageKind = StageKind::InternalMask;

    fn run(
        ctx: &mut StageContext<'_>,
        mut state: AnalysisState,
    ) -> Result<(AnalysisState, StageOutcome), PipelineError> {
        ctx.status("Masking activities using their respective mask layers");
        for index in 0..state.activities().len() {
            ctx.checkpoint()?;
            let activity = &state.activities()[index];
            if activity.mask_paths.is_empty() {
                tracing::debug!(activity = %activity.name, "no mask layers for activity");
                continue;
            }
            let name = activity.name.clone();
            let layer = activity.layer_path().map(Path::to_path_buf);
            let masks = activity.mask_paths.clone();

            let masked = match mask_with_own_layers(ctx, &name, layer.as_deref(), &masks) {
                Ok(masked) => masked,
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(err) => {
                    tracing::warn!(activity = %name, error = %err, "skipping activity masking");
                    None
                }
            };
            set_activity_path(ctx, &mut state, index, masked);
        }
        Ok((state, StageOutcome::Applied))
    }
}

fn set_activity_path(
    ctx: &mut StageContext<'_>,
    state: &mut AnalysisState,
    index: usize,
    path: Option<PathBuf>,
) {
    match (path, state.activities_mut().get_mut(index)) {
        (Some(path), Some(activity)) => {
            activity.path = Some(path);
            ctx.processed();
        }
        _ => ctx.skipped(),
    }
}

fn mask_with_own_layers(
    ctx: &mut StageContext<'_>,
    name: &str,
    layer: Option<&Path>,
    masks: &[PathBuf],
) -> Result<Option<PathBuf>, PipelineError> {
    let Some(layer) = layer else {
        ctx.critical(&format!(
            "Problem when masking activity, there is no map layer for the activity {name}"
        ));
        return Ok(None);
    };
    let Some(mask) = mask_source(ctx, masks)? else {
        tracing::warn!(activity = %name, "no valid mask layer for activity");
        return Ok(None);
    };
    let info = match ctx.vector_info(&mask) {
        Ok(info) if info.geometry_type == GeometryType::Polygon => info,
        Ok(_) => {
            tracing::warn!(activity = %name, mask = %mask.display(), "mask is not a polygon layer");
            return Ok(None);
        }
        Err(err) => {
            tracing::warn!(activity = %name, error = %err, "mask layer is not valid");
            return Ok(None);
        }
    };
    if info.crs != ctx.extent.crs {
        tracing::warn!(activity = %name, "mask layer CRS does not match the scenario CRS");
        return Ok(None);
    }
    if !ctx.extent.extent.intersects(&info.extent) {
        tracing::warn!(activity = %name, "mask layer does not overlap the scenario extent");
        return Ok(None);
    }

    let difference = exclusion_mask(ctx, &mask)?;
    let difference_info = match ctx.vector_info(&difference) {
        Ok(info) => info,
        Err(err) => {
            tracing::warn!(activity = %name, error = %err, "difference mask layer is not valid");
            return Ok(None);
        }
    };
    mask_activity(
        ctx,
        name,
        layer,
        (&difference, &difference_info),
        StageDir::FinalMaskedActivities,
    )
}

/// Clip one activity by an exclusion mask, or `None` when the activity
/// cannot be masked by it.
fn mask_activity(
    ctx: &mut StageContext<'_>,
    name: &str,
    layer: &Path,
    (mask, mask_info): (&Path, &VectorInfo),
    dir: StageDir,
) -> Result<Option<PathBuf>, PipelineError> {
    let info = match ctx.raster_info(layer) {
        Ok(info) => info,
        Err(err) => {
            tracing::warn!(activity = %name, error = %err, "activity layer is not valid, skipping masking");
            return Ok(None);
        }
    };
    if info.crs != mask_info.crs {
        tracing::warn!(activity = %name, "activity layer and mask layer have different CRS, skipping masking");
        return Ok(None);
    }
    if !info.extent.intersects(&mask_info.extent) {
        tracing::warn!(activity = %name, "activity layer and mask layer do not overlap, skipping masking");
        return Ok(None);
    }
    let request = ClipByMaskRequest {
        input: layer.to_path_buf(),
        mask: mask.to_path_buf(),
        crs: info.crs,
        target_extent: Some(ctx.extent.clone()),
        nodata: ctx.config.nodata_value,
        crop_to_cutline: false,
        output: OutputTarget::File(ctx.workspace.unique_file(dir, name, None)?),
    };
    tracing::info!(activity = %name, mask = %mask.display(), "masking activity");
    ctx.call(|g| g.clip_by_mask(&request)).map(Some)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::MapSettings;
    use crate::gateway::{GatewayRequest, Operation};
    use crate::stages::fixture::{Fixture, activity, direct_activity, grid, pathway};
    use crate::types::{Crs, Extent};

    fn masked_fixture(geometry: GeometryType) -> (Fixture, PathBuf) {
        let mut fx = Fixture::new();
        let mask = fx.vector("mask", geometry, Extent::new(100.0, 100.0, 300.0, 300.0));
        fx.config.mask_layers = vec![mask.clone()];
        (fx, mask)
    }

    #[test]
    fn skipped_without_mask_layers() {
        let fx = Fixture::new();
        assert!(ExternalMask::skip_reason(&fx.context()).is_some());
        let (fx, _) = masked_fixture(GeometryType::Polygon);
        assert!(ExternalMask::skip_reason(&fx.context()).is_none());
    }

    #[test]
    fn external_mask_removes_the_masked_region() {
        let (fx, mask) = masked_fixture(GeometryType::Polygon);
        let a = fx.raster("a", None);
        let b = fx.raster_in("b", None, Crs::epsg(4326));
        let state = AnalysisState::new(
            &[direct_activity(10, "A", a.clone()), direct_activity(11, "B", b.clone())],
            &MapSettings::new(),
        );

        let (state, _) = ExternalMask::run(&mut fx.context(), state).unwrap();

        assert_eq!(
            fx.gateway.operations(),
            vec![
                Operation::ExtentToLayer,
                Operation::SymmetricDifference,
                Operation::ClipByMask
            ]
        );
        let requests = fx.gateway.requests();
        let GatewayRequest::SymmetricDifference(difference) = &requests[1] else {
            panic!("expected symmetric difference");
        };
        assert_eq!(difference.input, mask);
        let GatewayRequest::ClipByMask(clip) = &requests[2] else {
            panic!("expected clip by mask");
        };
        assert_eq!(clip.input, a);
        assert_ne!(clip.mask, mask);
        assert_eq!(clip.target_extent.as_ref(), Some(&fx.extent));
        assert!(!clip.crop_to_cutline);

        let masked = state.activities()[0].path.as_deref().unwrap();
        assert!(masked.starts_with(fx.workspace.root().join("masked_activities")));
        // CRS mismatch: left alone.
        assert_eq!(state.activities()[1].path.as_deref(), Some(b.as_path()));
    }

    #[test]
    fn external_mask_rejects_bad_masks() {
        let (fx, _) = masked_fixture(GeometryType::Line);
        let a = fx.raster("a", None);
        let state = AnalysisState::new(&[direct_activity(10, "A", a)], &MapSettings::new());
        assert!(matches!(
            ExternalMask::run(&mut fx.context(), state),
            Err(PipelineError::NotPolygonMask(_))
        ));

        let mut fx = Fixture::new();
        fx.config.mask_layers = vec![fx.dir.path().join("gone.shp")];
        let a = fx.raster("a", None);
        let state = AnalysisState::new(&[direct_activity(10, "A", a)], &MapSettings::new());
        assert!(matches!(
            ExternalMask::run(&mut fx.context(), state),
            Err(PipelineError::InvalidMaskLayer(_))
        ));
    }

    #[test]
    fn external_mask_needs_activity_layers() {
        let (fx, _) = masked_fixture(GeometryType::Polygon);
        let grass = fx.raster("grass", None);
        let state = AnalysisState::new(
            &[activity(10, "Uncomposed", vec![pathway(1, "grass", grass)])],
            &MapSettings::new(),
        );
        assert!(matches!(
            ExternalMask::run(&mut fx.context(), state),
            Err(PipelineError::MissingActivityLayer { activity }) if activity == "Uncomposed"
        ));
    }

    #[test]
    fn internal_masks_apply_per_activity_and_failures_skip() {
        let fx = Fixture::new();
        let mask = fx.vector("own", GeometryType::Polygon, grid());
        let points = fx.vector("points", GeometryType::Point, grid());
        let a = fx.raster("a", None);
        let b = fx.raster("b", None);
        let c = fx.raster("c", None);

        let mut masked = direct_activity(10, "A", a);
        masked.mask_paths = vec![mask];
        let mut bad = direct_activity(11, "B", b.clone());
        bad.mask_paths = vec![points];
        let plain = direct_activity(12, "C", c.clone());
        let state = AnalysisState::new(&[masked, bad, plain], &MapSettings::new());

        let (state, outcome) = InternalMask::run(&mut fx.context(), state).unwrap();
        assert_eq!(outcome, StageOutcome::Applied);
        assert!(
            state.activities()[0]
                .path
                .as_deref()
                .unwrap()
                .starts_with(fx.workspace.root().join("final_masked_activities"))
        );
        assert_eq!(state.activities()[1].path.as_deref(), Some(b.as_path()));
        assert_eq!(state.activities()[2].path.as_deref(), Some(c.as_path()));
        assert_eq!(fx.gateway.count(Operation::ClipByMask), 1);
    }

    #[test]
    fn internal_mask_gateway_failure_only_skips() {
        let fx = Fixture::new();
        let mask = fx.vector("own", GeometryType::Polygon, grid());
        let a = fx.raster("a", None);
        let mut masked = direct_activity(10, "A", a.clone());
        masked.mask_paths = vec![mask];
        fx.gateway.fail_on(Operation::SymmetricDifference);
        let state = AnalysisState::new(&[masked], &MapSettings::new());

        let (state, _) = InternalMask::run(&mut fx.context(), state).unwrap();
        assert_eq!(state.activities()[0].path.as_deref(), Some(a.as_path()));

        fx.cancel.cancel();
        assert!(matches!(
            InternalMask::run(&mut fx.context(), state),
            Err(PipelineError::Cancelled)
        ));
    }
}
