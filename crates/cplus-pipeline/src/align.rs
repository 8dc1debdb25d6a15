//! Extent alignment: snap an extent outward onto a reference pixel grid.
//!
//! The aligned extent contains the target extent and each of its edges
//! lies on a grid line through the reference raster's origin. Left and
//! bottom edges round down, the right edge rounds up, and the top edge
//! is measured from the reference raster's own top edge and rounded down
//! in that direction.

use crate::gateway::RasterInfo;
use crate::types::Extent;

/// Why an extent could not be aligned.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlignmentError {
    /// The reference pixel size is zero, negative, or not finite.
    #[error("invalid reference resolution {x_res} x {y_res}")]
    InvalidResolution {
        /// Horizontal pixel size.
        x_res: f64,
        /// Vertical pixel size.
        y_res: f64,
    },

    /// One of the extents has non-finite bounds.
    #[error("extent has non-finite bounds")]
    NonFiniteExtent,
}

/// Snap `target` to the pixel grid of a reference raster.
///
/// # Errors
///
/// Returns [`AlignmentError`] when the resolution or any bound is
/// unusable.
pub fn try_align_extent(
    reference: &Extent,
    x_res: f64,
    y_res: f64,
    target: &Extent,
) -> Result<Extent, AlignmentError> {
    if !(x_res.is_finite() && y_res.is_finite() && x_res > 0.0 && y_res > 0.0) {
        return Err(AlignmentError::InvalidResolution { x_res, y_res });
    }
    let bounds = [
        reference.xmin,
        reference.ymin,
        reference.xmax,
        reference.ymax,
        target.xmin,
        target.ymin,
        target.xmax,
        target.ymax,
    ];
    if bounds.iter().any(|v| !v.is_finite()) {
        return Err(AlignmentError::NonFiniteExtent);
    }

    let left = x_res.mul_add(((target.xmin - reference.xmin) / x_res).floor(), reference.xmin);
    let right = x_res.mul_add(((target.xmax - reference.xmin) / x_res).ceil(), reference.xmin);
    let bottom = y_res.mul_add(((target.ymin - reference.ymin) / y_res).floor(), reference.ymin);
    let top = (-y_res).mul_add(((reference.ymax - target.ymax) / y_res).floor(), reference.ymax);

    Ok(Extent::new(left, bottom, right, top))
}

/// Snap `target` to the grid of `reference`, falling back to `target`
/// unchanged (with a warning) when alignment is impossible.
#[must_use]
pub fn align_extent(reference: &RasterInfo, target: &Extent) -> Extent {
    match try_align_extent(
        &reference.extent,
        reference.pixel_size_x,
        reference.pixel_size_y,
        target,
    ) {
        Ok(aligned) => aligned,
        Err(err) => {
            tracing::warn!(
                error = %err,
                "problem snapping area of interest extent, using the original extent"
            );
            *target
        }
    }
}
