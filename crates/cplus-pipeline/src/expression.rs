//! Raster calculator expression builders.
//!
//! Layers are referenced by file stem and band, `"stem@1"`.

use std::fmt;
use std::path::Path;

/// Band-1 reference to the raster at `path`.
#[must_use]
pub fn band_ref(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("\"{stem}@1\"")
}

/// Sum of optionally-weighted layer terms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightedSum {
    terms: Vec<String>,
}

impl WeightedSum {
    /// Empty sum.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `layer` unweighted.
    pub fn push_layer(&mut self, layer: &Path) {
        self.terms.push(format!("({})", band_ref(layer)));
    }

    /// Add `coefficient * layer`.
    pub fn push_weighted(&mut self, coefficient: f64, layer: &Path) {
        self.terms
            .push(format!("({coefficient}*{})", band_ref(layer)));
    }
}

impl fmt::Display for WeightedSum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.terms.join(" + "))
    }
}

/// `1` where the layer is positive, `0` elsewhere.
#[must_use]
pub fn binary_mask(layer: &Path) -> String {
    format!("{} > 0", band_ref(layer))
}

/// Positive cells keep their value, everything else becomes `0`.
#[must_use]
pub fn positive_part(layer: &Path) -> String {
    let r = band_ref(layer);
    format!("({r} > 0) * {r}")
}

/// Cell-wise product of two layers.
#[must_use]
pub fn product(a: &Path, b: &Path) -> String {
    format!("{} * {}", band_ref(a), band_ref(b))
}

/// Positive cells keep their value, everything else becomes `nodata`.
#[must_use]
pub fn zero_to_nodata(layer: &Path, nodata: f64) -> String {
    let r = band_ref(layer);
    format!("({r} > 0) * {r} + ({r} <= 0) * {nodata}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_ref_uses_stem() {
        assert_eq!(band_ref(Path::new("/a/b/forest_1a2b.tif")), "\"forest_1a2b@1\"");
    }

    #[test]
    fn weighted_sum_joins_terms() {
        let mut sum = WeightedSum::new();
        assert_eq!(sum.to_string(), "");
        sum.push_weighted(0.5, Path::new("p/grass.tif"));
        sum.push_weighted(3.0, Path::new("pwl/bio.tif"));
        assert_eq!(sum.to_string(), "(0.5*\"grass@1\") + (3*\"bio@1\")");
    }

    #[test]
    fn unweighted_layer_term() {
        let mut sum = WeightedSum::new();
        sum.push_layer(Path::new("grass.tif"));
        assert_eq!(sum.to_string(), "(\"grass@1\")");
    }

    #[test]
    fn sieve_helper_expressions() {
        let a = Path::new("a.tif");
        let b = Path::new("b.tif");
        assert_eq!(binary_mask(a), "\"a@1\" > 0");
        assert_eq!(positive_part(a), "(\"a@1\" > 0) * \"a@1\"");
        assert_eq!(product(a, b), "\"a@1\" * \"b@1\"");
        assert_eq!(
            zero_to_nodata(a, -9999.0),
            "(\"a@1\" > 0) * \"a@1\" + (\"a@1\" <= 0) * -9999"
        );
    }
}
