//! Constant-mass population fallback.
//!
//! Used when no raster is supplied: every cell receives the same mass, so
//! the gap score is driven by competition alone.

use geo::Polygon;

use crate::{RasterError, RasterSource};

/// A raster that reports one pixel of `value` for any footprint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformRaster {
    value: f64,
}

impl UniformRaster {
    /// Creates a uniform source. Non-finite or negative values fall back to
    /// `0.0`.
    #[must_use]
    pub fn new(value: f64) -> Self {
        let value = if value.is_finite() && value >= 0.0 {
            value
        } else {
            0.0
        };
        Self { value }
    }
}

impl RasterSource for UniformRaster {
    fn read_masked(&self, _footprint: &Polygon<f64>) -> Result<Vec<f64>, RasterError> {
        Ok(vec![self.value])
    }

    fn nodata(&self) -> Option<f64> {
        None
    }
}
