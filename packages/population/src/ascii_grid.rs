//! ESRI ASCII grid population rasters in geographic coordinates.
//!
//! The header is a run of `key value` pairs (`ncols`, `nrows`,
//! `xllcorner`/`xllcenter`, `yllcorner`/`yllcenter`, `cellsize`, optional
//! `nodata_value`) followed by `nrows * ncols` values, row-major from the
//! north edge. Coordinates are WGS84 degrees, so footprints need no
//! reprojection.

use std::collections::BTreeMap;
use std::path::Path;

use geo::{BoundingRect as _, Contains as _, Polygon};

use crate::{RasterError, RasterSource};

const HEADER_KEYS: &[&str] = &[
    "ncols",
    "nrows",
    "xllcorner",
    "xllcenter",
    "yllcorner",
    "yllcenter",
    "cellsize",
    "nodata_value",
];

/// An in-memory north-up raster with square pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct GridRaster {
    ncols: usize,
    nrows: usize,
    /// West edge (longitude of the left pixel boundary).
    west: f64,
    /// North edge (latitude of the top pixel boundary).
    north: f64,
    cell_size: f64,
    nodata: Option<f64>,
    values: Vec<f64>,
}

impl GridRaster {
    /// Builds a raster from its lower-left corner and row-major values
    /// (first row is the northernmost).
    ///
    /// # Errors
    ///
    /// Returns [`RasterError::Parse`] if the dimensions are zero or their
    /// product overflows, the pixel size is not positive, or `values` has
    /// the wrong length.
    pub fn new(
        ncols: usize,
        nrows: usize,
        xll_corner: f64,
        yll_corner: f64,
        cell_size: f64,
        nodata: Option<f64>,
        values: Vec<f64>,
    ) -> Result<Self, RasterError> {
        if ncols == 0 || nrows == 0 {
            return Err(parse_error("raster must have at least one row and column"));
        }
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(parse_error(format!("invalid cellsize {cell_size}")));
        }
        if !(xll_corner.is_finite() && yll_corner.is_finite()) {
            return Err(parse_error("raster origin must be finite"));
        }
        let expected = ncols
            .checked_mul(nrows)
            .ok_or_else(|| parse_error(format!("a {ncols}x{nrows} grid is too large")))?;
        if values.len() != expected {
            return Err(parse_error(format!(
                "expected {expected} values for a {ncols}x{nrows} grid, found {}",
                values.len()
            )));
        }

        #[allow(clippy::cast_precision_loss)]
        let north = (nrows as f64).mul_add(cell_size, yll_corner);

        Ok(Self {
            ncols,
            nrows,
            west: xll_corner,
            north,
            cell_size,
            nodata,
            values,
        })
    }

    /// Parses the contents of an ESRI ASCII grid.
    ///
    /// # Errors
    ///
    /// Returns [`RasterError::Parse`] for missing header keys, unparsable
    /// numbers, or a value count that does not match the header.
    pub fn parse_ascii(content: &str) -> Result<Self, RasterError> {
        let mut tokens = content.split_whitespace().peekable();
        let mut header: BTreeMap<String, f64> = BTreeMap::new();

        while let Some(token) = tokens.peek() {
            let key = token.to_ascii_lowercase();
            if !HEADER_KEYS.contains(&key.as_str()) {
                break;
            }
            tokens.next();
            let raw = tokens
                .next()
                .ok_or_else(|| parse_error(format!("header '{key}' has no value")))?;
            let value = raw
                .parse::<f64>()
                .map_err(|e| parse_error(format!("header '{key}' value '{raw}': {e}")))?;
            header.insert(key, value);
        }

        let ncols = dimension(&header, "ncols")?;
        let nrows = dimension(&header, "nrows")?;
        let cell_size = required(&header, "cellsize")?;
        let half = cell_size / 2.0;

        let xll = match (header.get("xllcorner"), header.get("xllcenter")) {
            (Some(&corner), _) => corner,
            (None, Some(&center)) => center - half,
            (None, None) => return Err(parse_error("missing header 'xllcorner'")),
        };
        let yll = match (header.get("yllcorner"), header.get("yllcenter")) {
            (Some(&corner), _) => corner,
            (None, Some(&center)) => center - half,
            (None, None) => return Err(parse_error("missing header 'yllcorner'")),
        };

        let values = tokens
            .map(|raw| {
                raw.parse::<f64>()
                    .map_err(|e| parse_error(format!("pixel value '{raw}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(
            ncols,
            nrows,
            xll,
            yll,
            cell_size,
            header.get("nodata_value").copied(),
            values,
        )
    }

    /// Reads and parses an ESRI ASCII grid file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_ascii(path: &Path) -> Result<Self, RasterError> {
        let content = std::fs::read_to_string(path)?;
        let raster = Self::parse_ascii(&content)?;
        log::info!(
            "Loaded {}x{} population raster from {} (cellsize {})",
            raster.ncols,
            raster.nrows,
            path.display(),
            raster.cell_size
        );
        Ok(raster)
    }

    /// Pixel value at `(row, col)`, rows counted from the north edge.
    #[must_use]
    pub fn value(&self, row: usize, col: usize) -> Option<f64> {
        (row < self.nrows && col < self.ncols).then(|| self.values[row * self.ncols + col])
    }

    /// Center of pixel `(row, col)` as `(lon, lat)`.
    #[allow(clippy::cast_precision_loss)]
    fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let lon = (col as f64 + 0.5).mul_add(self.cell_size, self.west);
        let lat = (row as f64 + 0.5).mul_add(-self.cell_size, self.north);
        (lon, lat)
    }

    /// Clamps a fractional pixel offset to `0..=limit`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn clamp_index(offset: f64, limit: usize) -> usize {
        if offset <= 0.0 {
            0
        } else if offset >= limit as f64 {
            limit
        } else {
            offset as usize
        }
    }
}

impl RasterSource for GridRaster {
    fn read_masked(&self, footprint: &Polygon<f64>) -> Result<Vec<f64>, RasterError> {
        let Some(rect) = footprint.bounding_rect() else {
            return Ok(Vec::new());
        };

        let size = self.cell_size;
        let col_start = Self::clamp_index(((rect.min().x - self.west) / size).floor(), self.ncols);
        let col_end = Self::clamp_index(((rect.max().x - self.west) / size).ceil(), self.ncols);
        let row_start = Self::clamp_index(((self.north - rect.max().y) / size).floor(), self.nrows);
        let row_end = Self::clamp_index(((self.north - rect.min().y) / size).ceil(), self.nrows);

        let mut values = Vec::new();
        for row in row_start..row_end {
            for col in col_start..col_end {
                let (lon, lat) = self.pixel_center(row, col);
                if footprint.contains(&geo::Point::new(lon, lat)) {
                    values.push(self.values[row * self.ncols + col]);
                }
            }
        }

        Ok(values)
    }

    fn nodata(&self) -> Option<f64> {
        self.nodata
    }
}

fn parse_error(message: impl Into<String>) -> RasterError {
    RasterError::Parse {
        message: message.into(),
    }
}

fn required(header: &BTreeMap<String, f64>, key: &str) -> Result<f64, RasterError> {
    header
        .get(key)
        .copied()
        .ok_or_else(|| parse_error(format!("missing header '{key}'")))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn dimension(header: &BTreeMap<String, f64>, key: &str) -> Result<usize, RasterError> {
    let value = required(header, key)?;
    if value.fract() != 0.0 || value < 1.0 {
        return Err(parse_error(format!(
            "header '{key}' must be a positive integer, got {value}"
        )));
    }
    if value > f64::from(u32::MAX) {
        return Err(parse_error(format!("header '{key}' is too large, got {value}")));
    }
    Ok(value as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    const SAMPLE: &str = "\
ncols 4
nrows 3
xllcorner 77.0
yllcorner 12.0
cellsize 0.5
NODATA_value -9999
1 2 3 4
5 -9999 7 8
9 10 11 12
";

    #[test]
    fn parses_header_and_values() {
        let raster = GridRaster::parse_ascii(SAMPLE).unwrap();
        assert_eq!(raster.nodata(), Some(-9999.0));
        assert_eq!(raster.value(0, 0), Some(1.0));
        assert_eq!(raster.value(1, 1), Some(-9999.0));
        assert_eq!(raster.value(2, 3), Some(12.0));
        assert_eq!(raster.value(3, 0), None);
        assert!((raster.north - 13.5).abs() < 1e-12);
    }

    #[test]
    fn center_origin_shifts_by_half_a_pixel() {
        let content = SAMPLE
            .replace("xllcorner 77.0", "xllcenter 77.25")
            .replace("yllcorner 12.0", "yllcenter 12.25");
        let centered = GridRaster::parse_ascii(&content).unwrap();
        assert_eq!(centered, GridRaster::parse_ascii(SAMPLE).unwrap());
    }

    #[test]
    fn rejects_wrong_value_count() {
        let truncated = SAMPLE.replace("9 10 11 12\n", "9 10\n");
        assert!(matches!(
            GridRaster::parse_ascii(&truncated),
            Err(RasterError::Parse { .. })
        ));
    }

    #[test]
    fn rejects_dimensions_that_overflow() {
        let huge =
            "ncols 10000000000\nnrows 10000000000\nxllcorner 0\nyllcorner 0\ncellsize 1\n1\n";
        assert!(matches!(
            GridRaster::parse_ascii(huge),
            Err(RasterError::Parse { .. })
        ));

        let wide = "ncols 1e300\nnrows 1\nxllcorner 0\nyllcorner 0\ncellsize 1\n1\n";
        assert!(matches!(
            GridRaster::parse_ascii(wide),
            Err(RasterError::Parse { .. })
        ));
    }

    #[test]
    fn new_rejects_dimension_product_overflow() {
        assert!(matches!(
            GridRaster::new(usize::MAX, 2, 0.0, 0.0, 1.0, None, vec![1.0]),
            Err(RasterError::Parse { .. })
        ));
    }

    #[test]
    fn rejects_missing_header() {
        let headless = SAMPLE.replace("cellsize 0.5\n", "");
        assert!(GridRaster::parse_ascii(&headless).is_err());
    }

    #[test]
    fn nan_values_are_data_not_headers() {
        let content = "ncols 2\nnrows 1\nxllcorner 0\nyllcorner 0\ncellsize 1\nnan 3\n";
        let raster = GridRaster::parse_ascii(content).unwrap();
        assert!(raster.value(0, 0).unwrap().is_nan());
        assert_eq!(raster.value(0, 1), Some(3.0));
    }

    #[test]
    fn masks_to_pixel_centers_inside_footprint() {
        let raster = GridRaster::parse_ascii(SAMPLE).unwrap();

        // Covers the centers of the two west-most pixels of the top row.
        let footprint = polygon![
            (x: 77.1, y: 13.1),
            (x: 77.9, y: 13.1),
            (x: 77.9, y: 13.4),
            (x: 77.1, y: 13.4),
        ];
        let mut values = raster.read_masked(&footprint).unwrap();
        values.sort_by(f64::total_cmp);
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[test]
    fn footprint_outside_raster_reads_nothing() {
        let raster = GridRaster::parse_ascii(SAMPLE).unwrap();
        let footprint = polygon![
            (x: 80.0, y: 20.0),
            (x: 81.0, y: 20.0),
            (x: 81.0, y: 21.0),
        ];
        assert!(raster.read_masked(&footprint).unwrap().is_empty());
    }

    #[test]
    fn full_cover_includes_nodata_for_the_aggregator_to_drop() {
        let raster = GridRaster::parse_ascii(SAMPLE).unwrap();
        let footprint = polygon![
            (x: 76.9, y: 11.9),
            (x: 79.1, y: 11.9),
            (x: 79.1, y: 13.6),
            (x: 76.9, y: 13.6),
        ];
        let values = raster.read_masked(&footprint).unwrap();
        assert_eq!(values.len(), 12);
        assert!((crate::sum_valid(&values, raster.nodata()) - 72.0).abs() < 1e-9);
    }
}
