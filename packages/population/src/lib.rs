#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Per-cell population aggregation.
//!
//! For every cell of a [`CellSet`], masks a population raster to the cell's
//! footprint and sums the valid pixel values. The raster itself sits behind
//! the [`RasterSource`] trait; this crate ships an ESRI ASCII grid reader
//! ([`GridRaster`]) and a constant fallback ([`UniformRaster`]).
//!
//! Reads are blocking, so each one runs on tokio's blocking pool with a
//! timeout. A failed or timed-out read leaves that cell at `0.0` and marks
//! it degraded; it never aborts the other cells.

pub mod ascii_grid;
pub mod uniform;

pub use ascii_grid::GridRaster;
pub use uniform::UniformRaster;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt as _};
use geo::Polygon;
use site_gap_grid::{Cell, CellSet};
use site_gap_models::ReasonCode;
use site_gap_models::cancel::CancelToken;
use site_gap_models::config::PopulationConfig;
use site_gap_models::progress::ProgressCallback;
use thiserror::Error;

/// Errors a [`RasterSource`] can report for a single read.
#[derive(Debug, Error)]
pub enum RasterError {
    /// The raster file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The raster file is malformed.
    #[error("Parse error: {message}")]
    Parse {
        /// Description of what went wrong.
        message: String,
    },

    /// The source failed to produce pixels for a footprint.
    #[error("Read error: {message}")]
    Read {
        /// Description of what went wrong.
        message: String,
    },
}

/// Errors that abort a whole aggregation.
#[derive(Debug, Error)]
pub enum AggregationError {
    /// The run was cancelled before every cell was read.
    #[error("Population aggregation cancelled")]
    Cancelled,
}

/// A population raster that can be masked by a geographic footprint.
///
/// Implementations receive the footprint in WGS84 (`x = lon`, `y = lat`)
/// and are responsible for projecting it into their native CRS.
///
/// Each read runs on tokio's blocking pool. When the aggregator's read
/// timeout fires, the cell is marked degraded but the blocking call is not
/// interrupted and keeps its pool thread until it returns, outside the
/// `read_concurrency` limit. Implementations backed by slow or remote
/// storage must bound their own read time.
pub trait RasterSource: Send + Sync {
    /// Returns the raw values of every pixel whose center lies strictly
    /// inside `footprint`. Nodata and NaN pixels may be included; the
    /// aggregator filters them using [`Self::nodata`].
    ///
    /// # Errors
    ///
    /// Returns a [`RasterError`] if the pixels cannot be read.
    fn read_masked(&self, footprint: &Polygon<f64>) -> Result<Vec<f64>, RasterError>;

    /// The value this raster uses to mark missing pixels, if any. NaN is
    /// always treated as missing.
    fn nodata(&self) -> Option<f64>;
}

/// Read scheduling for [`aggregate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateOptions {
    /// Per-cell read timeout.
    pub read_timeout: Duration,
    /// Maximum number of reads in flight.
    pub concurrency: usize,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self::from(&PopulationConfig::default())
    }
}

impl From<&PopulationConfig> for AggregateOptions {
    fn from(config: &PopulationConfig) -> Self {
        Self {
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            concurrency: config.read_concurrency.max(1),
        }
    }
}

/// Summed raster mass per cell.
///
/// Holds exactly one entry per cell of the aggregated [`CellSet`]. Cells
/// whose read failed hold `0.0` and are listed in [`Self::degraded`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PopulationTable {
    values: BTreeMap<Cell, f64>,
    degraded: BTreeMap<Cell, ReasonCode>,
}

impl PopulationTable {
    /// Builds a table from known values with no degraded cells. Negative
    /// and non-finite values are clamped to `0.0`.
    #[must_use]
    pub fn from_values(values: impl IntoIterator<Item = (Cell, f64)>) -> Self {
        Self {
            values: values
                .into_iter()
                .map(|(cell, value)| (cell, non_negative(value)))
                .collect(),
            degraded: BTreeMap::new(),
        }
    }

    /// Population of `cell`, `0.0` if it is not in the table.
    #[must_use]
    pub fn get(&self, cell: &Cell) -> f64 {
        self.values.get(cell).copied().unwrap_or(0.0)
    }

    /// All values keyed by cell.
    #[must_use]
    pub const fn values(&self) -> &BTreeMap<Cell, f64> {
        &self.values
    }

    /// Cells whose read failed, with the reason.
    #[must_use]
    pub const fn degraded(&self) -> &BTreeMap<Cell, ReasonCode> {
        &self.degraded
    }

    /// Sum over every cell.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.values.values().sum()
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the table has no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

enum CellRead {
    Sum(f64),
    Failed(ReasonCode),
    Cancelled,
}

/// Aggregates `raster` over every cell of `cells`.
///
/// # Errors
///
/// Returns [`AggregationError::Cancelled`] if `cancel` fires before the
/// last cell is read. No partial table is returned in that case.
pub async fn aggregate(
    cells: &CellSet,
    raster: Arc<dyn RasterSource>,
    options: AggregateOptions,
    cancel: &CancelToken,
    progress: &Arc<dyn ProgressCallback>,
) -> Result<PopulationTable, AggregationError> {
    progress.set_total(u64::try_from(cells.len()).unwrap_or(u64::MAX));
    progress.set_message("Aggregating population".to_string());

    log::info!(
        "Aggregating population for {} cells (concurrency={}, timeout={:?})",
        cells.len(),
        options.concurrency,
        options.read_timeout
    );

    let nodata = raster.nodata();
    let reads: Vec<(Cell, CellRead)> = stream::iter(cells.iter().map(|cell| {
        let raster = Arc::clone(&raster);
        let cancel = cancel.clone();
        let progress = Arc::clone(progress);
        async move {
            let outcome = if cancel.is_cancelled() {
                CellRead::Cancelled
            } else {
                read_cell(raster, cell, options.read_timeout, nodata).await
            };
            progress.inc(1);
            (cell, outcome)
        }
    }))
    .buffered(options.concurrency.max(1))
    .collect()
    .await;

    if cancel.is_cancelled() {
        log::warn!("Population aggregation cancelled; discarding partial table");
        return Err(AggregationError::Cancelled);
    }

    let mut sums = Vec::with_capacity(reads.len());
    let mut degraded = BTreeMap::new();
    for (cell, outcome) in reads {
        match outcome {
            CellRead::Sum(sum) => sums.push((cell, sum)),
            CellRead::Failed(reason) => {
                sums.push((cell, 0.0));
                degraded.insert(cell, reason);
            }
            CellRead::Cancelled => return Err(AggregationError::Cancelled),
        }
    }

    let mut table = PopulationTable::from_values(sums);
    table.degraded = degraded;

    if !table.degraded.is_empty() {
        log::warn!(
            "{} of {} cells have degraded population values",
            table.degraded.len(),
            table.len()
        );
    }
    log::info!("Aggregated population total {:.1}", table.total());
    progress.set_message(format!("Population aggregated for {} cells", table.len()));

    Ok(table)
}

async fn read_cell(
    raster: Arc<dyn RasterSource>,
    cell: Cell,
    timeout: Duration,
    nodata: Option<f64>,
) -> CellRead {
    let footprint = cell.boundary_polygon();
    let handle = tokio::task::spawn_blocking(move || raster.read_masked(&footprint));

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(values))) => CellRead::Sum(sum_valid(&values, nodata)),
        Ok(Ok(Err(e))) => {
            log::warn!("Raster read failed for cell {cell}: {e}");
            CellRead::Failed(ReasonCode::RasterReadFailed)
        }
        Ok(Err(e)) => {
            log::warn!("Raster read task for cell {cell} did not complete: {e}");
            CellRead::Failed(ReasonCode::RasterReadFailed)
        }
        Err(_) => {
            log::warn!("Raster read for cell {cell} timed out after {timeout:?}");
            CellRead::Failed(ReasonCode::ReadTimeout)
        }
    }
}

/// Sums pixel values, skipping NaN, infinities, negatives, and `nodata`.
#[must_use]
pub fn sum_valid(values: &[f64], nodata: Option<f64>) -> f64 {
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .filter(|v| nodata.is_none_or(|nd| !is_nodata(*v, nd)))
        .sum()
}

fn is_nodata(value: f64, nodata: f64) -> bool {
    (value - nodata).abs() <= f64::EPSILON * nodata.abs().max(1.0)
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 { value } else { 0.0 }
}
