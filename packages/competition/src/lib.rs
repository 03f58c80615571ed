#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Competition density estimation.
//!
//! Counts the points of one category in every cell, then spreads each count
//! into the surrounding rings with an exponential decay:
//!
//! ```text
//! smoothed(c) = base(c) + Σ_{k=1..depth} decay_base^-k · Σ_{n ∈ ring(c, k)} base(n)
//! ```
//!
//! Neighbors outside the cell set contribute nothing. The kernel is
//! additive and includes the cell itself, so `smoothed(c) >= base(c)`.

use std::collections::BTreeMap;

use site_gap_grid::{Cell, CellSet};
use site_gap_models::Point;
use site_gap_models::config::{KernelConfig, MAX_RING_DEPTH};
use thiserror::Error;

/// Errors that can occur while configuring the estimator.
#[derive(Debug, Error)]
pub enum CompetitionError {
    /// The smoothing kernel parameters are out of range.
    #[error("Invalid kernel: {message}")]
    InvalidKernel {
        /// Description of what went wrong.
        message: String,
    },
}

/// Ring-decay smoothing kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayKernel {
    ring_depth: u32,
    decay_base: f64,
}

impl Default for DecayKernel {
    fn default() -> Self {
        Self {
            ring_depth: 2,
            decay_base: std::f64::consts::E,
        }
    }
}

impl DecayKernel {
    /// Creates a kernel reaching `ring_depth` rings out, weighting ring `k`
    /// by `decay_base^-k`.
    ///
    /// # Errors
    ///
    /// Returns [`CompetitionError::InvalidKernel`] if `ring_depth` is above
    /// [`MAX_RING_DEPTH`], or unless `decay_base` is a finite number `>= 1`
    /// (weights must stay in `(0, 1]`).
    pub fn new(ring_depth: u32, decay_base: f64) -> Result<Self, CompetitionError> {
        if ring_depth > MAX_RING_DEPTH {
            return Err(CompetitionError::InvalidKernel {
                message: format!("ring_depth must be at most {MAX_RING_DEPTH}, got {ring_depth}"),
            });
        }
        if !(decay_base.is_finite() && decay_base >= 1.0) {
            return Err(CompetitionError::InvalidKernel {
                message: format!("decay_base must be a finite number >= 1, got {decay_base}"),
            });
        }
        Ok(Self {
            ring_depth,
            decay_base,
        })
    }

    /// How many rings out the kernel reaches.
    #[must_use]
    pub const fn ring_depth(&self) -> u32 {
        self.ring_depth
    }

    /// Weight applied to ring `k`. `weight(0)` is `1.0`.
    #[must_use]
    pub fn weight(&self, k: u32) -> f64 {
        self.decay_base.powf(-f64::from(k))
    }
}

impl TryFrom<&KernelConfig> for DecayKernel {
    type Error = CompetitionError;

    fn try_from(config: &KernelConfig) -> Result<Self, Self::Error> {
        Self::new(config.ring_depth, config.decay_base)
    }
}

/// Smoothed competition density for one category.
#[derive(Debug, Clone, PartialEq)]
pub struct CompetitionTable {
    category: String,
    base: BTreeMap<Cell, f64>,
    values: BTreeMap<Cell, f64>,
    points_outside: usize,
}

impl CompetitionTable {
    /// The category this table was computed for.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Smoothed density of `cell`, `0.0` if it is not in the table.
    #[must_use]
    pub fn get(&self, cell: &Cell) -> f64 {
        self.values.get(cell).copied().unwrap_or(0.0)
    }

    /// Raw point count of `cell` before smoothing.
    #[must_use]
    pub fn base(&self, cell: &Cell) -> f64 {
        self.base.get(cell).copied().unwrap_or(0.0)
    }

    /// Smoothed values keyed by cell.
    #[must_use]
    pub const fn values(&self) -> &BTreeMap<Cell, f64> {
        &self.values
    }

    /// Number of category points that landed inside the cell set.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn points_inside(&self) -> usize {
        self.base.values().sum::<f64>() as usize
    }

    /// Number of category points that fell outside the cell set (or had
    /// unusable coordinates).
    #[must_use]
    pub const fn points_outside(&self) -> usize {
        self.points_outside
    }

    /// Sum of smoothed values.
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

/// Estimates smoothed competition density for `category` over `cells`.
///
/// Points are assigned to cells at the cell set's own resolution. Points of
/// other categories are ignored; a category with no points yields an
/// all-zero table.
#[must_use]
pub fn estimate(
    cells: &CellSet,
    points: &[Point],
    category: &str,
    kernel: &DecayKernel,
) -> CompetitionTable {
    let resolution = cells.resolution();
    let mut base: BTreeMap<Cell, f64> = cells.iter().map(|cell| (cell, 0.0)).collect();
    let mut points_outside = 0usize;

    for point in points.iter().filter(|p| p.category == category) {
        if !point.has_valid_coordinates() {
            log::debug!(
                "Skipping '{category}' point {:?} with invalid coordinates ({}, {})",
                point.source_id,
                point.lat,
                point.lon
            );
        }
        let cell = point
            .has_valid_coordinates()
            .then(|| Cell::containing(point.lat, point.lon, resolution))
            .flatten();

        match cell.and_then(|cell| base.get_mut(&cell)) {
            Some(count) => *count += 1.0,
            None => points_outside += 1,
        }
    }

    let values = smooth(&base, kernel);

    let table = CompetitionTable {
        category: category.to_string(),
        base,
        values,
        points_outside,
    };

    log::debug!(
        "Competition for '{category}': {} points inside, {} outside, total density {:.3}",
        table.points_inside(),
        table.points_outside,
        table.total()
    );

    table
}

/// Applies the ring-decay kernel to per-cell counts. Only cells present in
/// `base` contribute or receive values.
#[must_use]
pub fn smooth(base: &BTreeMap<Cell, f64>, kernel: &DecayKernel) -> BTreeMap<Cell, f64> {
    if base.values().all(|&count| count == 0.0) {
        return base.keys().map(|&cell| (cell, 0.0)).collect();
    }

    let weights: Vec<f64> = (0..=kernel.ring_depth).map(|k| kernel.weight(k)).collect();

    base.iter()
        .map(|(&cell, &own)| {
            let spread: f64 = cell
                .rings(kernel.ring_depth)
                .iter()
                .zip(&weights)
                .skip(1)
                .map(|(ring, weight)| {
                    let ring_sum: f64 = ring
                        .iter()
                        .map(|neighbor| base.get(neighbor).copied().unwrap_or(0.0))
                        .sum();
                    weight * ring_sum
                })
                .sum();
            (cell, own + spread)
        })
        .collect()
}
