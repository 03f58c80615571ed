#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Gap scoring.
//!
//! Fits one calibration constant per table so that total predicted
//! competition equals total observed competition, takes the per-cell
//! difference between predicted and observed, and publishes the percentile
//! rank of that difference. Scores are ranks within one table and are not
//! comparable across runs.

use std::collections::BTreeMap;

use serde::Serialize;
use site_gap_grid::Cell;
use thiserror::Error;

/// Score assigned to every cell when all gaps tie and there is nothing to
/// rank.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Errors that can occur while scoring.
#[derive(Debug, Error)]
pub enum ScoringError {
    /// Population and competition are not keyed over the same cells.
    #[error("Population and competition tables are not co-indexed: {message}")]
    MismatchedKeys {
        /// Description of the first mismatch found.
        message: String,
    },
    /// A population or competition value is NaN or infinite.
    #[error("Non-finite {field} value {value} for cell {cell}")]
    NonFinite {
        /// Which input carried the value.
        field: &'static str,
        /// The offending cell.
        cell: Cell,
        /// The offending value.
        value: f64,
    },
    /// The smoothing constant is not a positive finite number.
    #[error("Epsilon must be positive and finite, got {0}")]
    InvalidEpsilon(f64),
}

/// Scoring detail for one cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CellScore {
    pub population: f64,
    pub competition: f64,
    /// `alpha * population`.
    pub predicted: f64,
    /// `predicted - competition`. Positive means under-served.
    pub gap: f64,
    /// Percentile rank of `gap` in `[0, 1]`.
    pub score: f64,
}

/// Scores for one category over one cell set.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreTable {
    alpha: f64,
    cells: BTreeMap<Cell, CellScore>,
}

impl ScoreTable {
    /// The fitted calibration constant.
    #[must_use]
    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    #[must_use]
    pub fn get(&self, cell: &Cell) -> Option<&CellScore> {
        self.cells.get(cell)
    }

    /// Published score of `cell`, if it is in the table.
    #[must_use]
    pub fn score(&self, cell: &Cell) -> Option<f64> {
        self.cells.get(cell).map(|entry| entry.score)
    }

    /// Iterates cells in cell order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&Cell, &CellScore)> {
        self.cells.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Scores one category.
///
/// Both tables must be keyed over exactly the same cells.
///
/// # Errors
///
/// * [`ScoringError::MismatchedKeys`] if the key sets differ
/// * [`ScoringError::NonFinite`] if any input value is NaN or infinite
/// * [`ScoringError::InvalidEpsilon`] if `epsilon` is not positive
pub fn score(
    population: &BTreeMap<Cell, f64>,
    competition: &BTreeMap<Cell, f64>,
    epsilon: f64,
) -> Result<ScoreTable, ScoringError> {
    if !(epsilon.is_finite() && epsilon > 0.0) {
        return Err(ScoringError::InvalidEpsilon(epsilon));
    }
    check_keys(population, competition)?;
    check_finite("population", population)?;
    check_finite("competition", competition)?;

    let total_population: f64 = population.values().sum();
    let total_competition: f64 = competition.values().sum();
    let alpha = if total_population > 0.0 {
        total_competition / (total_population + epsilon)
    } else {
        0.0
    };

    let gaps: Vec<(Cell, f64, f64, f64, f64)> = population
        .iter()
        .zip(competition.values())
        .map(|((&cell, &pop), &comp)| {
            let predicted = alpha * pop;
            (cell, pop, comp, predicted, predicted - comp)
        })
        .collect();

    let ranks = percentile_ranks(&gaps.iter().map(|entry| entry.4).collect::<Vec<_>>());

    let cells = gaps
        .into_iter()
        .zip(ranks)
        .map(|((cell, population, competition, predicted, gap), score)| {
            (
                cell,
                CellScore {
                    population,
                    competition,
                    predicted,
                    gap,
                    score,
                },
            )
        })
        .collect();

    log::debug!(
        "Scored {} cells (alpha={alpha:.6}, population={total_population:.1}, competition={total_competition:.3})",
        population.len()
    );

    Ok(ScoreTable { alpha, cells })
}

/// Percentile ranks of `values`, returned in input order.
///
/// Each value gets the average 1-based rank of its tied group divided by
/// `values.len()`. A single value ranks `1.0`. If every value ties and there
/// are at least two, all ranks are [`NEUTRAL_SCORE`].
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn percentile_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    match n {
        0 => return Vec::new(),
        1 => return vec![1.0],
        _ => {}
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; n];
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && values[order[end]] == values[order[start]] {
            end += 1;
        }

        if start == 0 && end == n {
            return vec![NEUTRAL_SCORE; n];
        }

        // Positions start..end hold 1-based ranks start+1..=end.
        let average_rank = (start + 1 + end) as f64 / 2.0;
        for &index in &order[start..end] {
            ranks[index] = average_rank / n as f64;
        }
        start = end;
    }

    ranks
}

fn check_keys(
    population: &BTreeMap<Cell, f64>,
    competition: &BTreeMap<Cell, f64>,
) -> Result<(), ScoringError> {
    if let Some(cell) = population.keys().find(|cell| !competition.contains_key(cell)) {
        return Err(ScoringError::MismatchedKeys {
            message: format!("cell {cell} has population but no competition"),
        });
    }
    if let Some(cell) = competition.keys().find(|cell| !population.contains_key(cell)) {
        return Err(ScoringError::MismatchedKeys {
            message: format!("cell {cell} has competition but no population"),
        });
    }
    Ok(())
}

fn check_finite(field: &'static str, values: &BTreeMap<Cell, f64>) -> Result<(), ScoringError> {
    match values.iter().find(|(_, value)| !value.is_finite()) {
        Some((&cell, &value)) => Err(ScoringError::NonFinite { field, cell, value }),
        None => Ok(()),
    }
}
