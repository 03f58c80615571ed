#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Hexagonal cell grid for site gap scoring.
//!
//! Wraps the H3 discrete global grid (via `h3o`) in a small value-type API:
//! [`Cell`] identifies one hexagon at a fixed resolution and knows its
//! boundary and its neighbors; [`CellSet`] is the deterministic set of
//! cells covering a city footprint, produced by [`tile`].
//!
//! Only one grid scheme is supported. Neighbor rings are computed by
//! breadth-first expansion over [`Cell::adjacent`], so the smoothing kernel
//! downstream can be tested against an explicit adjacency relation.

mod cell;
mod footprint;
mod tiler;

pub use cell::{Cell, CellSet};
pub use footprint::FootprintIndex;
pub use tiler::{tile, tile_polygon};

use thiserror::Error;

/// Coarsest grid resolution.
pub const MIN_RESOLUTION: u8 = 0;

/// Finest grid resolution. Configuration validation checks against the same
/// constant.
pub use site_gap_models::config::MAX_RESOLUTION;

/// Errors that can occur while tiling or addressing cells.
#[derive(Debug, Error)]
pub enum TilingError {
    /// The requested resolution is not defined by the grid.
    #[error("Invalid resolution {value}: expected {MIN_RESOLUTION}-{MAX_RESOLUTION}")]
    InvalidResolution {
        /// The rejected resolution.
        value: u8,
    },

    /// The input polygon cannot be tiled (self-intersecting ring,
    /// non-finite or out-of-range coordinates).
    #[error("Invalid polygon: {message}")]
    InvalidPolygon {
        /// Description of what went wrong.
        message: String,
    },

    /// A cell identifier could not be parsed.
    #[error("Invalid cell id '{id}'")]
    InvalidCellId {
        /// The rejected identifier.
        id: String,
    },
}

/// Converts a numeric resolution into the grid's [`h3o::Resolution`].
///
/// # Errors
///
/// Returns [`TilingError::InvalidResolution`] if `value` is above
/// [`MAX_RESOLUTION`].
pub fn resolution(value: u8) -> Result<h3o::Resolution, TilingError> {
    h3o::Resolution::try_from(value).map_err(|_| TilingError::InvalidResolution { value })
}
