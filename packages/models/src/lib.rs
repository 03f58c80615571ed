#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared types for the site gap scoring pipeline.
//!
//! These types describe the inputs the pipeline consumes (points of
//! interest tagged by business category), the configuration that tunes
//! it, and the reason codes it reports when a cell or category had to be
//! degraded. They are independent of the grid and raster machinery.

pub mod cancel;
pub mod config;
pub mod progress;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// A point of interest observed in the city, already tagged with the
/// business category it competes in.
///
/// Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Point {
    /// Latitude in WGS84 degrees.
    pub lat: f64,
    /// Longitude in WGS84 degrees.
    pub lon: f64,
    /// Category identifier (e.g. `"cafe"`).
    pub category: String,
    /// Display name, if the source had one.
    pub name: Option<String>,
    /// Identifier in the upstream source (e.g. an OSM element id).
    pub source_id: Option<String>,
}

impl Point {
    /// Creates an unnamed point with no source id.
    #[must_use]
    pub fn new(lat: f64, lon: f64, category: impl Into<String>) -> Self {
        Self {
            lat,
            lon,
            category: category.into(),
            name: None,
            source_id: None,
        }
    }

    /// Returns `true` if both coordinates are finite and within the WGS84
    /// latitude/longitude ranges.
    #[must_use]
    pub fn has_valid_coordinates(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// A business category declared in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Identifier matched against [`Point::category`].
    pub id: String,
    /// Human-readable label. Falls back to the id when absent.
    #[serde(default)]
    pub name: Option<String>,
}

impl Category {
    /// Returns the human-readable label for this category.
    #[must_use]
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Why a cell or category was degraded or dropped from a run.
///
/// Soft reasons (`RasterReadFailed`, `ReadTimeout`, `EmptyPointSet`,
/// `ZeroPopulation`) describe data gaps that were resolved by defaulting
/// to zero or neutral values. `Cancelled` and `TaskFailed` mean the
/// affected category produced no records at all.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// The raster source returned an error for a cell footprint.
    RasterReadFailed,
    /// A raster read did not finish within the configured timeout.
    ReadTimeout,
    /// No points of the category fell inside the covered area.
    EmptyPointSet,
    /// The population table had no positive mass, so `alpha` was zero.
    ZeroPopulation,
    /// The run was cancelled before the category finished.
    Cancelled,
    /// The category's worker task failed unexpectedly.
    TaskFailed,
}

impl ReasonCode {
    /// Returns `true` if this reason means the category emitted no records.
    #[must_use]
    pub const fn is_fatal_for_category(self) -> bool {
        matches!(self, Self::Cancelled | Self::TaskFailed)
    }
}
