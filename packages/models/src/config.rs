//! Pipeline configuration, deserialized from TOML.
//!
//! Every field has a default so an empty file is a valid configuration
//! (apart from declaring at least one category). CLI flags override the
//! parsed values before [`PipelineConfig::validate`] runs.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Category;

/// Default H3 resolution (~460 m edge length).
pub const DEFAULT_RESOLUTION: u8 = 8;

/// Finest resolution the hexagonal grid defines. `site_gap_grid` re-exports
/// this constant.
pub const MAX_RESOLUTION: u8 = 15;

/// Default smoothing depth in rings.
pub const DEFAULT_RING_DEPTH: u32 = 2;

/// Deepest accepted smoothing kernel. Ring `k` holds `6k` cells, and at
/// the default decay ring 10 is weighted below `5e-5`.
pub const MAX_RING_DEPTH: u32 = 10;

/// Default guard added to the population total when fitting `alpha`.
pub const DEFAULT_EPSILON: f64 = 1e-9;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for this schema.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A value is out of its accepted range.
    #[error("Invalid configuration: {message}")]
    Invalid {
        /// Description of what went wrong.
        message: String,
    },
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Grid resolution (0 = coarsest, 15 = finest).
    pub resolution: u8,
    /// Small constant preventing division by zero when fitting `alpha`.
    pub epsilon: f64,
    /// Neighbor smoothing kernel for competition density.
    pub kernel: KernelConfig,
    /// Raster read behavior for population aggregation.
    pub population: PopulationConfig,
    /// Categories to score, in output order.
    pub categories: Vec<Category>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
            epsilon: DEFAULT_EPSILON,
            kernel: KernelConfig::default(),
            population: PopulationConfig::default(),
            categories: Vec::new(),
        }
    }
}

/// Ring-decay smoothing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// How many rings out neighbors contribute.
    pub ring_depth: u32,
    /// Ring `k` is weighted by `decay_base^-k`.
    pub decay_base: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            ring_depth: DEFAULT_RING_DEPTH,
            decay_base: std::f64::consts::E,
        }
    }
}

/// Population raster read settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulationConfig {
    /// Per-cell raster read timeout in milliseconds.
    pub read_timeout_ms: u64,
    /// Maximum number of cell reads in flight.
    pub read_concurrency: usize,
    /// Mass assigned to every cell when no raster is supplied.
    pub uniform_value: f64,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 5_000,
            read_concurrency: 8,
            uniform_value: 1.0,
        }
    }
}

impl PipelineConfig {
    /// Parses a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Toml`] if the string does not match the
    /// schema.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::de::from_str(content)?)
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        log::debug!(
            "Loaded configuration from {} ({} categories)",
            path.display(),
            config.categories.len()
        );
        Ok(config)
    }

    /// Looks up a declared category by id.
    #[must_use]
    pub fn category(&self, id: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first offending
    /// value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resolution > MAX_RESOLUTION {
            return Err(invalid(format!(
                "resolution {} is above the maximum of {MAX_RESOLUTION}",
                self.resolution
            )));
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(invalid(format!(
                "epsilon must be a positive finite number, got {}",
                self.epsilon
            )));
        }
        if self.kernel.ring_depth > MAX_RING_DEPTH {
            return Err(invalid(format!(
                "kernel.ring_depth {} is above the maximum of {MAX_RING_DEPTH}",
                self.kernel.ring_depth
            )));
        }
        if !(self.kernel.decay_base.is_finite() && self.kernel.decay_base >= 1.0) {
            return Err(invalid(format!(
                "kernel.decay_base must be >= 1, got {}",
                self.kernel.decay_base
            )));
        }
        if self.population.read_concurrency == 0 {
            return Err(invalid("population.read_concurrency must be at least 1"));
        }
        if self.population.read_timeout_ms == 0 {
            return Err(invalid("population.read_timeout_ms must be at least 1"));
        }
        if !(self.population.uniform_value.is_finite() && self.population.uniform_value >= 0.0) {
            return Err(invalid(format!(
                "population.uniform_value must be non-negative, got {}",
                self.population.uniform_value
            )));
        }
        if self.categories.is_empty() {
            return Err(invalid("at least one category must be declared"));
        }

        let mut seen = BTreeSet::new();
        for category in &self.categories {
            if category.id.trim().is_empty() {
                return Err(invalid("category ids must not be empty"));
            }
            if !seen.insert(category.id.as_str()) {
                return Err(invalid(format!("duplicate category id '{}'", category.id)));
            }
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
resolution = 9

[kernel]
ring_depth = 1

[[categories]]
id = "cafe"
name = "Cafés"

[[categories]]
id = "pharmacy"
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.resolution, 9);
        assert_eq!(config.kernel.ring_depth, 1);
        assert!((config.kernel.decay_base - std::f64::consts::E).abs() < f64::EPSILON);
        assert!((config.epsilon - DEFAULT_EPSILON).abs() < f64::EPSILON);
        assert_eq!(config.population, PopulationConfig::default());
        assert_eq!(config.categories.len(), 2);
        assert_eq!(config.category("cafe").map(Category::label), Some("Cafés"));
        assert!(config.category("bakery").is_none());
        config.validate().unwrap();
    }

    #[test]
    fn empty_file_needs_a_category() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config.resolution, DEFAULT_RESOLUTION);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let base = PipelineConfig::from_toml_str(SAMPLE).unwrap();

        let mut config = base.clone();
        config.resolution = 16;
        assert!(config.validate().is_err(), "resolution 16 should be rejected");

        let mut config = base.clone();
        config.kernel.decay_base = 0.5;
        assert!(config.validate().is_err(), "decay_base < 1 should be rejected");

        let mut config = base.clone();
        config.epsilon = 0.0;
        assert!(config.validate().is_err(), "zero epsilon should be rejected");

        let mut config = base.clone();
        config.population.read_concurrency = 0;
        assert!(config.validate().is_err(), "zero concurrency should be rejected");

        let mut config = base;
        config.categories.push(Category {
            id: "cafe".to_string(),
            name: None,
        });
        assert!(config.validate().is_err(), "duplicate ids should be rejected");
    }

    #[test]
    fn ring_depth_is_bounded() {
        let mut config = PipelineConfig::from_toml_str(SAMPLE).unwrap();

        config.kernel.ring_depth = MAX_RING_DEPTH;
        config.validate().unwrap();

        config.kernel.ring_depth = u32::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { message }) if message.contains("ring_depth")
        ));
    }

    #[test]
    fn rejects_mistyped_values() {
        assert!(matches!(
            PipelineConfig::from_toml_str("resolution = \"eight\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn bundled_configuration_is_valid() {
        let config =
            PipelineConfig::from_toml_str(include_str!("../../../config/categories.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.resolution, DEFAULT_RESOLUTION);
        assert_eq!(config.category("cafe").map(Category::label), Some("Cafés"));
    }
}
