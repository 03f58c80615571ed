#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! End-to-end gap scoring runs.
//!
//! A run tiles the city boundary once, aggregates population once, and then
//! scores every requested category on its own blocking task. Categories
//! share only read-only data (cells, population, points), so one failing or
//! cancelled category never affects its siblings.
//!
//! Only an invalid configuration, an unknown category, or a tiling failure
//! aborts the run. Everything else is reported in [`RunMetadata`].

pub mod input;
pub mod output;

use std::collections::BTreeMap;
use std::sync::Arc;

use geo::MultiPolygon;
use serde::Serialize;
use site_gap_competition::{CompetitionError, DecayKernel};
use site_gap_grid::{Cell, CellSet, TilingError};
use site_gap_models::cancel::CancelToken;
use site_gap_models::config::{ConfigError, PipelineConfig};
use site_gap_models::progress::ProgressCallback;
use site_gap_models::{Category, Point, ReasonCode};
use site_gap_population::{AggregateOptions, AggregationError, PopulationTable, RasterSource};
use site_gap_scoring::ScoringError;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Note attached to every persisted output.
pub const SCORE_SEMANTICS: &str = "score is the percentile rank of the population-predicted \
     minus observed competition gap within this run and category; it is not comparable across \
     runs, cell sets, or categories";

/// Errors that abort a whole run or an output write.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tiling(#[from] TilingError),

    #[error(transparent)]
    Kernel(#[from] CompetitionError),

    /// A requested category is not declared in the configuration.
    #[error("Unknown category '{category}'")]
    UnknownCategory {
        /// The requested category id.
        category: String,
    },

    /// An input file has the wrong shape.
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// Description of what went wrong.
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GeoJSON error: {0}")]
    GeoJson(#[from] geojson::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything a run needs.
pub struct RunRequest {
    /// City boundary in WGS84 (`x = lon`, `y = lat`).
    pub boundary: MultiPolygon<f64>,
    /// Points of interest for every category.
    pub points: Arc<[Point]>,
    /// Population raster.
    pub raster: Arc<dyn RasterSource>,
    pub config: PipelineConfig,
    /// Category ids to score. Empty means every declared category.
    pub categories: Vec<String>,
}

/// One output row: the score of one cell for one category.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRecord {
    pub cell: Cell,
    pub category: String,
    /// Raw population mass of the cell.
    pub population: f64,
    /// Smoothed competition density of the cell.
    pub competition: f64,
    /// Percentile rank in `[0, 1]`, local to this run and category.
    pub score: f64,
}

/// A category that produced no records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryFailure {
    pub category: String,
    pub reason: ReasonCode,
}

/// Per-category statistics for a category that was scored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySummary {
    pub id: String,
    pub label: String,
    /// Fitted calibration constant.
    pub alpha: f64,
    pub points_inside: usize,
    pub points_outside: usize,
    /// Soft data gaps (`EMPTY_POINT_SET`, `ZERO_POPULATION`).
    pub flags: Vec<ReasonCode>,
}

/// Descriptive metadata for a run, written alongside its records.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub run_id: String,
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub resolution: u8,
    pub cell_count: usize,
    pub population_total: f64,
    /// Cells whose population read failed, keyed by cell id.
    pub degraded_cells: BTreeMap<String, ReasonCode>,
    pub categories: Vec<CategorySummary>,
    pub failures: Vec<CategoryFailure>,
    pub score_semantics: &'static str,
}

impl RunMetadata {
    fn new(resolution: u8, cell_count: usize) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            generated_at: chrono::Utc::now(),
            resolution,
            cell_count,
            population_total: 0.0,
            degraded_cells: BTreeMap::new(),
            categories: Vec::new(),
            failures: Vec::new(),
            score_semantics: SCORE_SEMANTICS,
        }
    }
}

/// The result of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub metadata: RunMetadata,
    pub cells: CellSet,
    /// Ordered by declared category, then by cell.
    pub records: Vec<ScoreRecord>,
}

impl RunReport {
    /// Records of one category, in cell order.
    pub fn records_for<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a ScoreRecord> {
        self.records.iter().filter(move |r| r.category == category)
    }
}

struct CategoryOutcome {
    summary: CategorySummary,
    records: Vec<ScoreRecord>,
}

type CategoryHandle = (String, JoinHandle<Result<CategoryOutcome, ReasonCode>>);

/// Runs the whole pipeline.
///
/// # Errors
///
/// * [`PipelineError::Config`] if the configuration is invalid
/// * [`PipelineError::UnknownCategory`] if a requested category is not
///   declared
/// * [`PipelineError::Tiling`] if the boundary or resolution is invalid
///
/// Per-cell and per-category problems, including cancellation, are
/// reported in the returned metadata instead.
#[allow(clippy::too_many_lines)]
pub async fn run(
    request: RunRequest,
    cancel: &CancelToken,
    progress: &Arc<dyn ProgressCallback>,
) -> Result<RunReport, PipelineError> {
    let RunRequest {
        boundary,
        points,
        raster,
        config,
        categories: requested,
    } = request;

    config.validate()?;
    let categories = resolve_categories(&config, &requested)?;
    let kernel = DecayKernel::try_from(&config.kernel)?;

    let cells = Arc::new(site_gap_grid::tile(&boundary, config.resolution)?);

    let mut metadata = RunMetadata::new(config.resolution, cells.len());

    log::info!(
        "Run {}: {} cells at resolution {}, {} categories, {} points",
        metadata.run_id,
        cells.len(),
        config.resolution,
        categories.len(),
        points.len()
    );

    let options = AggregateOptions::from(&config.population);
    let population = match site_gap_population::aggregate(&cells, raster, options, cancel, progress)
        .await
    {
        Ok(table) => Arc::new(table),
        Err(AggregationError::Cancelled) => {
            metadata.failures = categories
                .iter()
                .map(|category| CategoryFailure {
                    category: category.id.clone(),
                    reason: ReasonCode::Cancelled,
                })
                .collect();
            progress.finish("Run cancelled".to_string());
            return Ok(finish(metadata, &cells, Vec::new()));
        }
    };

    metadata.population_total = population.total();
    metadata.degraded_cells = population
        .degraded()
        .iter()
        .map(|(cell, reason)| (cell.to_string(), *reason))
        .collect();

    progress.set_total(u64::try_from(categories.len()).unwrap_or(u64::MAX));
    progress.set_message("Scoring categories".to_string());

    let handles: Vec<_> = categories
        .iter()
        .map(|category| {
            let cells = Arc::clone(&cells);
            let population = Arc::clone(&population);
            let points = Arc::clone(&points);
            let cancel = cancel.clone();
            let category = category.clone();
            let epsilon = config.epsilon;
            let id = category.id.clone();
            let handle = tokio::task::spawn_blocking(move || {
                score_category(
                    &cells,
                    &population,
                    &points,
                    &category,
                    &kernel,
                    epsilon,
                    &cancel,
                )
            });
            (id, handle)
        })
        .collect();

    let records = collect_outcomes(handles, &mut metadata, progress).await;

    progress.finish(format!(
        "Scored {} of {} categories",
        metadata.categories.len(),
        categories.len()
    ));

    Ok(finish(metadata, &cells, records))
}

/// Awaits every category task in order. A failed or panicked task is
/// recorded in `metadata.failures` and never drops a sibling's records.
async fn collect_outcomes(
    handles: Vec<CategoryHandle>,
    metadata: &mut RunMetadata,
    progress: &Arc<dyn ProgressCallback>,
) -> Vec<ScoreRecord> {
    let mut records = Vec::with_capacity(metadata.cell_count * handles.len());
    for (category, handle) in handles {
        let reason = match handle.await {
            Ok(Ok(outcome)) => {
                records.extend(outcome.records);
                metadata.categories.push(outcome.summary);
                progress.inc(1);
                continue;
            }
            Ok(Err(reason)) if reason.is_fatal_for_category() => reason,
            Ok(Err(reason)) => {
                log::error!("Scoring '{category}' returned soft flag {reason} as a failure");
                ReasonCode::TaskFailed
            }
            Err(e) => {
                log::error!("Scoring task for '{category}' failed: {e}");
                ReasonCode::TaskFailed
            }
        };
        log::warn!("Category '{category}' produced no records ({reason})");
        metadata.failures.push(CategoryFailure { category, reason });
        progress.inc(1);
    }
    records
}

fn finish(metadata: RunMetadata, cells: &Arc<CellSet>, records: Vec<ScoreRecord>) -> RunReport {
    log::info!(
        "Run {} finished: {} records, {} failed categories",
        metadata.run_id,
        records.len(),
        metadata.failures.len()
    );
    RunReport {
        metadata,
        cells: CellSet::clone(cells),
        records,
    }
}

/// Resolves requested ids against the configuration, keeping declaration
/// order.
fn resolve_categories(
    config: &PipelineConfig,
    requested: &[String],
) -> Result<Vec<Category>, PipelineError> {
    if let Some(unknown) = requested.iter().find(|id| config.category(id).is_none()) {
        return Err(PipelineError::UnknownCategory {
            category: unknown.clone(),
        });
    }

    Ok(config
        .categories
        .iter()
        .filter(|category| requested.is_empty() || requested.contains(&category.id))
        .cloned()
        .collect())
}

fn score_category(
    cells: &CellSet,
    population: &PopulationTable,
    points: &[Point],
    category: &Category,
    kernel: &DecayKernel,
    epsilon: f64,
    cancel: &CancelToken,
) -> Result<CategoryOutcome, ReasonCode> {
    if cancel.is_cancelled() {
        return Err(ReasonCode::Cancelled);
    }

    let competition = site_gap_competition::estimate(cells, points, &category.id, kernel);

    if cancel.is_cancelled() {
        return Err(ReasonCode::Cancelled);
    }

    let scores = site_gap_scoring::score(population.values(), competition.values(), epsilon)
        .map_err(|e: ScoringError| {
            log::error!("Scoring '{}' failed: {e}", category.id);
            ReasonCode::TaskFailed
        })?;

    let mut flags = Vec::new();
    if competition.points_inside() == 0 {
        flags.push(ReasonCode::EmptyPointSet);
    }
    if population.total() <= 0.0 {
        flags.push(ReasonCode::ZeroPopulation);
    }

    let records = scores
        .iter()
        .map(|(&cell, entry)| ScoreRecord {
            cell,
            category: category.id.clone(),
            population: entry.population,
            competition: entry.competition,
            score: entry.score,
        })
        .collect();

    log::info!(
        "Scored '{}' (alpha={:.6}, {} points inside)",
        category.id,
        scores.alpha(),
        competition.points_inside()
    );

    Ok(CategoryOutcome {
        summary: CategorySummary {
            id: category.id.clone(),
            label: category.label().to_string(),
            alpha: scores.alpha(),
            points_inside: competition.points_inside(),
            points_outside: competition.points_outside(),
            flags,
        },
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;
    use site_gap_models::progress::null_progress;
    use site_gap_population::UniformRaster;

    fn city() -> MultiPolygon<f64> {
        MultiPolygon(vec![polygon![
            (x: 77.55, y: 12.95),
            (x: 77.60, y: 12.95),
            (x: 77.60, y: 13.00),
            (x: 77.55, y: 13.00),
        ]])
    }

    fn config() -> PipelineConfig {
        PipelineConfig::from_toml_str(
            r#"
            resolution = 8

            [[categories]]
            id = "cafe"
            name = "Cafés"

            [[categories]]
            id = "pharmacy"
            "#,
        )
        .unwrap()
    }

    fn points() -> Arc<[Point]> {
        let mut points = Vec::new();
        for i in 0..10 {
            let offset = f64::from(i) * 0.004;
            points.push(Point::new(12.955 + offset, 77.555 + offset, "cafe"));
        }
        points.push(Point::new(12.975, 77.575, "pharmacy"));
        points.push(Point::new(40.0, -74.0, "pharmacy"));
        points.into()
    }

    fn request(categories: &[&str]) -> RunRequest {
        RunRequest {
            boundary: city(),
            points: points(),
            raster: Arc::new(UniformRaster::new(1.0)),
            config: config(),
            categories: categories.iter().map(ToString::to_string).collect(),
        }
    }

    #[tokio::test]
    async fn scores_every_cell_for_every_category() {
        let report = run(request(&[]), &CancelToken::new(), &null_progress())
            .await
            .unwrap();

        let cell_count = report.cells.len();
        assert!(cell_count > 10, "expected a real grid, got {cell_count}");
        assert_eq!(report.records.len(), cell_count * 2);
        assert_eq!(report.metadata.cell_count, cell_count);
        assert_eq!(report.metadata.resolution, 8);
        assert!(report.metadata.failures.is_empty());
        assert!(report.records.iter().all(|r| (0.0..=1.0).contains(&r.score)));

        let categories: Vec<&str> = report
            .records
            .iter()
            .map(|r| r.category.as_str())
            .collect();
        let split = categories.iter().position(|&c| c == "pharmacy").unwrap();
        assert!(categories[..split].iter().all(|&c| c == "cafe"));
        assert!(categories[split..].iter().all(|&c| c == "pharmacy"));

        let cafe_cells: Vec<Cell> = report.records_for("cafe").map(|r| r.cell).collect();
        assert!(cafe_cells.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn summaries_carry_alpha_and_point_counts() {
        let report = run(request(&[]), &CancelToken::new(), &null_progress())
            .await
            .unwrap();

        let pharmacy = report
            .metadata
            .categories
            .iter()
            .find(|c| c.id == "pharmacy")
            .unwrap();
        assert_eq!(pharmacy.points_inside, 1);
        assert_eq!(pharmacy.points_outside, 1);
        assert!(pharmacy.alpha > 0.0);
        assert_eq!(pharmacy.label, "pharmacy");

        let cafe = &report.metadata.categories[0];
        assert_eq!(cafe.label, "Cafés");
        assert!(cafe.flags.is_empty());
    }

    #[tokio::test]
    async fn requested_subset_keeps_declared_order() {
        let report = run(
            request(&["pharmacy", "cafe"]),
            &CancelToken::new(),
            &null_progress(),
        )
        .await
        .unwrap();
        let ids: Vec<&str> = report
            .metadata
            .categories
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, vec!["cafe", "pharmacy"]);
    }

    #[tokio::test]
    async fn category_without_points_is_flagged_and_neutral() {
        let mut request = request(&[]);
        request.config.categories.push(Category {
            id: "bakery".to_string(),
            name: None,
        });

        let report = run(request, &CancelToken::new(), &null_progress())
            .await
            .unwrap();
        let bakery = report
            .metadata
            .categories
            .iter()
            .find(|c| c.id == "bakery")
            .unwrap();
        assert_eq!(bakery.flags, vec![ReasonCode::EmptyPointSet]);
        assert!(bakery.alpha.abs() < f64::EPSILON);
        assert!(
            report
                .records_for("bakery")
                .all(|r| (r.score - 0.5).abs() < f64::EPSILON)
        );
    }

    #[tokio::test]
    async fn unknown_category_fails_fast() {
        let result = run(request(&["bakery"]), &CancelToken::new(), &null_progress()).await;
        assert!(matches!(
            result,
            Err(PipelineError::UnknownCategory { category }) if category == "bakery"
        ));
    }

    #[tokio::test]
    async fn invalid_boundary_fails_the_run() {
        let mut request = request(&[]);
        request.boundary = MultiPolygon(vec![polygon![
            (x: 77.55, y: 12.95),
            (x: 77.60, y: 13.00),
            (x: 77.60, y: 12.95),
            (x: 77.55, y: 13.00),
        ]]);
        let result = run(request, &CancelToken::new(), &null_progress()).await;
        assert!(matches!(result, Err(PipelineError::Tiling(_))));
    }

    #[tokio::test]
    async fn invalid_resolution_fails_the_run() {
        let mut request = request(&[]);
        request.config.resolution = 16;
        let result = run(request, &CancelToken::new(), &null_progress()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn empty_boundary_scores_nothing() {
        let mut request = request(&[]);
        request.boundary = MultiPolygon(vec![]);
        let report = run(request, &CancelToken::new(), &null_progress())
            .await
            .unwrap();
        assert!(report.cells.is_empty());
        assert!(report.records.is_empty());
        assert!(report.metadata.failures.is_empty());
    }

    #[tokio::test]
    async fn cancelled_run_emits_no_records() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = run(request(&[]), &cancel, &null_progress()).await.unwrap();

        assert!(report.records.is_empty());
        assert_eq!(report.metadata.failures.len(), 2);
        assert!(
            report
                .metadata
                .failures
                .iter()
                .all(|f| f.reason == ReasonCode::Cancelled)
        );
    }

    fn scored_inputs() -> (CellSet, PopulationTable) {
        let cells = site_gap_grid::tile(&city(), 8).unwrap();
        let population = PopulationTable::from_values(cells.iter().map(|cell| (cell, 1.0)));
        (cells, population)
    }

    fn cafe() -> Category {
        config().category("cafe").unwrap().clone()
    }

    /// Cancels the run as soon as category scoring starts.
    struct CancelOnScoring(CancelToken);

    impl ProgressCallback for CancelOnScoring {
        fn set_total(&self, _total: u64) {}
        fn inc(&self, _delta: u64) {}
        fn set_message(&self, msg: String) {
            if msg == "Scoring categories" {
                self.0.cancel();
            }
        }
        fn finish(&self, _msg: String) {}
    }

    #[test]
    fn cancelled_category_returns_cancelled() {
        let (cells, population) = scored_inputs();
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = score_category(
            &cells,
            &population,
            &points(),
            &cafe(),
            &DecayKernel::default(),
            1e-9,
            &cancel,
        );
        assert!(matches!(result, Err(ReasonCode::Cancelled)));
    }

    #[tokio::test]
    async fn failed_categories_keep_sibling_records() {
        let (cells, population) = scored_inputs();
        let outcome = score_category(
            &cells,
            &population,
            &points(),
            &cafe(),
            &DecayKernel::default(),
            1e-9,
            &CancelToken::new(),
        )
        .unwrap();

        let handles: Vec<CategoryHandle> = vec![
            (
                "cafe".to_string(),
                tokio::task::spawn_blocking(move || Ok(outcome)),
            ),
            (
                "pharmacy".to_string(),
                tokio::task::spawn_blocking(|| Err(ReasonCode::TaskFailed)),
            ),
            (
                "gym".to_string(),
                tokio::task::spawn_blocking(|| -> Result<CategoryOutcome, ReasonCode> {
                    panic!("worker crashed")
                }),
            ),
            (
                "bakery".to_string(),
                tokio::task::spawn_blocking(|| Err(ReasonCode::EmptyPointSet)),
            ),
        ];

        let mut metadata = RunMetadata::new(8, cells.len());
        let records = collect_outcomes(handles, &mut metadata, &null_progress()).await;

        assert_eq!(records.len(), metadata.cell_count);
        assert!(records.iter().all(|r| r.category == "cafe"));
        assert_eq!(metadata.categories.len(), 1);
        assert_eq!(metadata.categories[0].id, "cafe");

        let failures: Vec<(&str, ReasonCode)> = metadata
            .failures
            .iter()
            .map(|f| (f.category.as_str(), f.reason))
            .collect();
        assert_eq!(
            failures,
            vec![
                ("pharmacy", ReasonCode::TaskFailed),
                ("gym", ReasonCode::TaskFailed),
                ("bakery", ReasonCode::TaskFailed),
            ]
        );
    }

    #[tokio::test]
    async fn cancellation_after_aggregation_fails_every_category() {
        let cancel = CancelToken::new();
        let progress: Arc<dyn ProgressCallback> = Arc::new(CancelOnScoring(cancel.clone()));
        let report = run(request(&[]), &cancel, &progress).await.unwrap();

        assert!(report.metadata.population_total > 0.0);
        assert!(report.records.is_empty());
        assert!(report.metadata.categories.is_empty());
        let failed: Vec<&str> = report
            .metadata
            .failures
            .iter()
            .map(|f| f.category.as_str())
            .collect();
        assert_eq!(failed, vec!["cafe", "pharmacy"]);
        assert!(
            report
                .metadata
                .failures
                .iter()
                .all(|f| f.reason == ReasonCode::Cancelled)
        );
    }

    #[test]
    fn metadata_serializes_reason_codes() {
        let failure = CategoryFailure {
            category: "cafe".to_string(),
            reason: ReasonCode::TaskFailed,
        };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["reason"], "TASK_FAILED");
        assert_eq!(json["category"], "cafe");
    }
}
