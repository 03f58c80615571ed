#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI for site gap scoring.
//!
//! ```text
//! site_gap run --config config/categories.toml --boundary city.geojson \
//!     --points pois.geojson [--population pop.asc] [--resolution 8] \
//!     [--categories cafe,pharmacy] [--output scores.geojson] \
//!     [--csv scores.csv] [--metadata run.json]
//! site_gap grid --boundary city.geojson --resolution 8 --output grid.geojson
//! site_gap categories --config config/categories.toml
//! ```
//!
//! Ctrl-C during `run` cancels the remaining work. Categories that did not
//! finish are reported as cancelled and emit no records.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use site_gap_cli_utils::IndicatifProgress;
use site_gap_models::cancel::CancelToken;
use site_gap_models::config::{DEFAULT_RESOLUTION, PipelineConfig};
use site_gap_pipeline::output::{
    CsvSink, GeoJsonSink, RecordSink as _, write_grid, write_metadata,
};
use site_gap_pipeline::{RunReport, RunRequest, input};
use site_gap_population::{GridRaster, RasterSource, UniformRaster};

#[derive(Parser)]
#[command(
    name = "site_gap",
    about = "Score under-served areas of a city for each business category"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tile a city, aggregate population, and score every category
    Run {
        /// TOML configuration declaring categories and tuning
        #[arg(long)]
        config: PathBuf,
        /// City boundary (`GeoJSON` Polygon/MultiPolygon)
        #[arg(long)]
        boundary: PathBuf,
        /// Points of interest (`GeoJSON` `FeatureCollection` with `category`)
        #[arg(long)]
        points: PathBuf,
        /// Population raster (ESRI ASCII grid, WGS84). Uniform when omitted
        #[arg(long)]
        population: Option<PathBuf>,
        /// Grid resolution, overriding the configuration
        #[arg(long)]
        resolution: Option<u8>,
        /// Only score these categories (comma-separated ids)
        #[arg(long, value_delimiter = ',')]
        categories: Vec<String>,
        /// `GeoJSON` output path
        #[arg(long, default_value = "scores.geojson")]
        output: PathBuf,
        /// Also write CSV rows with WKT boundaries
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Also write run metadata as JSON
        #[arg(long)]
        metadata: Option<PathBuf>,
    },
    /// Export the cell grid covering a city
    Grid {
        /// City boundary (`GeoJSON` Polygon/MultiPolygon)
        #[arg(long)]
        boundary: PathBuf,
        /// Grid resolution (0-15)
        #[arg(long, default_value_t = DEFAULT_RESOLUTION)]
        resolution: u8,
        /// `GeoJSON` output path
        #[arg(long, default_value = "grid.geojson")]
        output: PathBuf,
    },
    /// List the categories declared in a configuration
    Categories {
        /// TOML configuration
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = site_gap_cli_utils::init_logger();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            boundary,
            points,
            population,
            resolution,
            categories,
            output,
            csv,
            metadata,
        } => {
            let mut config = PipelineConfig::load(&config)?;
            if let Some(resolution) = resolution {
                config.resolution = resolution;
            }
            config.validate()?;

            let raster: Arc<dyn RasterSource> = if let Some(path) = population {
                Arc::new(GridRaster::load_ascii(&path)?)
            } else {
                log::warn!(
                    "No population raster given; every cell gets {}",
                    config.population.uniform_value
                );
                Arc::new(UniformRaster::new(config.population.uniform_value))
            };

            let request = RunRequest {
                boundary: input::load_boundary(&boundary)?,
                points: input::load_points(&points)?.into(),
                raster,
                config,
                categories,
            };

            let cancel = CancelToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let progress = IndicatifProgress::stage_bar(&multi, "Scoring");
            let report = site_gap_pipeline::run(request, &cancel, &progress).await?;

            GeoJsonSink::create(&output)?.write_records(&report.records)?;
            println!("Wrote {} records to {}", report.records.len(), output.display());

            if let Some(path) = csv {
                CsvSink::create(&path)?.write_records(&report.records)?;
                println!("Wrote CSV to {}", path.display());
            }
            if let Some(path) = metadata {
                write_metadata(&path, &report.metadata)?;
                println!("Wrote metadata to {}", path.display());
            }

            print_summary(&report);
        }
        Commands::Grid {
            boundary,
            resolution,
            output,
        } => {
            let boundary = input::load_boundary(&boundary)?;
            let cells = site_gap_grid::tile(&boundary, resolution)?;
            write_grid(&output, &cells)?;
            println!(
                "Wrote {} cells at resolution {resolution} to {}",
                cells.len(),
                output.display()
            );
        }
        Commands::Categories { config } => {
            let config = PipelineConfig::load(&config)?;
            config.validate()?;

            println!("{:<20} LABEL", "ID");
            println!("{}", "-".repeat(40));
            for category in &config.categories {
                println!("{:<20} {}", category.id, category.label());
            }
            println!("\n{} category(ies)", config.categories.len());
        }
    }

    Ok(())
}

fn print_summary(report: &RunReport) {
    let metadata = &report.metadata;

    println!();
    println!(
        "Run {} ({} cells, resolution {})",
        metadata.run_id, metadata.cell_count, metadata.resolution
    );
    println!("{:<20} {:>12} {:>8}  FLAGS", "CATEGORY", "ALPHA", "POINTS");
    println!("{}", "-".repeat(60));
    for category in &metadata.categories {
        let flags: Vec<&str> = category.flags.iter().map(AsRef::<str>::as_ref).collect();
        println!(
            "{:<20} {:>12.6} {:>8}  {}",
            category.id,
            category.alpha,
            category.points_inside,
            flags.join(",")
        );
    }

    for failure in &metadata.failures {
        eprintln!("Category '{}' failed: {}", failure.category, failure.reason);
    }
    if !metadata.degraded_cells.is_empty() {
        eprintln!(
            "{} cell(s) have degraded population values",
            metadata.degraded_cells.len()
        );
    }
    println!("\nScores are percentile ranks within this run only.");
}
