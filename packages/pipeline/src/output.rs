//! Persisting score records, grids, and run metadata.
//!
//! Every record carries its cell boundary so the output can be rendered
//! without access to the grid library.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use geo::Polygon;
use geojson::{Feature, FeatureCollection, JsonObject};
use site_gap_grid::{Cell, CellSet};

use crate::{PipelineError, RunMetadata, SCORE_SEMANTICS, ScoreRecord};

/// Column order of tabular output.
pub const COLUMNS: [&str; 6] = [
    "cell_id",
    "category",
    "population",
    "competition",
    "score",
    "boundary_wkt",
];

/// Destination for score records.
pub trait RecordSink {
    /// Writes `records` and flushes.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying writer fails.
    fn write_records(&mut self, records: &[ScoreRecord]) -> Result<(), PipelineError>;
}

/// Writes records as one `GeoJSON` `FeatureCollection`.
pub struct GeoJsonSink<W: Write> {
    writer: W,
}

impl GeoJsonSink<BufWriter<File>> {
    /// Creates (or truncates) the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(path: &Path) -> Result<Self, PipelineError> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> GeoJsonSink<W> {
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RecordSink for GeoJsonSink<W> {
    fn write_records(&mut self, records: &[ScoreRecord]) -> Result<(), PipelineError> {
        let features = records
            .iter()
            .map(|record| {
                let mut properties = JsonObject::new();
                properties.insert("cell_id".to_string(), record.cell.to_string().into());
                properties.insert("category".to_string(), record.category.clone().into());
                properties.insert("population".to_string(), record.population.into());
                properties.insert("competition".to_string(), record.competition.into());
                properties.insert("score".to_string(), record.score.into());
                cell_feature(record.cell, properties)
            })
            .collect();

        let mut foreign_members = JsonObject::new();
        foreign_members.insert("scoreSemantics".to_string(), SCORE_SEMANTICS.into());

        let collection = FeatureCollection {
            bbox: None,
            features,
            foreign_members: Some(foreign_members),
        };

        serde_json::to_writer(&mut self.writer, &collection)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        log::info!("Wrote {} score features", records.len());
        Ok(())
    }
}

/// Writes records as CSV rows with a WKT boundary column.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl CsvSink<File> {
    /// Creates (or truncates) the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(path: &Path) -> Result<Self, PipelineError> {
        Ok(Self::new(File::create(path)?))
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
        }
    }

    /// Returns the underlying writer.
    ///
    /// # Errors
    ///
    /// Returns an error if buffered rows cannot be flushed.
    pub fn into_inner(self) -> Result<W, PipelineError> {
        self.writer
            .into_inner()
            .map_err(|e| PipelineError::Io(e.into_error()))
    }
}

impl<W: Write> RecordSink for CsvSink<W> {
    fn write_records(&mut self, records: &[ScoreRecord]) -> Result<(), PipelineError> {
        self.writer.write_record(COLUMNS)?;
        for record in records {
            self.writer.write_record([
                record.cell.to_string(),
                record.category.clone(),
                record.population.to_string(),
                record.competition.to_string(),
                record.score.to_string(),
                polygon_wkt(&record.cell.boundary_polygon()),
            ])?;
        }
        self.writer.flush()?;

        log::info!("Wrote {} score rows", records.len());
        Ok(())
    }
}

/// Writes the cell grid alone as a `GeoJSON` `FeatureCollection`.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_grid(path: &Path, cells: &CellSet) -> Result<(), PipelineError> {
    let features = cells
        .iter()
        .map(|cell| {
            let mut properties = JsonObject::new();
            properties.insert("cell_id".to_string(), cell.to_string().into());
            cell_feature(cell, properties)
        })
        .collect();

    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };

    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, &collection)?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    log::info!("Wrote {} grid cells to {}", cells.len(), path.display());
    Ok(())
}

/// Writes run metadata as pretty JSON, replacing `path` atomically.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_metadata(path: &Path, metadata: &RunMetadata) -> Result<(), PipelineError> {
    let tmp_path = path.with_extension("json.tmp");
    let contents = serde_json::to_string_pretty(metadata)?;
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;

    log::info!("Run metadata written: {}", path.display());
    Ok(())
}

fn cell_feature(cell: Cell, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(geojson::Value::from(
            &cell.boundary_polygon(),
        ))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

/// Well-known text for a polygon's exterior ring (`x = lon`, `y = lat`).
#[must_use]
pub fn polygon_wkt(polygon: &Polygon<f64>) -> String {
    let mut wkt = String::from("POLYGON ((");
    for (i, coord) in polygon.exterior().coords().enumerate() {
        if i > 0 {
            wkt.push_str(", ");
        }
        let _ = write!(wkt, "{} {}", coord.x, coord.y);
    }
    wkt.push_str("))");
    wkt
}
