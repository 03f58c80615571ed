//! `GeoJSON` loading for city boundaries and points of interest.

use std::path::Path;

use geo::{Centroid as _, MultiPolygon};
use geojson::{Feature, GeoJson};
use site_gap_models::Point;

use crate::PipelineError;

/// Reads a city boundary from a `GeoJSON` file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or holds no polygon.
pub fn load_boundary(path: &Path) -> Result<MultiPolygon<f64>, PipelineError> {
    let content = std::fs::read_to_string(path)?;
    let boundary = parse_boundary(&content)?;
    log::info!(
        "Loaded boundary with {} part(s) from {}",
        boundary.0.len(),
        path.display()
    );
    Ok(boundary)
}

/// Parses a city boundary.
///
/// Accepts a bare `Polygon`/`MultiPolygon` geometry, a `Feature` holding
/// one, or a `FeatureCollection` (the first polygonal feature wins).
///
/// # Errors
///
/// Returns [`PipelineError::GeoJson`] for malformed JSON and
/// [`PipelineError::InvalidInput`] if no polygonal geometry is present.
pub fn parse_boundary(content: &str) -> Result<MultiPolygon<f64>, PipelineError> {
    let geojson: GeoJson = content.parse()?;

    let found = match geojson {
        GeoJson::Geometry(geometry) => to_multipolygon(geometry),
        GeoJson::Feature(feature) => feature.geometry.and_then(to_multipolygon),
        GeoJson::FeatureCollection(collection) => collection
            .features
            .into_iter()
            .filter_map(|feature| feature.geometry)
            .find_map(to_multipolygon),
    };

    found.ok_or_else(|| PipelineError::InvalidInput {
        message: "boundary contains no Polygon or MultiPolygon geometry".to_string(),
    })
}

fn to_multipolygon(geometry: geojson::Geometry) -> Option<MultiPolygon<f64>> {
    match geo::Geometry::<f64>::try_from(geometry).ok()? {
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        geo::Geometry::Polygon(p) => Some(MultiPolygon(vec![p])),
        _ => None,
    }
}

/// Reads points of interest from a `GeoJSON` file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a
/// `FeatureCollection`.
pub fn load_points(path: &Path) -> Result<Vec<Point>, PipelineError> {
    let content = std::fs::read_to_string(path)?;
    let points = parse_points(&content)?;
    log::info!("Loaded {} points from {}", points.len(), path.display());
    Ok(points)
}

/// Parses points of interest from a `FeatureCollection`.
///
/// Each feature needs a string `category` property. `name` and an id
/// (the feature id, or an `id`/`osm_id` property) are optional. Point
/// geometries are used as-is; any other geometry is reduced to its
/// centroid. Features without a category or usable geometry are skipped.
///
/// # Errors
///
/// Returns [`PipelineError::GeoJson`] for malformed JSON and
/// [`PipelineError::InvalidInput`] if the document is not a
/// `FeatureCollection`.
pub fn parse_points(content: &str) -> Result<Vec<Point>, PipelineError> {
    let GeoJson::FeatureCollection(collection) = content.parse::<GeoJson>()? else {
        return Err(PipelineError::InvalidInput {
            message: "points must be a FeatureCollection".to_string(),
        });
    };

    let total = collection.features.len();
    let points: Vec<Point> = collection
        .features
        .into_iter()
        .enumerate()
        .filter_map(|(index, feature)| {
            let point = to_point(feature);
            if point.is_none() {
                log::debug!("Skipping feature {index}: missing category or geometry");
            }
            point
        })
        .collect();

    if points.len() < total {
        log::warn!(
            "Skipped {} of {total} features without a category or usable geometry",
            total - points.len()
        );
    }

    Ok(points)
}

fn to_point(feature: Feature) -> Option<Point> {
    let category = string_property(&feature, "category")?;
    let name = string_property(&feature, "name");
    let source_id = feature_id(&feature);

    let geometry = geo::Geometry::<f64>::try_from(feature.geometry?).ok()?;
    let location = match geometry {
        geo::Geometry::Point(p) => p,
        other => other.centroid()?,
    };

    Some(Point {
        lat: location.y(),
        lon: location.x(),
        category,
        name,
        source_id,
    })
}

fn string_property(feature: &Feature, key: &str) -> Option<String> {
    feature
        .property(key)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn feature_id(feature: &Feature) -> Option<String> {
    if let Some(id) = &feature.id {
        return Some(match id {
            geojson::feature::Id::String(s) => s.clone(),
            geojson::feature::Id::Number(n) => n.to_string(),
        });
    }

    ["id", "osm_id"]
        .iter()
        .find_map(|key| match feature.property(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}
