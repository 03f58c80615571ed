//! Polygon → cell set tiling.
//!
//! Covers a footprint with every cell whose boundary intersects it. Edge
//! cells are kept whole, so the cover slightly overshoots the boundary
//! instead of dropping border area.
//!
//! The cover is built by flood fill: seed with the cells containing the
//! footprint's vertices, then expand across [`Cell::adjacent`] while the
//! visited cell still touches the footprint. The cells touching a connected
//! part form a connected subgraph, so the fill reaches all of them.

use std::collections::{HashSet, VecDeque};

use geo::{Area as _, Coord, LineString, MultiPolygon, Polygon};
use rstar::{AABB, RTree, RTreeObject};

use crate::{Cell, CellSet, FootprintIndex, TilingError};

/// Tiles a (multi)polygon footprint at `resolution`.
///
/// Degenerate parts (fewer than three distinct vertices, zero area, or a
/// ring that touches itself) are skipped; a footprint with no usable parts
/// yields an empty [`CellSet`].
///
/// # Errors
///
/// * [`TilingError::InvalidResolution`] if `resolution` is out of range.
/// * [`TilingError::InvalidPolygon`] if a ring has properly crossing edges
///   or any coordinate is non-finite or outside WGS84 bounds.
pub fn tile(footprint: &MultiPolygon<f64>, resolution: u8) -> Result<CellSet, TilingError> {
    let res = crate::resolution(resolution)?;
    let parts = usable_parts(footprint)?;

    if parts.is_empty() {
        log::info!("Footprint has no usable area; returning an empty cell set");
        return Ok(CellSet::empty(res));
    }

    let footprint = MultiPolygon(parts);
    let index = FootprintIndex::new(&footprint);

    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();

    for polygon in &footprint.0 {
        for coord in polygon.exterior().coords() {
            if let Some(cell) = Cell::containing(coord.y, coord.x, res)
                && visited.insert(cell)
            {
                queue.push_back(cell);
            }
        }
    }

    let mut covered = Vec::new();
    while let Some(cell) = queue.pop_front() {
        if !index.intersects(&cell.boundary_polygon()) {
            continue;
        }
        covered.push(cell);
        for neighbor in cell.adjacent() {
            if visited.insert(neighbor) {
                queue.push_back(neighbor);
            }
        }
    }

    log::info!(
        "Tiled footprint ({} parts) into {} cells at resolution {resolution} ({} visited)",
        footprint.0.len(),
        covered.len(),
        visited.len()
    );

    Ok(CellSet::from_cells(res, covered))
}

/// Tiles a single polygon. See [`tile`].
///
/// # Errors
///
/// Same as [`tile`].
pub fn tile_polygon(polygon: &Polygon<f64>, resolution: u8) -> Result<CellSet, TilingError> {
    tile(&MultiPolygon(vec![polygon.clone()]), resolution)
}

/// Validates every part and returns the ones worth tiling.
fn usable_parts(footprint: &MultiPolygon<f64>) -> Result<Vec<Polygon<f64>>, TilingError> {
    let mut parts = Vec::with_capacity(footprint.0.len());

    for (i, polygon) in footprint.0.iter().enumerate() {
        check_coordinates(polygon)?;

        let Some(exterior) = clean_ring(polygon.exterior()) else {
            log::debug!("Skipping footprint part {i}: fewer than three distinct vertices");
            continue;
        };

        match ring_defect(&exterior) {
            Some(RingDefect::Crosses) => {
                return Err(TilingError::InvalidPolygon {
                    message: format!("exterior ring of part {i} intersects itself"),
                });
            }
            Some(RingDefect::Touches) => {
                log::warn!("Skipping footprint part {i}: exterior ring touches itself");
                continue;
            }
            None => {}
        }

        let mut interiors = Vec::with_capacity(polygon.interiors().len());
        for (j, hole) in polygon.interiors().iter().enumerate() {
            let Some(ring) = clean_ring(hole) else {
                continue;
            };
            match ring_defect(&ring) {
                Some(RingDefect::Crosses) => {
                    return Err(TilingError::InvalidPolygon {
                        message: format!("hole {j} of part {i} intersects itself"),
                    });
                }
                Some(RingDefect::Touches) => {
                    log::warn!("Dropping hole {j} of part {i}: ring touches itself");
                }
                None => interiors.push(LineString::from(ring)),
            }
        }

        let cleaned = Polygon::new(LineString::from(exterior), interiors);
        if cleaned.unsigned_area() <= 0.0 {
            log::debug!("Skipping footprint part {i}: zero area");
            continue;
        }

        parts.push(cleaned);
    }

    Ok(parts)
}

fn check_coordinates(polygon: &Polygon<f64>) -> Result<(), TilingError> {
    let rings = std::iter::once(polygon.exterior()).chain(polygon.interiors());
    for ring in rings {
        for coord in ring.coords() {
            let valid = coord.x.is_finite()
                && coord.y.is_finite()
                && (-180.0..=180.0).contains(&coord.x)
                && (-90.0..=90.0).contains(&coord.y);
            if !valid {
                return Err(TilingError::InvalidPolygon {
                    message: format!("coordinate ({}, {}) is not a WGS84 lon/lat", coord.x, coord.y),
                });
            }
        }
    }
    Ok(())
}

/// Drops consecutive duplicates and the closing vertex. Returns `None` if
/// fewer than three distinct vertices remain.
fn clean_ring(ring: &LineString<f64>) -> Option<Vec<Coord<f64>>> {
    let mut coords: Vec<Coord<f64>> = Vec::with_capacity(ring.0.len());
    for &coord in &ring.0 {
        if coords.last() != Some(&coord) {
            coords.push(coord);
        }
    }
    while coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    (coords.len() >= 3).then_some(coords)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingDefect {
    /// Two non-adjacent edges meet without crossing.
    Touches,
    /// Two edges properly cross.
    Crosses,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Contact {
    None,
    Touch,
    Proper,
}

struct SegmentEntry {
    index: usize,
    a: Coord<f64>,
    b: Coord<f64>,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for SegmentEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Finds the worst contact between non-adjacent edges of an open ring.
fn ring_defect(coords: &[Coord<f64>]) -> Option<RingDefect> {
    let n = coords.len();
    let segments: Vec<SegmentEntry> = (0..n)
        .map(|index| {
            let a = coords[index];
            let b = coords[(index + 1) % n];
            SegmentEntry {
                index,
                a,
                b,
                envelope: AABB::from_corners([a.x, a.y], [b.x, b.y]),
            }
        })
        .collect();
    let tree = RTree::bulk_load(segments);

    let mut touches = false;
    for segment in tree.iter() {
        for other in tree.locate_in_envelope_intersecting(&segment.envelope) {
            if other.index <= segment.index || edges_adjacent(segment.index, other.index, n) {
                continue;
            }
            match contact(segment.a, segment.b, other.a, other.b) {
                Contact::Proper => return Some(RingDefect::Crosses),
                Contact::Touch => touches = true,
                Contact::None => {}
            }
        }
    }

    touches.then_some(RingDefect::Touches)
}

/// `i < j`; edges share a vertex when consecutive or when they close the
/// ring.
const fn edges_adjacent(i: usize, j: usize, n: usize) -> bool {
    j == i + 1 || (i == 0 && j == n - 1)
}

/// Plain products keep shared-endpoint orientations exactly zero.
#[allow(clippy::suboptimal_flops)]
fn orient(p: Coord<f64>, q: Coord<f64>, r: Coord<f64>) -> f64 {
    (q.x - p.x) * (r.y - p.y) - (q.y - p.y) * (r.x - p.x)
}

fn within_box(p: Coord<f64>, q: Coord<f64>, r: Coord<f64>) -> bool {
    r.x >= p.x.min(q.x) && r.x <= p.x.max(q.x) && r.y >= p.y.min(q.y) && r.y <= p.y.max(q.y)
}

fn contact(a: Coord<f64>, b: Coord<f64>, c: Coord<f64>, d: Coord<f64>) -> Contact {
    let d1 = orient(c, d, a);
    let d2 = orient(c, d, b);
    let d3 = orient(a, b, c);
    let d4 = orient(a, b, d);

    let straddles = |x: f64, y: f64| (x > 0.0 && y < 0.0) || (x < 0.0 && y > 0.0);
    if straddles(d1, d2) && straddles(d3, d4) {
        return Contact::Proper;
    }

    let touching = (d1 == 0.0 && within_box(c, d, a))
        || (d2 == 0.0 && within_box(c, d, b))
        || (d3 == 0.0 && within_box(a, b, c))
        || (d4 == 0.0 && within_box(a, b, d));

    if touching { Contact::Touch } else { Contact::None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Intersects as _, polygon};

    fn rect(lon0: f64, lat0: f64, lon1: f64, lat1: f64) -> Polygon<f64> {
        polygon![
            (x: lon0, y: lat0),
            (x: lon1, y: lat0),
            (x: lon1, y: lat1),
            (x: lon0, y: lat1),
        ]
    }

    fn city() -> Polygon<f64> {
        rect(77.55, 12.95, 77.60, 13.00)
    }

    #[test]
    fn every_cell_touches_the_polygon() {
        let polygon = city();
        let cells = tile_polygon(&polygon, 8).unwrap();
        assert!(cells.len() > 10, "expected a real cover, got {}", cells.len());
        for cell in cells.iter() {
            assert_eq!(u8::from(cell.resolution()), 8);
            assert!(
                cell.boundary_polygon().intersects(&polygon),
                "{cell} does not intersect the footprint"
            );
        }
    }

    #[test]
    fn interior_points_are_covered() {
        let cells = tile_polygon(&city(), 8).unwrap();
        let res = cells.resolution();
        for i in 0..10 {
            for j in 0..10 {
                let lat = 0.005f64.mul_add(f64::from(j), 12.9525);
                let lon = 0.005f64.mul_add(f64::from(i), 77.5525);
                let cell = Cell::containing(lat, lon, res).unwrap();
                assert!(cells.contains(&cell), "({lat}, {lon}) fell outside the cover");
            }
        }
    }

    #[test]
    fn shrinking_never_adds_cells() {
        let outer = tile_polygon(&city(), 8).unwrap();
        let inner = tile_polygon(&rect(77.56, 12.96, 77.59, 12.99), 8).unwrap();
        assert!(inner.len() <= outer.len());
        for cell in inner.iter() {
            assert!(outer.contains(&cell));
        }
    }

    #[test]
    fn tiny_polygon_is_covered_by_its_cell() {
        let cell = Cell::containing(12.9716, 77.5946, h3o::Resolution::Eight).unwrap();
        let (lat, lon) = cell.center();
        let tiny = rect(lon - 1e-5, lat - 1e-5, lon + 1e-5, lat + 1e-5);
        let cells = tile_polygon(&tiny, 8).unwrap();
        assert_eq!(cells.iter().collect::<Vec<_>>(), vec![cell]);
    }

    #[test]
    fn separate_parts_are_tiled_independently() {
        let east = rect(77.70, 12.95, 77.72, 12.97);
        let west = rect(77.40, 12.95, 77.42, 12.97);
        let both = tile(&MultiPolygon(vec![east.clone(), west.clone()]), 8).unwrap();
        let east_cells = tile_polygon(&east, 8).unwrap();
        let west_cells = tile_polygon(&west, 8).unwrap();
        assert_eq!(both.len(), east_cells.len() + west_cells.len());
    }

    #[test]
    fn empty_footprint_yields_empty_set() {
        let cells = tile(&MultiPolygon(vec![]), 8).unwrap();
        assert!(cells.is_empty());
    }

    #[test]
    fn collinear_ring_yields_empty_set() {
        let line = polygon![(x: 77.5, y: 12.9), (x: 77.6, y: 12.9), (x: 77.7, y: 12.9)];
        assert!(tile_polygon(&line, 8).unwrap().is_empty());
    }

    #[test]
    fn self_touching_ring_yields_empty_set() {
        let figure_eight = polygon![
            (x: 77.50, y: 12.90),
            (x: 77.52, y: 12.90),
            (x: 77.51, y: 12.91),
            (x: 77.52, y: 12.92),
            (x: 77.50, y: 12.92),
            (x: 77.51, y: 12.91),
        ];
        assert!(tile_polygon(&figure_eight, 8).unwrap().is_empty());
    }

    #[test]
    fn bow_tie_is_rejected() {
        let bow_tie = polygon![
            (x: 77.50, y: 12.90),
            (x: 77.52, y: 12.92),
            (x: 77.52, y: 12.90),
            (x: 77.50, y: 12.92),
        ];
        assert!(matches!(
            tile_polygon(&bow_tie, 8),
            Err(TilingError::InvalidPolygon { .. })
        ));
    }

    #[test]
    fn non_finite_coordinates_are_rejected() {
        let broken = rect(77.5, f64::NAN, 77.6, 13.0);
        assert!(matches!(
            tile_polygon(&broken, 8),
            Err(TilingError::InvalidPolygon { .. })
        ));
    }

    #[test]
    fn out_of_range_resolution_is_rejected() {
        assert!(matches!(
            tile_polygon(&city(), 16),
            Err(TilingError::InvalidResolution { value: 16 })
        ));
    }

    #[test]
    fn detects_contact_kinds() {
        let c = |x: f64, y: f64| Coord { x, y };
        assert_eq!(
            contact(c(0.0, 0.0), c(1.0, 1.0), c(0.0, 1.0), c(1.0, 0.0)),
            Contact::Proper
        );
        assert_eq!(
            contact(c(0.0, 0.0), c(1.0, 0.0), c(0.5, 0.0), c(0.5, 1.0)),
            Contact::Touch
        );
        assert_eq!(
            contact(c(0.0, 0.0), c(1.0, 0.0), c(0.0, 1.0), c(1.0, 1.0)),
            Contact::None
        );
    }
}
