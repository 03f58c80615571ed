//! In-memory spatial index over the parts of a city footprint.
//!
//! City boundaries often arrive as multipolygons with many parts (islands,
//! exclaves). The index keeps each part in an R-tree keyed by its bounding
//! box so a cell-versus-footprint test only runs exact `geo` predicates
//! against the parts whose envelopes overlap the cell.

use geo::{BoundingRect as _, Intersects as _, MultiPolygon, Polygon};
use rstar::{AABB, RTree, RTreeObject};

/// A footprint part stored in the R-tree.
struct PartEntry {
    envelope: AABB<[f64; 2]>,
    polygon: Polygon<f64>,
}

impl RTreeObject for PartEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// R-tree over footprint parts, answering "does this shape touch the
/// footprint?" queries.
pub struct FootprintIndex {
    parts: RTree<PartEntry>,
}

impl FootprintIndex {
    /// Builds the index from footprint parts. Parts without a bounding box
    /// (empty rings) are skipped.
    #[must_use]
    pub fn new(footprint: &MultiPolygon<f64>) -> Self {
        let entries: Vec<PartEntry> = footprint
            .0
            .iter()
            .filter_map(|polygon| {
                envelope_of(polygon).map(|envelope| PartEntry {
                    envelope,
                    polygon: polygon.clone(),
                })
            })
            .collect();

        log::debug!("Indexed {} footprint parts", entries.len());

        Self {
            parts: RTree::bulk_load(entries),
        }
    }

    /// Number of indexed parts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.size()
    }

    /// Returns `true` if no parts were indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.size() == 0
    }

    /// Returns `true` if `shape` intersects any footprint part (interior or
    /// boundary contact both count).
    #[must_use]
    pub fn intersects(&self, shape: &Polygon<f64>) -> bool {
        let Some(query_env) = envelope_of(shape) else {
            return false;
        };

        self.parts
            .locate_in_envelope_intersecting(&query_env)
            .any(|entry| entry.polygon.intersects(shape))
    }
}

/// Compute the bounding box envelope for a [`Polygon`].
fn envelope_of(polygon: &Polygon<f64>) -> Option<AABB<[f64; 2]>> {
    polygon
        .bounding_rect()
        .map(|rect| AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn square(x0: f64, y0: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: x0, y: y0),
            (x: x0 + size, y: y0),
            (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size),
        ]
    }

    #[test]
    fn finds_overlapping_part_among_many() {
        let footprint = MultiPolygon(vec![square(0.0, 0.0, 1.0), square(10.0, 10.0, 1.0)]);
        let index = FootprintIndex::new(&footprint);
        assert_eq!(index.len(), 2);

        assert!(index.intersects(&square(10.5, 10.5, 2.0)));
        assert!(index.intersects(&square(-0.5, -0.5, 0.6)));
        assert!(!index.intersects(&square(5.0, 5.0, 1.0)));
    }

    #[test]
    fn edge_contact_counts_as_intersection() {
        let footprint = MultiPolygon(vec![square(0.0, 0.0, 1.0)]);
        let index = FootprintIndex::new(&footprint);
        assert!(index.intersects(&square(1.0, 0.0, 1.0)));
    }

    #[test]
    fn shape_inside_a_hole_does_not_intersect() {
        let outer = square(0.0, 0.0, 10.0);
        let hole = square(4.0, 4.0, 2.0);
        let with_hole = Polygon::new(outer.exterior().clone(), vec![hole.exterior().clone()]);
        let index = FootprintIndex::new(&MultiPolygon(vec![with_hole]));

        assert!(!index.intersects(&square(4.5, 4.5, 0.5)));
        assert!(index.intersects(&square(1.0, 1.0, 0.5)));
    }

    #[test]
    fn empty_footprint_intersects_nothing() {
        let index = FootprintIndex::new(&MultiPolygon::<f64>(vec![]));
        assert!(index.is_empty());
        assert!(!index.intersects(&square(0.0, 0.0, 1.0)));
    }
}
