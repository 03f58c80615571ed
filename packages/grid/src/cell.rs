//! Cell and cell-set value types.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use geo::{Coord, LineString, Polygon};
use h3o::{CellIndex, LatLng, Resolution};

use crate::TilingError;

/// One hexagonal (occasionally pentagonal) region of the grid at a fixed
/// resolution.
///
/// Cells order by their 64-bit index, which keeps every collection built
/// from them deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cell(CellIndex);

impl Cell {
    /// Returns the cell containing a WGS84 coordinate.
    ///
    /// Points exactly on a shared edge go to whichever cell the grid's own
    /// lookup returns. Returns `None` for non-finite coordinates.
    #[must_use]
    pub fn containing(lat: f64, lon: f64, resolution: Resolution) -> Option<Self> {
        LatLng::new(lat, lon)
            .ok()
            .map(|coord| Self(coord.to_cell(resolution)))
    }

    /// The underlying grid index.
    #[must_use]
    pub const fn index(self) -> CellIndex {
        self.0
    }

    /// The cell's resolution.
    #[must_use]
    pub fn resolution(self) -> Resolution {
        self.0.resolution()
    }

    /// Returns `true` for the twelve pentagons present at each resolution.
    #[must_use]
    pub fn is_pentagon(self) -> bool {
        self.0.is_pentagon()
    }

    /// The cell center as `(lat, lon)`.
    #[must_use]
    pub fn center(self) -> (f64, f64) {
        let center = LatLng::from(self.0);
        (center.lat(), center.lng())
    }

    /// The ordered boundary ring as `(lat, lon)` vertices (six for
    /// hexagons, five for pentagons, more where a cell crosses an
    /// icosahedron edge). The ring is not explicitly closed.
    #[must_use]
    pub fn boundary(self) -> Vec<(f64, f64)> {
        self.0
            .boundary()
            .iter()
            .map(|vertex| (vertex.lat(), vertex.lng()))
            .collect()
    }

    /// The boundary as a closed polygon with `x = lon`, `y = lat`, ready
    /// for `GeoJSON` serialization and `geo` predicates.
    #[must_use]
    pub fn boundary_polygon(self) -> Polygon<f64> {
        let ring: Vec<Coord<f64>> = self
            .0
            .boundary()
            .iter()
            .map(|vertex| Coord {
                x: vertex.lng(),
                y: vertex.lat(),
            })
            .collect();
        Polygon::new(LineString::from(ring), vec![])
    }

    /// Cells sharing an edge with this one, sorted.
    #[must_use]
    pub fn adjacent(self) -> Vec<Self> {
        let mut cells: Vec<Self> = self
            .0
            .grid_disk::<Vec<_>>(1)
            .into_iter()
            .filter(|&index| index != self.0)
            .map(Self)
            .collect();
        cells.sort_unstable();
        cells
    }

    /// Cells grouped by hop distance, from `0` (the cell itself) out to
    /// `depth`. Entry `k` holds exactly the cells `k` hops away.
    #[must_use]
    pub fn rings(self, depth: u32) -> Vec<Vec<Self>> {
        let mut rings = vec![vec![self]];
        let mut visited = BTreeSet::from([self]);

        for _ in 0..depth {
            let mut next = BTreeSet::new();
            if let Some(frontier) = rings.last() {
                for cell in frontier {
                    for neighbor in cell.adjacent() {
                        if visited.insert(neighbor) {
                            next.insert(neighbor);
                        }
                    }
                }
            }
            rings.push(next.into_iter().collect());
        }

        rings
    }

    /// Cells exactly `k` hops away. `ring(0)` is `{self}`.
    #[must_use]
    pub fn ring(self, k: u32) -> BTreeSet<Self> {
        self.rings(k)
            .pop()
            .map(|ring| ring.into_iter().collect())
            .unwrap_or_default()
    }

    /// Cells within `k` hops, including `self`. `neighbors(0)` is `{self}`.
    #[must_use]
    pub fn neighbors(self, k: u32) -> BTreeSet<Self> {
        self.rings(k).into_iter().flatten().collect()
    }
}

impl PartialOrd for Cell {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cell {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        u64::from(self.0).cmp(&u64::from(other.0))
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Cell {
    type Err = TilingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<CellIndex>()
            .map(Self)
            .map_err(|_| TilingError::InvalidCellId { id: s.to_string() })
    }
}

impl From<CellIndex> for Cell {
    fn from(index: CellIndex) -> Self {
        Self(index)
    }
}

/// The set of cells covering a footprint at one resolution.
///
/// Iteration is in cell-index order, so output derived from a `CellSet`
/// is stable across runs over the same footprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellSet {
    resolution: Resolution,
    cells: BTreeSet<Cell>,
}

impl CellSet {
    /// An empty set ("no coverage area").
    #[must_use]
    pub const fn empty(resolution: Resolution) -> Self {
        Self {
            resolution,
            cells: BTreeSet::new(),
        }
    }

    /// Builds a set from cells, dropping any whose resolution differs.
    #[must_use]
    pub fn from_cells(resolution: Resolution, cells: impl IntoIterator<Item = Cell>) -> Self {
        let cells = cells
            .into_iter()
            .filter(|cell| {
                let matches = cell.resolution() == resolution;
                if !matches {
                    log::warn!("Dropping cell {cell} with mismatched resolution");
                }
                matches
            })
            .collect();
        Self { resolution, cells }
    }

    /// The resolution every cell in the set shares.
    #[must_use]
    pub const fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns `true` if the set has no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Returns `true` if `cell` is part of the set.
    #[must_use]
    pub fn contains(&self, cell: &Cell) -> bool {
        self.cells.contains(cell)
    }

    /// Iterates cells in index order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = Cell> + '_ {
        self.cells.iter().copied()
    }
}

impl<'a> IntoIterator for &'a CellSet {
    type Item = &'a Cell;
    type IntoIter = std::collections::btree_set::Iter<'a, Cell>;

    fn into_iter(self) -> Self::IntoIter {
        self.cells.iter()
    }
}
