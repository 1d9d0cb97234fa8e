//! Spatial candidate index over the cells of one closed span.
//!
//! Cells are sorted by the left edge of their region. A query computes a
//! search window around the query region, binary-searches the first cell
//! whose left edge reaches the window and scans forward while left edges stay
//! inside it, so a lookup costs `O(log n + m)` for `m` scanned cells.
//!
//! Windows are scaled by the reference symbol size. The upward and downward
//! windows are deliberately lopsided (a quarter symbol of overlap against
//! three symbols of gap).

use crate::chart::{CellId, Chart};
use crate::reference::ReferenceSize;
use crate::region::Region;

/// Where to look for partners of a query region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// To the right, on roughly the same rows.
    Horizontal,
    /// Below, starting near the target's bottom edge.
    Down,
    /// Above, ending near the target's top edge.
    Up,
    /// Inside the target, excluding its top-left corner.
    Inside,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Horizontal,
        Direction::Down,
        Direction::Up,
        Direction::Inside,
    ];
}

/// Vertical acceptance test of a window.
#[derive(Clone, Copy, Debug)]
enum Rows {
    /// Candidate rows `[y, t]` intersect `[lo, hi]`.
    Overlap,
    /// Candidate top edge lies in `[lo, hi]`.
    Top,
    /// Candidate bottom edge lies in `[lo, hi]`.
    Bottom,
}

/// Search window: left edges in `[x_min, x_max]` and a row test.
#[derive(Clone, Copy, Debug)]
struct Window {
    x_min: i32,
    x_max: i32,
    y_lo: i32,
    y_hi: i32,
    rows: Rows,
}

impl Window {
    fn new(target: &Region, direction: Direction, r: ReferenceSize) -> Self {
        let (rx, ry) = (r.rx, r.ry);
        match direction {
            Direction::Horizontal => Window {
                x_min: (f64::from(target.s) - f64::from(rx) * 0.75) as i32,
                x_max: target.s + rx * 3,
                y_lo: target.y - ry / 2,
                y_hi: target.t + ry / 2,
                rows: Rows::Overlap,
            },
            Direction::Down => Window {
                x_min: target.x - rx,
                x_max: target.s + rx,
                y_lo: target.t - ry / 4,
                y_hi: target.t + ry * 3,
                rows: Rows::Top,
            },
            Direction::Up => Window {
                x_min: target.x - rx,
                x_max: target.s + rx,
                y_lo: target.y - ry * 3,
                y_hi: target.y + ry / 4,
                rows: Rows::Bottom,
            },
            Direction::Inside => Window {
                x_min: target.x + 1,
                x_max: target.s + rx,
                y_lo: target.y + 1,
                y_hi: target.t + ry,
                rows: Rows::Overlap,
            },
        }
    }

    fn accepts_rows(&self, c: &Region) -> bool {
        match self.rows {
            Rows::Overlap => c.y <= self.y_hi && c.t >= self.y_lo,
            Rows::Top => c.y >= self.y_lo && c.y <= self.y_hi,
            Rows::Bottom => c.t >= self.y_lo && c.t <= self.y_hi,
        }
    }

    fn accepts(&self, c: &Region) -> bool {
        c.x >= self.x_min && c.x <= self.x_max && self.accepts_rows(c)
    }
}

/// Immutable index of one span's cells, sorted by left edge.
#[derive(Clone, Debug)]
pub struct SpatialIndex {
    entries: Vec<(Region, CellId)>,
    reference: ReferenceSize,
}

impl SpatialIndex {
    /// Index an arbitrary set of cells.
    pub fn new(mut entries: Vec<(Region, CellId)>, reference: ReferenceSize) -> Self {
        entries.sort_by_key(|(region, _)| region.x);
        SpatialIndex { entries, reference }
    }

    /// Index every cell of a chart span.
    pub fn build(chart: &Chart, span: usize, reference: ReferenceSize) -> Self {
        let entries = chart
            .span(span)
            .map(|id| (chart.cell(id).region, id))
            .collect();
        SpatialIndex::new(entries, reference)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reference(&self) -> ReferenceSize {
        self.reference
    }

    /// Cells in the window of `direction` around `target`, in left-edge order.
    pub fn query(&self, target: &Region, direction: Direction) -> Vec<CellId> {
        let window = Window::new(target, direction, self.reference);
        let start = self.entries.partition_point(|(r, _)| r.x < window.x_min);

        self.entries[start..]
            .iter()
            .take_while(|(r, _)| r.x <= window.x_max)
            .filter(|(r, _)| window.accepts_rows(r))
            .map(|&(_, id)| id)
            .collect()
    }

    /// Same result set as [`query`](Self::query) by scanning every cell.
    pub fn query_linear(&self, target: &Region, direction: Direction) -> Vec<CellId> {
        let window = Window::new(target, direction, self.reference);
        self.entries
            .iter()
            .filter(|(r, _)| window.accepts(r))
            .map(|&(_, id)| id)
            .collect()
    }
}
