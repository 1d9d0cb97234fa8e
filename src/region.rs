//! Bounding regions and baselines.
//!
//! A region is an inclusive pixel rectangle `(x, y)-(s, t)`. Baselines are the
//! upper (superscript), central (horizontal) and lower (subscript) reference
//! lines of a hypothesis. They are kept separately for the left and right edge
//! so a composite can expose different lines on either side (e.g. `x^2` keeps
//! the base line of `x` on the left and the raised line on the right).

use crate::classifier::SymbolType;
use crate::sample::Centroids;
use std::fmt;

/// Inclusive bounding box `(x, y)-(s, t)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub s: i32,
    pub t: i32,
}

impl Region {
    pub fn new(x: i32, y: i32, s: i32, t: i32) -> Self {
        Region { x, y, s, t }
    }

    /// Horizontal extent `s - x`.
    pub fn width(&self) -> i32 {
        self.s - self.x
    }

    /// Vertical extent `t - y`.
    pub fn height(&self) -> i32 {
        self.t - self.y
    }

    /// Number of pixels covered, counting both edges.
    pub fn pixel_area(&self) -> i64 {
        i64::from(self.s - self.x + 1) * i64::from(self.t - self.y + 1)
    }

    /// Smallest region covering both.
    pub fn union(&self, other: &Region) -> Region {
        Region {
            x: self.x.min(other.x),
            y: self.y.min(other.y),
            s: self.s.max(other.s),
            t: self.t.max(other.t),
        }
    }

    /// Fraction of this region's pixel area that is covered by `other`.
    pub fn overlap(&self, other: &Region) -> f32 {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let s = self.s.min(other.s);
        let t = self.t.min(other.t);

        if s >= x && t >= y {
            let covered = i64::from(s - x + 1) * i64::from(t - y + 1);
            covered as f32 / self.pixel_area() as f32
        } else {
            0.0
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}_{}", self.x, self.y, self.s, self.t)
    }
}

/// Upper, central and lower reference lines at one edge of a hypothesis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Lines {
    pub sup: i32,
    pub hor: i32,
    pub sub: i32,
}

/// Reference lines at the left and right edge of a hypothesis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Baselines {
    pub left: Lines,
    pub right: Lines,
}

impl Baselines {
    /// Same lines on both edges.
    pub fn uniform(lines: Lines) -> Self {
        Baselines {
            left: lines,
            right: lines,
        }
    }

    /// Baselines of a single glyph.
    ///
    /// The central line is the vertical centroid matching the glyph's type:
    /// the plain mean for normal glyphs, the top-weighted estimate for
    /// ascenders and the bottom-weighted estimate for descenders. The upper
    /// and lower lines are placed between the centre and the box edges.
    pub fn for_glyph(region: Region, kind: SymbolType, centroids: Centroids) -> Self {
        let cen = match kind {
            SymbolType::Normal => centroids.mean,
            SymbolType::Ascender => centroids.ascender,
            SymbolType::Descender => centroids.descender,
        };

        let sup = if kind == SymbolType::Ascender {
            (region.y + cen) / 2
        } else {
            (f64::from(region.y) + 0.1 * f64::from(cen - region.y)) as i32
        };

        let sub = if kind == SymbolType::Descender {
            (cen + region.t) / 2
        } else {
            (f64::from(cen) + 0.9 * f64::from(region.t - cen)) as i32
        };

        Baselines::uniform(Lines { sup, hor: cen, sub })
    }
}
