//! Reference symbol size.
//!
//! All distance and alignment tolerances of the relations are expressed in
//! units of a typical glyph box `(RX, RY)` estimated from the single
//! components of a sample, which makes parsing independent of resolution.

use crate::region::Region;
use std::fmt;

/// Typical glyph width and height in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReferenceSize {
    pub rx: i32,
    pub ry: i32,
}

impl ReferenceSize {
    pub fn new(rx: i32, ry: i32) -> Self {
        ReferenceSize { rx, ry }
    }

    /// Estimate the reference size from single-component regions.
    ///
    /// Three estimates are combined by taking the larger value per axis:
    /// the mean box of roughly square regions (aspect ratio in `[0.5, 1.5]`,
    /// or of all regions when none qualifies), the upper median box, and a
    /// square of side `0.9 * round(sqrt(mean area))`. Both sides are at
    /// least one pixel.
    pub fn estimate(regions: &[Region]) -> Self {
        if regions.is_empty() {
            return ReferenceSize::new(1, 1);
        }

        let mut widths = Vec::with_capacity(regions.len());
        let mut heights = Vec::with_capacity(regions.len());
        let mut area_sum = 0.0f32;
        let (mut sum_x, mut sum_y, mut square) = (0i64, 0i64, 0i64);

        for r in regions {
            let (w, h) = (r.width(), r.height());
            widths.push(w);
            heights.push(h);
            area_sum += (w * h) as f32;

            let ratio = w as f32 / h as f32;
            if (0.5..=1.5).contains(&ratio) {
                sum_x += i64::from(w);
                sum_y += i64::from(h);
                square += 1;
            }
        }

        let (mean_x, mean_y) = if square > 0 {
            (sum_x / square, sum_y / square)
        } else {
            let n = regions.len() as i64;
            (
                widths.iter().map(|&w| i64::from(w)).sum::<i64>() / n,
                heights.iter().map(|&h| i64::from(h)).sum::<i64>() / n,
            )
        };

        widths.sort_unstable();
        heights.sort_unstable();
        let median_x = widths[widths.len() / 2];
        let median_y = heights[heights.len() / 2];

        let mean_area = area_sum / regions.len() as f32;
        let side = (f64::from(mean_area.sqrt()) + 0.5) as i32;
        let side = (f64::from(side) * 0.9) as i32;

        ReferenceSize {
            rx: (mean_x as i32).max(median_x).max(side).max(1),
            ry: (mean_y as i32).max(median_y).max(side).max(1),
        }
    }
}

impl fmt::Display for ReferenceSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.rx, self.ry)
    }
}
