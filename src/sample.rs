//! Input samples and their segmentation into connected components.
//!
//! The parser consumes a sample through the [`Segmentation`] trait: the number
//! of primitive components, their bounding boxes, normalised appearance
//! features for one or two components, and which components lie near a given
//! one. [`Bitmap`] implements it for grey images read from PGM files.

use crate::classifier::{FEATURE_LEN, FEATURE_SIDE};
use crate::region::Region;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Grey level at and above which a pixel is background.
const BACKGROUND: u8 = 255;

/// Errors reading an input image.
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("cannot read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("image data truncated: expected {expected} pixels, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("invalid image header: {0}")]
    InvalidHeader(String),
}

/// Vertical centroid estimates of a glyph.
///
/// `mean` is the plain row centroid. `ascender` and `descender` weight rows
/// linearly from 0.1 to 1.9 going down (resp. up) the box, which pulls the
/// estimate towards the bottom (resp. top) for glyphs with a long stem.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Centroids {
    pub ascender: i32,
    pub mean: i32,
    pub descender: i32,
}

/// Appearance features of one or more components.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionFeatures {
    /// `FEATURE_SIDE` x `FEATURE_SIDE` grey values, row-major.
    pub pixels: Vec<u8>,
    pub centroids: Centroids,
}

/// A sample split into primitive components.
pub trait Segmentation {
    /// Number of primitive components.
    fn component_count(&self) -> usize;

    /// Bounding box of one component.
    fn component_box(&self, component: usize) -> Region;

    /// Bounding box covering several components.
    fn bounding_box(&self, components: &[usize]) -> Region {
        components
            .iter()
            .map(|&c| self.component_box(c))
            .reduce(|a, b| a.union(&b))
            .unwrap_or_default()
    }

    /// Normalised bitmap and centroids of the union of `components`.
    fn region_features(&self, components: &[usize]) -> RegionFeatures;

    /// Other components with a pixel inside `component`'s box grown by
    /// `dx` horizontally and `dy` vertically.
    fn nearby_components(&self, component: usize, dx: i32, dy: i32) -> Vec<usize>;
}

/// Union-find over pixel indices.
struct DisjointSets {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSets {
    fn new(len: usize) -> Self {
        DisjointSets {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[x] != root {
            let next = self.parent[x];
            self.parent[x] = root;
            x = next;
        }
        root
    }

    fn merge(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Grey bitmap segmented into 8-connected foreground components.
#[derive(Clone, Debug)]
pub struct Bitmap {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
    /// Component of each pixel, row-major; `None` for background.
    labels: Vec<Option<u32>>,
    boxes: Vec<Region>,
}

impl Bitmap {
    /// Segment a row-major grey image.
    pub fn from_pixels(width: usize, height: usize, pixels: Vec<u8>) -> Result<Self, SampleError> {
        let expected = width
            .checked_mul(height)
            .ok_or_else(|| SampleError::InvalidHeader(format!("size {} x {}", width, height)))?;
        if pixels.len() != expected {
            return Err(SampleError::Truncated {
                expected,
                found: pixels.len(),
            });
        }

        let foreground = |x: usize, y: usize| pixels[y * width + x] < BACKGROUND;
        let mut sets = DisjointSets::new(pixels.len());

        for y in 0..height {
            for x in 0..width {
                if !foreground(x, y) {
                    continue;
                }
                // Backward neighbours suffice: the forward ones visit us later.
                for (dx, dy) in [(-1i64, -1i64), (0, -1), (1, -1), (-1, 0)] {
                    let px = x as i64 + dx;
                    let py = y as i64 + dy;
                    if px < 0 || py < 0 || px >= width as i64 {
                        continue;
                    }
                    let (px, py) = (px as usize, py as usize);
                    if foreground(px, py) {
                        sets.merge(y * width + x, py * width + px);
                    }
                }
            }
        }

        // Number components in column-major order of first appearance.
        let mut labels = vec![None; pixels.len()];
        let mut root_label = vec![u32::MAX; pixels.len()];
        let mut boxes: Vec<Region> = Vec::new();

        for x in 0..width {
            for y in 0..height {
                if !foreground(x, y) {
                    continue;
                }
                let idx = y * width + x;
                let root = sets.find(idx);
                let (xi, yi) = (x as i32, y as i32);

                if root_label[root] == u32::MAX {
                    root_label[root] = boxes.len() as u32;
                    boxes.push(Region::new(xi, yi, xi, yi));
                } else {
                    let b = &mut boxes[root_label[root] as usize];
                    b.x = b.x.min(xi);
                    b.y = b.y.min(yi);
                    b.s = b.s.max(xi);
                    b.t = b.t.max(yi);
                }
                labels[idx] = Some(root_label[root]);
            }
        }

        Ok(Bitmap {
            width,
            height,
            pixels,
            labels,
            boxes,
        })
    }

    /// Decode a binary (`P5`) or ASCII (`P2`) PGM image.
    pub fn from_pgm(data: &[u8]) -> Result<Self, SampleError> {
        let mut header = PgmHeader { data, pos: 0 };

        let magic = header.token()?;
        let ascii = match magic.as_str() {
            "P2" => true,
            "P5" => false,
            other => return Err(SampleError::UnsupportedFormat(other.to_string())),
        };

        let width = header.number("width")?;
        let height = header.number("height")?;
        let maxval = header.number("maxval")?;
        if maxval == 0 || maxval > 65535 {
            return Err(SampleError::InvalidHeader(format!("maxval {}", maxval)));
        }

        let expected = width
            .checked_mul(height)
            .ok_or_else(|| SampleError::InvalidHeader(format!("size {} x {}", width, height)))?;
        let scale = |v: usize| -> u8 {
            if maxval == 255 {
                v.min(255) as u8
            } else {
                ((v.min(maxval) * 255 + maxval / 2) / maxval) as u8
            }
        };

        let pixels: Vec<u8> = if ascii {
            let mut pixels = Vec::with_capacity(expected);
            while pixels.len() < expected {
                match header.token() {
                    Ok(tok) => {
                        let v = tok
                            .parse::<usize>()
                            .map_err(|_| SampleError::InvalidHeader(format!("pixel '{}'", tok)))?;
                        pixels.push(scale(v));
                    }
                    Err(_) => break,
                }
            }
            pixels
        } else {
            // Exactly one whitespace byte separates the header from the raster.
            let raster = &data[(header.pos + 1).min(data.len())..];
            if maxval < 256 {
                raster.iter().take(expected).map(|&v| scale(usize::from(v))).collect()
            } else {
                raster
                    .chunks_exact(2)
                    .take(expected)
                    .map(|pair| scale(usize::from(u16::from_be_bytes([pair[0], pair[1]]))))
                    .collect()
            }
        };

        if pixels.len() < expected {
            return Err(SampleError::Truncated {
                expected,
                found: pixels.len(),
            });
        }

        Bitmap::from_pixels(width, height, pixels)
    }

    /// Read and segment a PGM file.
    pub fn open(path: &Path) -> Result<Self, SampleError> {
        Bitmap::from_pgm(&fs::read(path)?)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Grey value at `(x, y)`.
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.pixels[y * self.width + x]
    }

    fn is_member(&self, x: i32, y: i32, components: &[usize]) -> bool {
        match self.labels[y as usize * self.width + x as usize] {
            Some(label) => components.contains(&(label as usize)),
            None => false,
        }
    }

    fn centroids(&self, region: Region, components: &[usize]) -> Centroids {
        let step = 1.8f32 / (region.t - region.y) as f32;
        let mut w_asc = 0.1f32;
        let mut w_des = 1.9f32;
        let (mut asc, mut des) = (0.0f32, 0.0f32);
        let mut sum: i64 = 0;
        let mut n: i64 = 0;

        for y in region.y..=region.t {
            for x in region.x..=region.s {
                if self.is_member(x, y, components) {
                    n += 1;
                    asc += y as f32 * w_asc;
                    des += y as f32 * w_des;
                    sum += i64::from(y);
                }
            }
            w_asc += step;
            w_des -= step;
        }

        if n == 0 {
            let mid = (region.y + region.t) / 2;
            return Centroids {
                ascender: mid,
                mean: mid,
                descender: mid,
            };
        }

        Centroids {
            ascender: (asc / n as f32) as i32,
            mean: (sum / n) as i32,
            descender: (des / n as f32) as i32,
        }
    }

    /// Area-average the region down (or up) to the feature grid, whitening
    /// every pixel that does not belong to `components`.
    fn normalise(&self, region: Region, components: &[usize]) -> Vec<u8> {
        let cols = axis_cells(region.width() as usize + 1);
        let rows = axis_cells(region.height() as usize + 1);
        let mut out = Vec::with_capacity(FEATURE_LEN);

        for row in &rows {
            for col in &cols {
                let mut total = 0.0f64;
                let mut weight = 0.0f64;
                for &(dy, wy) in row {
                    for &(dx, wx) in col {
                        let x = region.x + dx as i32;
                        let y = region.y + dy as i32;
                        let value = if self.is_member(x, y, components) {
                            self.get(x as usize, y as usize)
                        } else {
                            BACKGROUND
                        };
                        total += f64::from(value) * wx * wy;
                        weight += wx * wy;
                    }
                }
                let grey = if weight > 0.0 {
                    total / weight
                } else {
                    f64::from(BACKGROUND)
                };
                out.push((grey + 0.5).min(255.0) as u8);
            }
        }
        out
    }
}

/// For each of the `FEATURE_SIDE` output cells along an axis of `len`
/// source pixels, the source offsets it covers and the covered fraction.
fn axis_cells(len: usize) -> Vec<Vec<(usize, f64)>> {
    let scale = len as f64 / FEATURE_SIDE as f64;
    (0..FEATURE_SIDE)
        .map(|i| {
            let lo = i as f64 * scale;
            let hi = (i + 1) as f64 * scale;
            let first = lo.floor() as usize;
            let last = (hi.ceil() as usize).min(len);
            (first..last)
                .map(|p| {
                    let cover = hi.min((p + 1) as f64) - lo.max(p as f64);
                    (p, cover)
                })
                .filter(|&(_, cover)| cover > 0.0)
                .collect()
        })
        .collect()
}

impl Segmentation for Bitmap {
    fn component_count(&self) -> usize {
        self.boxes.len()
    }

    fn component_box(&self, component: usize) -> Region {
        self.boxes[component]
    }

    fn region_features(&self, components: &[usize]) -> RegionFeatures {
        let region = self.bounding_box(components);
        RegionFeatures {
            pixels: self.normalise(region, components),
            centroids: self.centroids(region, components),
        }
    }

    fn nearby_components(&self, component: usize, dx: i32, dy: i32) -> Vec<usize> {
        let b = self.boxes[component];
        let x0 = (b.x - dx).max(0);
        let y0 = (b.y - dy).max(0);
        let x1 = (b.s + dx).min(self.width as i32);
        let y1 = (b.t + dy).min(self.height as i32);

        let mut found = Vec::new();
        for x in x0..x1 {
            for y in y0..y1 {
                if let Some(label) = self.labels[y as usize * self.width + x as usize] {
                    let label = label as usize;
                    if label != component && !found.contains(&label) {
                        found.push(label);
                    }
                }
            }
        }
        found
    }
}

impl fmt::Display for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sample ({} x {})", self.width, self.height)?;
        writeln!(f, "Number of components: {}", self.boxes.len())?;
        for (i, b) in self.boxes.iter().enumerate() {
            writeln!(f, "Component {}: ({},{})-({},{})", i, b.x, b.y, b.s, b.t)?;
        }
        Ok(())
    }
}

/// Cursor over the whitespace/comment separated PGM header.
struct PgmHeader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl PgmHeader<'_> {
    fn token(&mut self) -> Result<String, SampleError> {
        loop {
            match self.data.get(self.pos) {
                Some(b'#') => {
                    while self.data.get(self.pos).is_some_and(|&c| c != b'\n') {
                        self.pos += 1;
                    }
                }
                Some(c) if c.is_ascii_whitespace() => self.pos += 1,
                Some(_) => break,
                None => return Err(SampleError::InvalidHeader("unexpected end of data".into())),
            }
        }
        let start = self.pos;
        while self
            .data
            .get(self.pos)
            .is_some_and(|c| !c.is_ascii_whitespace())
        {
            self.pos += 1;
        }
        Ok(String::from_utf8_lossy(&self.data[start..self.pos]).into_owned())
    }

    fn number(&mut self, what: &str) -> Result<usize, SampleError> {
        let tok = self.token()?;
        tok.parse()
            .map_err(|_| SampleError::InvalidHeader(format!("{} '{}'", what, tok)))
    }
}
