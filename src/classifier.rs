//! Glyph classification.
//!
//! The parser only needs ranked class hypotheses for a normalised glyph
//! bitmap, so classification sits behind the [`Classifier`] trait.
//! [`NearestNeighbor`] is the prototype-matching classifier used by grammar
//! files: every class keeps its closest prototype and the distance is mapped
//! to a pseudo-posterior.

use crate::loader::{read_text, LoadError, LoadResult};
use log::{debug, warn};
use rustc_hash::FxHashMap;
use std::path::Path;

/// Side of the square feature grid.
pub const FEATURE_SIDE: usize = 15;

/// Number of grey values in a feature vector.
pub const FEATURE_LEN: usize = FEATURE_SIDE * FEATURE_SIDE;

/// Scale of the distance-to-posterior mapping `exp(-d / POSTERIOR_SCALE)`.
const POSTERIOR_SCALE: f64 = 3_500_000.0;

/// Index of a classifier class.
pub type ClassId = usize;

/// Vertical extent class of a glyph, used to pick its central baseline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SymbolType {
    /// Sits between the base and mean lines (`a`, `x`, `+`).
    #[default]
    Normal,
    /// Rises above the mean line (`b`, `d`, digits).
    Ascender,
    /// Drops below the base line (`g`, `p`, `y`).
    Descender,
}

impl SymbolType {
    /// Parse the one-letter code used in symbol-type files.
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'n' => Some(SymbolType::Normal),
            'a' => Some(SymbolType::Ascender),
            'd' => Some(SymbolType::Descender),
            _ => None,
        }
    }
}

/// Maps a normalised glyph to ranked class hypotheses.
pub trait Classifier {
    /// Number of known classes. Class ids are `0..class_count()`.
    fn class_count(&self) -> usize;

    /// Id of a class by name.
    fn class_id(&self, name: &str) -> Option<ClassId>;

    /// Name of a class.
    fn class_name(&self, class: ClassId) -> &str;

    /// Vertical extent class of a glyph class.
    fn symbol_type(&self, class: ClassId) -> SymbolType;

    /// Up to `top_n` `(class, posterior)` pairs, best first.
    fn classify(&self, features: &[u8], top_n: usize) -> Vec<(ClassId, f64)>;
}

/// One labelled training glyph.
#[derive(Debug, Clone)]
struct Prototype {
    class: ClassId,
    pixels: Box<[i32]>,
}

/// Nearest-prototype classifier over 15x15 grey bitmaps.
#[derive(Debug, Clone, Default)]
pub struct NearestNeighbor {
    prototypes: Vec<Prototype>,
    names: Vec<String>,
    ids: FxHashMap<String, ClassId>,
    types: Vec<SymbolType>,
}

impl NearestNeighbor {
    /// Create an empty classifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a class name, returning its id.
    pub fn add_class(&mut self, name: &str) -> ClassId {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len();
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        self.types.push(SymbolType::Normal);
        id
    }

    /// Add a training glyph. `pixels` must hold `FEATURE_LEN` values.
    pub fn add_prototype(&mut self, class: &str, pixels: &[i32]) {
        debug_assert_eq!(pixels.len(), FEATURE_LEN);
        let class = self.add_class(class);
        self.prototypes.push(Prototype {
            class,
            pixels: pixels.into(),
        });
    }

    /// Set the symbol type of a known class.
    pub fn set_symbol_type(&mut self, class: ClassId, kind: SymbolType) {
        self.types[class] = kind;
    }

    /// Number of training glyphs.
    pub fn prototype_count(&self) -> usize {
        self.prototypes.len()
    }

    /// Load a prototype database and its symbol-type annotations.
    pub fn load(database: &Path, types: &Path) -> LoadResult<Self> {
        let mut classifier = Self::from_database(&read_text(database)?)?;
        classifier.read_symbol_types(&read_text(types)?)?;
        debug!(
            "loaded {} prototypes over {} classes from {}",
            classifier.prototype_count(),
            classifier.class_count(),
            database.display()
        );
        Ok(classifier)
    }

    /// Parse a prototype database: a sample count followed by that many
    /// samples, each a class name and `FEATURE_LEN` grey values.
    pub fn from_database(text: &str) -> LoadResult<Self> {
        let mut tokens = text
            .lines()
            .enumerate()
            .flat_map(|(i, line)| line.split_whitespace().map(move |tok| (i + 1, tok)));

        let (line, count) = tokens.next().ok_or(LoadError::ClassifierDatabase {
            line: 1,
            reason: "missing sample count".to_string(),
        })?;
        let count: usize = count.parse().map_err(|_| LoadError::InvalidNumber {
            line,
            text: count.to_string(),
        })?;

        let mut classifier = NearestNeighbor::new();
        let mut pixels = Vec::with_capacity(FEATURE_LEN);

        for sample in 0..count {
            let (_, class) = tokens.next().ok_or_else(|| LoadError::ClassifierDatabase {
                line,
                reason: format!("expected {} samples, found {}", count, sample),
            })?;

            pixels.clear();
            for _ in 0..FEATURE_LEN {
                let (line, value) = tokens.next().ok_or_else(|| LoadError::ClassifierDatabase {
                    line,
                    reason: format!("sample {} ('{}') is truncated", sample, class),
                })?;
                pixels.push(value.parse::<i32>().map_err(|_| LoadError::InvalidNumber {
                    line,
                    text: value.to_string(),
                })?);
            }

            classifier.add_prototype(class, &pixels);
        }

        Ok(classifier)
    }

    /// Apply `"<class> <n|a|d>"` annotations. Unknown classes are skipped;
    /// classes without an annotation stay `Normal`.
    pub fn read_symbol_types(&mut self, text: &str) -> LoadResult<()> {
        for (i, line) in text.lines().enumerate() {
            let mut fields = line.split_whitespace();
            let (Some(class), Some(code)) = (fields.next(), fields.next()) else {
                continue;
            };

            let Some(&id) = self.ids.get(class) else {
                continue;
            };

            let kind = code
                .chars()
                .next()
                .and_then(SymbolType::from_code)
                .ok_or_else(|| LoadError::ClassifierDatabase {
                    line: i + 1,
                    reason: format!("unknown symbol type '{}' for class '{}'", code, class),
                })?;
            self.set_symbol_type(id, kind);
        }
        Ok(())
    }
}

impl Classifier for NearestNeighbor {
    fn class_count(&self) -> usize {
        self.names.len()
    }

    fn class_id(&self, name: &str) -> Option<ClassId> {
        let id = self.ids.get(name).copied();
        if id.is_none() {
            warn!("class '{}' does not appear in the symbol database", name);
        }
        id
    }

    fn class_name(&self, class: ClassId) -> &str {
        &self.names[class]
    }

    fn symbol_type(&self, class: ClassId) -> SymbolType {
        self.types[class]
    }

    fn classify(&self, features: &[u8], top_n: usize) -> Vec<(ClassId, f64)> {
        let mut best: Vec<Option<i64>> = vec![None; self.class_count()];

        for proto in &self.prototypes {
            let dist: i64 = proto
                .pixels
                .iter()
                .zip(features)
                .map(|(&p, &f)| {
                    let d = i64::from(p) - i64::from(f);
                    d * d
                })
                .sum();

            let slot = &mut best[proto.class];
            if slot.map_or(true, |d| dist < d) {
                *slot = Some(dist);
            }
        }

        let mut ranked: Vec<(ClassId, i64)> = best
            .into_iter()
            .enumerate()
            .filter_map(|(class, d)| d.map(|d| (class, d)))
            .collect();
        ranked.sort_by_key(|&(_, d)| d);
        ranked.truncate(top_n);

        ranked
            .into_iter()
            .map(|(class, d)| (class, (-(d as f64) / POSTERIOR_SCALE).exp()))
            .collect()
    }
}
