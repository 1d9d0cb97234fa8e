//! Formula-CYK: recognition of mathematical expressions with a
//! two-dimensional stochastic context-free grammar.
//!
//! This crate provides:
//! - Bounding regions, baselines and component sets
//! - A region chart and spatial partner index for 2D CYK parsing
//! - The seven spatial relations with their geometric scoring
//! - Grammar loading and the parse driver
//! - A nearest-neighbour glyph classifier and PGM bitmap segmentation

pub mod chart;
pub mod classifier;
pub mod components;
pub mod derivation;
pub mod grammar;
pub mod loader;
pub mod reference;
pub mod region;
pub mod relation;
pub mod rule;
pub mod sample;
pub mod score;
pub mod spatial;

// Re-exports for convenience
pub use chart::{Cell, CellId, Chart, Origin, Symbol};
pub use classifier::{Classifier, NearestNeighbor, SymbolType};
pub use derivation::{Coverage, Recognition};
pub use grammar::{Grammar, GrammarBuilder, ParseStats, ParserConfig};
pub use loader::{LoadError, LoadResult};
pub use reference::ReferenceSize;
pub use region::{Baselines, Lines, Region};
pub use relation::{MergeFlags, Relation, ScoreContext};
pub use rule::{BinaryRule, Template, TerminalRule};
pub use sample::{Bitmap, SampleError, Segmentation};
pub use score::LogProb;
pub use spatial::{Direction, SpatialIndex};
