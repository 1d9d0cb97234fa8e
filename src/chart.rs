//! Region chart for two-dimensional CYK parsing.
//!
//! The chart groups hypotheses by span, the number of primitive components
//! they cover. Within a span every bounding region owns one cell, and every
//! cell holds at most one symbol per nonterminal: the most probable
//! derivation seen so far for that (span, region, nonterminal) key.
//!
//! Cells live in a single arena and refer to their children by [`CellId`].
//! Spans are filled in increasing order and a closed span is never written
//! again, so child handles always point at settled cells.

use crate::classifier::ClassId;
use crate::components::ComponentSet;
use crate::region::{Baselines, Region};
use crate::rule::{NonterminalId, RuleId};
use crate::score::LogProb;
use rustc_hash::FxHashMap;

/// Handle of a cell in the chart arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u32);

impl CellId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a symbol was derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// A classified glyph accepted by terminal rule `rule`.
    Terminal { rule: usize, class: ClassId },
    /// Binary rule `rule` applied to a symbol in each child cell.
    Binary {
        rule: RuleId,
        left: CellId,
        right: CellId,
    },
}

/// One derivation hypothesis of a nonterminal over a region.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub log_prob: LogProb,
    /// Primitive components explained by this derivation.
    pub components: ComponentSet,
    pub baselines: Baselines,
    pub origin: Origin,
}

impl Symbol {
    /// Classifier class for terminal symbols.
    pub fn class(&self) -> Option<ClassId> {
        match self.origin {
            Origin::Terminal { class, .. } => Some(class),
            Origin::Binary { .. } => None,
        }
    }
}

/// All competing symbols for one bounding region.
#[derive(Clone, Debug)]
pub struct Cell {
    pub region: Region,
    slots: Box<[Option<Symbol>]>,
}

impl Cell {
    /// Empty cell with one slot per nonterminal.
    pub fn new(region: Region, nonterminals: usize) -> Self {
        Cell {
            region,
            slots: vec![None; nonterminals].into_boxed_slice(),
        }
    }

    /// Store `symbol`, replacing whatever the slot held.
    pub fn set(&mut self, nt: NonterminalId, symbol: Symbol) {
        self.slots[nt] = Some(symbol);
    }

    /// Symbol for a nonterminal, if any.
    pub fn get(&self, nt: NonterminalId) -> Option<&Symbol> {
        self.slots.get(nt).and_then(Option::as_ref)
    }

    pub fn has(&self, nt: NonterminalId) -> bool {
        self.get(nt).is_some()
    }

    /// Store `symbol` unless the slot already holds one at least as likely.
    /// Returns whether the slot changed.
    pub fn offer(&mut self, nt: NonterminalId, symbol: Symbol) -> bool {
        if let Some(current) = &self.slots[nt] {
            if current.log_prob >= symbol.log_prob {
                return false;
            }
        }
        self.slots[nt] = Some(symbol);
        true
    }

    /// Occupied slots as `(nonterminal, symbol)`.
    pub fn symbols(&self) -> impl Iterator<Item = (NonterminalId, &Symbol)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(nt, s)| s.as_ref().map(|s| (nt, s)))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

/// Arena of cells grouped by span and deduplicated by region.
#[derive(Debug)]
pub struct Chart {
    cells: Vec<Cell>,
    /// Cell handles per span, in insertion order. Index `span - 1`.
    spans: Vec<Vec<CellId>>,
    /// Region lookup per span. Index `span - 1`.
    by_region: Vec<FxHashMap<Region, CellId>>,
    nonterminals: usize,
}

impl Chart {
    /// Chart for spans `1..=max_span` over `nonterminals` slots per cell.
    pub fn new(max_span: usize, nonterminals: usize) -> Self {
        Chart {
            cells: Vec::new(),
            spans: vec![Vec::new(); max_span],
            by_region: vec![FxHashMap::default(); max_span],
            nonterminals,
        }
    }

    /// Largest span the chart holds.
    pub fn max_span(&self) -> usize {
        self.spans.len()
    }

    pub fn nonterminals(&self) -> usize {
        self.nonterminals
    }

    /// Add a cell to a span.
    ///
    /// A new region is appended. A region already present at that span
    /// keeps its cell: each incoming symbol replaces the stored one only if
    /// it is strictly more probable, and fills slots that were empty.
    /// Returns the handle of the cell that holds the region.
    pub fn add(&mut self, span: usize, cell: Cell) -> CellId {
        let index = span - 1;
        if let Some(&id) = self.by_region[index].get(&cell.region) {
            let existing = &mut self.cells[id.index()];
            for (nt, symbol) in cell.slots.into_vec().into_iter().enumerate() {
                if let Some(symbol) = symbol {
                    existing.offer(nt, symbol);
                }
            }
            return id;
        }

        let id = CellId(self.cells.len() as u32);
        self.by_region[index].insert(cell.region, id);
        self.spans[index].push(id);
        self.cells.push(cell);
        id
    }

    pub fn cell(&self, id: CellId) -> &Cell {
        &self.cells[id.index()]
    }

    /// Symbol `nt` of cell `id`.
    pub fn symbol(&self, id: CellId, nt: NonterminalId) -> Option<&Symbol> {
        self.cell(id).get(nt)
    }

    /// Cells of a span, newest first.
    pub fn span(&self, span: usize) -> impl Iterator<Item = CellId> + '_ {
        self.spans[span - 1].iter().rev().copied()
    }

    /// Cell holding `region` at `span`.
    pub fn find(&self, span: usize, region: &Region) -> Option<CellId> {
        self.by_region[span - 1].get(region).copied()
    }

    /// Number of distinct regions at a span.
    pub fn size(&self, span: usize) -> usize {
        self.spans[span - 1].len()
    }

    /// Number of cells over all spans.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
