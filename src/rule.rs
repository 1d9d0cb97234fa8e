//! Grammar productions.
//!
//! A binary rule `S -> A B` joins two hypotheses standing in a fixed spatial
//! relation and renders them through an output template. A terminal rule
//! `S -> class` turns a classified glyph into a nonterminal with the
//! class's output string.

use crate::classifier::ClassId;
use crate::relation::{MergeFlags, Relation};
use crate::score::LogProb;
use log::warn;
use std::fmt;

/// Index of a nonterminal in the grammar.
pub type NonterminalId = usize;

/// Index of a binary rule in the grammar.
pub type RuleId = usize;

/// Which child a template placeholder refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Child {
    /// `$1`, the `A` operand.
    Left,
    /// `$2`, the `B` operand.
    Right,
}

/// One piece of an output template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Piece {
    Text(String),
    Child(Child),
}

/// Output template such as `\frac{$1}{$2}`, parsed once at load time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Template {
    pieces: Vec<Piece>,
}

impl Template {
    /// Split `text` into literal pieces and `$1` / `$2` placeholders.
    pub fn parse(text: &str) -> Self {
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            let child = match (c, chars.peek().copied()) {
                ('$', Some('1')) => Some(Child::Left),
                ('$', Some('2')) => Some(Child::Right),
                _ => None,
            };
            match child {
                Some(child) => {
                    chars.next();
                    if !literal.is_empty() {
                        pieces.push(Piece::Text(std::mem::take(&mut literal)));
                    }
                    pieces.push(Piece::Child(child));
                }
                None => literal.push(c),
            }
        }
        if !literal.is_empty() {
            pieces.push(Piece::Text(literal));
        }

        Template { pieces }
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// Render into `out`, calling `child` to render each placeholder.
    pub fn render_with<F>(&self, out: &mut String, mut child: F)
    where
        F: FnMut(Child, &mut String),
    {
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Child(c) => child(*c, out),
            }
        }
    }

    /// Render with fixed strings for the children.
    pub fn render(&self, left: &str, right: &str) -> String {
        let mut out = String::new();
        self.render_with(&mut out, |c, out| match c {
            Child::Left => out.push_str(left),
            Child::Right => out.push_str(right),
        });
        out
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => f.write_str(text)?,
                Piece::Child(Child::Left) => f.write_str("$1")?,
                Piece::Child(Child::Right) => f.write_str("$2")?,
            }
        }
        Ok(())
    }
}

/// Binary production `parent -> left right` under a spatial relation.
#[derive(Clone, Debug)]
pub struct BinaryRule {
    pub relation: Relation,
    pub parent: NonterminalId,
    pub left: NonterminalId,
    pub right: NonterminalId,
    pub prior: LogProb,
    pub template: Template,
    pub merge: MergeFlags,
}

impl BinaryRule {
    /// Create a rule from a linear prior probability.
    pub fn new(
        relation: Relation,
        parent: NonterminalId,
        left: NonterminalId,
        right: NonterminalId,
        prior: f64,
        template: Template,
    ) -> Self {
        BinaryRule {
            relation,
            parent,
            left,
            right,
            prior: LogProb::from_prob(prior),
            template,
            merge: MergeFlags::default(),
        }
    }
}

/// Prior and output of one class accepted by a terminal rule.
#[derive(Clone, Debug, PartialEq)]
pub struct TerminalEntry {
    pub prior: LogProb,
    pub output: String,
}

/// Terminal production `nonterminal -> class` for a set of classes.
#[derive(Clone, Debug)]
pub struct TerminalRule {
    pub nonterminal: NonterminalId,
    entries: Vec<Option<TerminalEntry>>,
}

impl TerminalRule {
    /// Rule accepting no class yet, over `class_count` classifier classes.
    pub fn new(nonterminal: NonterminalId, class_count: usize) -> Self {
        TerminalRule {
            nonterminal,
            entries: vec![None; class_count],
        }
    }

    /// Accept `class` with a linear prior. A class defined twice keeps its
    /// first definition; returns whether the entry was added.
    pub fn set_class(&mut self, class: ClassId, prior: f64, output: &str) -> bool {
        let slot = &mut self.entries[class];
        if slot.is_some() {
            warn!("terminal class {} redefined with label '{}'", class, output);
            return false;
        }
        *slot = Some(TerminalEntry {
            prior: LogProb::from_prob(prior),
            output: output.to_string(),
        });
        true
    }

    /// Entry for `class` if the rule accepts it.
    pub fn entry(&self, class: ClassId) -> Option<&TerminalEntry> {
        self.entries.get(class).and_then(Option::as_ref)
    }

    /// Number of accepted classes.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
