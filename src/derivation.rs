//! Extraction of the best derivation from a filled chart.

use crate::chart::{CellId, Chart, Origin};
use crate::grammar::{Grammar, ParseStats};
use crate::rule::{Child, NonterminalId};
use crate::score::LogProb;
use log::debug;
use std::fmt;

/// How much of the sample the recognised expression explains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// Every component.
    Full,
    /// Only `symbols` components; no start symbol covers them all.
    Partial { symbols: usize },
    /// No start symbol was derived at all.
    Empty,
}

/// Result of parsing one sample.
#[derive(Debug, Clone)]
pub struct Recognition {
    /// Viterbi trace of the applied rules, in preorder.
    pub trace: Vec<String>,
    /// Leaf glyphs as `#x_y_s_t output`, left child first.
    pub symbols: Vec<String>,
    pub latex: String,
    pub coverage: Coverage,
    pub log_prob: Option<LogProb>,
    pub stats: ParseStats,
}

impl Recognition {
    /// The result when nothing was recognised.
    pub fn empty(stats: ParseStats) -> Self {
        Recognition {
            trace: Vec::new(),
            symbols: Vec::new(),
            latex: "\\emptyset".to_string(),
            coverage: Coverage::Empty,
            log_prob: None,
            stats,
        }
    }
}

impl fmt::Display for Recognition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.coverage == Coverage::Empty {
            return write!(f, "Partial Recognition (0 symbols)\nLaTeX: {}", self.latex);
        }

        writeln!(f, "Used rules:")?;
        for line in &self.trace {
            writeln!(f, "{}", line)?;
        }
        writeln!(f)?;

        // A lone glyph has no symbol listing.
        let composite = self.trace.len() > 1;
        if composite {
            writeln!(f, "Symbols:")?;
            for line in &self.symbols {
                writeln!(f, "{}", line)?;
            }
        }

        match self.coverage {
            Coverage::Partial { symbols } => {
                writeln!(f, "Partial Recognition ({} symbols)", symbols)?;
            }
            _ if composite => writeln!(f)?,
            _ => {}
        }
        write!(f, "LaTeX: {}", self.latex)
    }
}

/// Best start symbol at a span: strictly greater probability wins, so ties
/// keep the newest cell and the earliest declared start symbol.
fn best_start(grammar: &Grammar, chart: &Chart, span: usize) -> Option<(CellId, NonterminalId)> {
    let mut best: Option<(CellId, NonterminalId, LogProb)> = None;
    for id in chart.span(span) {
        for &nt in grammar.start_symbols() {
            let Some(symbol) = chart.symbol(id, nt) else {
                continue;
            };
            if best.map_or(true, |(_, _, p)| symbol.log_prob > p) {
                best = Some((id, nt, symbol.log_prob));
            }
        }
    }
    best.map(|(id, nt, _)| (id, nt))
}

/// Walks a derivation tree rooted in the chart.
struct Walker<'a> {
    grammar: &'a Grammar,
    chart: &'a Chart,
}

impl Walker<'_> {
    fn terminal_output(&self, rule: usize, class: usize) -> &str {
        self.grammar
            .terminal(rule)
            .entry(class)
            .map_or("", |e| e.output.as_str())
    }

    fn trace(&self, id: CellId, nt: NonterminalId, out: &mut Vec<String>) {
        let Some(symbol) = self.chart.symbol(id, nt) else {
            return;
        };
        let name = |nt| self.grammar.nonterminal_name(nt);

        match symbol.origin {
            Origin::Terminal { rule, class } => {
                out.push(format!("%VT% T {} -> {}", name(nt), self.terminal_output(rule, class)));
            }
            Origin::Binary { rule, left, right } => {
                let r = self.grammar.rule(rule);
                out.push(format!(
                    "%VT% {} {} -> {} {}",
                    r.relation.code(),
                    name(r.parent),
                    name(r.left),
                    name(r.right)
                ));
                self.trace(left, r.left, out);
                self.trace(right, r.right, out);
            }
        }
    }

    fn leaves(&self, id: CellId, nt: NonterminalId, out: &mut Vec<String>) {
        let Some(symbol) = self.chart.symbol(id, nt) else {
            return;
        };
        match symbol.origin {
            Origin::Terminal { rule, class } => {
                let region = self.chart.cell(id).region;
                out.push(format!("#{} {}", region, self.terminal_output(rule, class)));
            }
            Origin::Binary { rule, left, right } => {
                let r = self.grammar.rule(rule);
                self.leaves(left, r.left, out);
                self.leaves(right, r.right, out);
            }
        }
    }

    fn render(&self, id: CellId, nt: NonterminalId, out: &mut String) {
        let Some(symbol) = self.chart.symbol(id, nt) else {
            return;
        };
        match symbol.origin {
            Origin::Terminal { rule, class } => out.push_str(self.terminal_output(rule, class)),
            Origin::Binary { rule, left, right } => {
                let r = self.grammar.rule(rule);
                r.template.render_with(out, |child, out| match child {
                    Child::Left => self.render(left, r.left, out),
                    Child::Right => self.render(right, r.right, out),
                });
            }
        }
    }
}

/// Pick the most probable start symbol covering all components, or else the
/// largest span that has one, and render it.
pub fn extract(grammar: &Grammar, chart: &Chart, stats: ParseStats) -> Recognition {
    let n = chart.max_span();

    for span in (1..=n).rev() {
        let Some((id, nt)) = best_start(grammar, chart, span) else {
            continue;
        };

        let walker = Walker { grammar, chart };
        let mut trace = Vec::new();
        let mut symbols = Vec::new();
        let mut latex = String::new();
        walker.trace(id, nt, &mut trace);
        walker.leaves(id, nt, &mut symbols);
        walker.render(id, nt, &mut latex);

        let log_prob = chart.symbol(id, nt).map(|s| s.log_prob);
        debug!(
            "best derivation over {} components: {} ({})",
            span,
            latex,
            log_prob.unwrap_or(LogProb::IMPOSSIBLE)
        );

        return Recognition {
            trace,
            symbols,
            latex,
            coverage: if span == n {
                Coverage::Full
            } else {
                Coverage::Partial { symbols: span }
            },
            log_prob,
            stats,
        };
    }

    Recognition::empty(stats)
}
