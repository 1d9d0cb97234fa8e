//! Two-dimensional CYK parsing driven by a stochastic grammar.
//!
//! Parsing runs in fixed phases over a chart indexed by span, the number of
//! primitive components a hypothesis covers:
//!
//! 1. every component is classified and seeded at span 1 through the
//!    terminal productions;
//! 2. the reference symbol size is estimated from the span-1 regions;
//! 3. pairs of nearby components are classified as one glyph and seeded at
//!    span 2 (for glyphs drawn in several strokes, such as `=` or `i`);
//! 4. spans `2..=N` are built bottom-up by combining a cell of span `a` with
//!    spatially plausible partners of span `N - a` through the binary rules;
//! 5. the most probable start symbol is extracted (see [`crate::derivation`]).

use crate::chart::{Cell, CellId, Chart, Origin, Symbol};
use crate::classifier::{ClassId, Classifier, NearestNeighbor};
use crate::components::ComponentSet;
use crate::derivation::{self, Recognition};
use crate::loader::{parse_grammar, parse_terminal_table, read_text, LoadError, LoadResult};
use crate::reference::ReferenceSize;
use crate::region::{Baselines, Region};
use crate::relation::{Placed, Relation, ScoreContext};
use crate::rule::{BinaryRule, NonterminalId, RuleId, Template, TerminalRule};
use crate::sample::{RegionFeatures, Segmentation};
use crate::score::LogProb;
use crate::spatial::{Direction, SpatialIndex};
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use std::fmt;
use std::path::Path;

/// Posterior a pair candidate must exceed unless the candidate list is tight.
const PAIR_FLOOR: f64 = 0.5;

/// Configuration for the parser.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Minimum relation score for two hypotheses to fuse (exclusive).
    pub fusion_threshold: f64,
    /// Classes requested from the classifier for a single component.
    pub seed_candidates: usize,
    /// Posterior a single-component class must exceed.
    pub seed_min_posterior: f64,
    /// Classes requested from the classifier for a component pair.
    pub merge_candidates: usize,
    /// Posterior a component-pair class must reach after boosting.
    pub merge_min_posterior: f64,
    /// Posterior factor for classes in `frequently_split`.
    pub merge_boost: f64,
    /// The boost only applies above this posterior.
    pub merge_boost_min_posterior: f64,
    /// Apply the superscript height penalty to subscripts as well.
    pub penalize_subscript_height: bool,
    /// Classes commonly written with more than one stroke.
    pub frequently_split: Vec<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            fusion_threshold: 0.45,
            seed_candidates: 10,
            seed_min_posterior: 0.5,
            merge_candidates: 5,
            merge_min_posterior: 0.65,
            merge_boost: 1.1,
            merge_boost_min_posterior: 0.7,
            penalize_subscript_height: false,
            frequently_split: ["equal", "i", "j", "colon", "semicolon", "leq", "exclamation"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Statistics about one parse.
#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    pub components: usize,
    pub reference: ReferenceSize,
    /// Distinct regions per span, index `span - 1`.
    pub nodes_per_span: Vec<usize>,
    pub fusion_attempts: usize,
    pub fusions: usize,
}

impl ParseStats {
    pub fn total_nodes(&self) -> usize {
        self.nodes_per_span.iter().sum()
    }
}

impl fmt::Display for ParseStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, n) in self.nodes_per_span.iter().enumerate() {
            writeln!(f, "Size {}: Nodes generated {}", i + 1, n)?;
        }
        write!(f, "\nTotal generated = {}", self.total_nodes())
    }
}

/// Binary rules grouped by the spatial query that finds their partners.
#[derive(Debug, Clone, Default)]
struct RuleIndex {
    /// H, Sup and Sub rules, in declaration order.
    horizontal: Vec<RuleId>,
    below: Vec<RuleId>,
    below_aligned: Vec<RuleId>,
    stacked: Vec<RuleId>,
    inside: Vec<RuleId>,
}

impl RuleIndex {
    fn new(rules: &[BinaryRule]) -> Self {
        let mut index = RuleIndex::default();
        for (id, rule) in rules.iter().enumerate() {
            let list = match rule.relation {
                Relation::Horizontal | Relation::Superscript | Relation::Subscript => {
                    &mut index.horizontal
                }
                Relation::Below => &mut index.below,
                Relation::BelowAligned => &mut index.below_aligned,
                Relation::Stacked => &mut index.stacked,
                Relation::Inside => &mut index.inside,
            };
            list.push(id);
        }
        index
    }
}

/// Builder for grammars defined in code.
pub struct GrammarBuilder {
    classifier: Box<dyn Classifier>,
    config: ParserConfig,
    nonterminals: Vec<String>,
    ids: FxHashMap<String, NonterminalId>,
    start: Vec<NonterminalId>,
    terminals: Vec<TerminalRule>,
    rules: Vec<BinaryRule>,
}

impl GrammarBuilder {
    pub fn new(classifier: Box<dyn Classifier>) -> Self {
        GrammarBuilder {
            classifier,
            config: ParserConfig::default(),
            nonterminals: Vec::new(),
            ids: FxHashMap::default(),
            start: Vec::new(),
            terminals: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn config(mut self, config: ParserConfig) -> Self {
        self.config = config;
        self
    }

    /// Declare a nonterminal. Redeclaring keeps the first id.
    pub fn nonterminal(&mut self, name: &str) -> NonterminalId {
        if let Some(&id) = self.ids.get(name) {
            warn!("nonterminal '{}' declared twice", name);
            return id;
        }
        let id = self.nonterminals.len();
        self.nonterminals.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    fn resolve(&self, name: &str) -> LoadResult<NonterminalId> {
        self.ids
            .get(name)
            .copied()
            .ok_or_else(|| LoadError::UndefinedNonterminal {
                line: 0,
                name: name.to_string(),
            })
    }

    /// Mark a declared nonterminal as a start symbol.
    pub fn start_symbol(&mut self, name: &str) -> LoadResult<()> {
        let id = self.resolve(name)?;
        self.start.push(id);
        Ok(())
    }

    /// Add a terminal production for `nonterminal` accepting the given
    /// `(prior, class name, output)` entries. Classes unknown to the
    /// classifier are skipped.
    pub fn terminal<'a, I>(&mut self, nonterminal: &str, classes: I) -> LoadResult<()>
    where
        I: IntoIterator<Item = (f64, &'a str, &'a str)>,
    {
        let nt = self.resolve(nonterminal)?;
        let mut rule = TerminalRule::new(nt, self.classifier.class_count());
        for (prior, class, output) in classes {
            if let Some(id) = self.classifier.class_id(class) {
                rule.set_class(id, prior, output);
            }
        }
        debug!("terminal production {} accepts {} classes", nonterminal, rule.len());
        self.terminals.push(rule);
        Ok(())
    }

    /// Add a binary rule `parent -> left right`. The returned rule may be
    /// adjusted further, e.g. to set its merge flags.
    pub fn rule(
        &mut self,
        relation: Relation,
        parent: &str,
        left: &str,
        right: &str,
        prior: f64,
        template: &str,
    ) -> LoadResult<&mut BinaryRule> {
        let (parent, left, right) = (
            self.resolve(parent)?,
            self.resolve(left)?,
            self.resolve(right)?,
        );
        let rule = BinaryRule::new(relation, parent, left, right, prior, Template::parse(template));
        self.rules.push(rule);
        let last = self.rules.len() - 1;
        Ok(&mut self.rules[last])
    }

    pub fn build(self) -> Grammar {
        Grammar {
            rule_index: RuleIndex::new(&self.rules),
            classifier: self.classifier,
            config: self.config,
            nonterminals: self.nonterminals,
            ids: self.ids,
            start: self.start,
            terminals: self.terminals,
            rules: self.rules,
        }
    }
}

/// Candidates produced by one round of fusion attempts.
#[derive(Default)]
struct Fusions {
    cells: Vec<Cell>,
    attempts: usize,
}

/// A 2D stochastic context-free grammar together with its glyph classifier.
pub struct Grammar {
    classifier: Box<dyn Classifier>,
    config: ParserConfig,
    nonterminals: Vec<String>,
    ids: FxHashMap<String, NonterminalId>,
    start: Vec<NonterminalId>,
    terminals: Vec<TerminalRule>,
    rules: Vec<BinaryRule>,
    rule_index: RuleIndex,
}

impl Grammar {
    /// Load a grammar file together with its classifier and terminal tables.
    pub fn load(path: impl AsRef<Path>) -> LoadResult<Grammar> {
        let path = path.as_ref();
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let file = parse_grammar(&read_text(path)?, base)?;

        let classifier = NearestNeighbor::load(&file.classifier_db, &file.symbol_types)?;
        let mut builder = GrammarBuilder::new(Box::new(classifier));

        for (_, name) in &file.nonterminals {
            builder.nonterminal(name);
        }
        for (line, name) in &file.start {
            builder.start_symbol(name).map_err(|e| e.at_line(*line))?;
        }
        for decl in &file.terminals {
            builder
                .resolve(&decl.nonterminal)
                .map_err(|e| e.at_line(decl.line))?;
            let table = parse_terminal_table(&read_text(&decl.table)?)?;
            let classes = table
                .iter()
                .map(|t| (t.prior, t.class.as_str(), t.output.as_str()));
            builder.terminal(&decl.nonterminal, classes)?;
        }
        for decl in &file.rules {
            let rule = builder
                .rule(
                    decl.relation,
                    &decl.parent,
                    &decl.left,
                    &decl.right,
                    decl.prior,
                    &decl.template,
                )
                .map_err(|e| e.at_line(decl.line))?;
            if let Some(merge) = decl.merge {
                rule.merge = merge;
            }
        }

        let grammar = builder.build();
        info!(
            "loaded grammar {}: {} nonterminals, {} terminal and {} binary productions",
            path.display(),
            grammar.nonterminals.len(),
            grammar.terminals.len(),
            grammar.rules.len()
        );
        Ok(grammar)
    }

    /// Replace the parser configuration.
    pub fn with_config(mut self, config: ParserConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    pub fn classifier(&self) -> &dyn Classifier {
        self.classifier.as_ref()
    }

    pub fn nonterminal_count(&self) -> usize {
        self.nonterminals.len()
    }

    pub fn nonterminal_name(&self, id: NonterminalId) -> &str {
        &self.nonterminals[id]
    }

    pub fn nonterminal_id(&self, name: &str) -> Option<NonterminalId> {
        self.ids.get(name).copied()
    }

    pub fn start_symbols(&self) -> &[NonterminalId] {
        &self.start
    }

    pub fn rule(&self, id: RuleId) -> &BinaryRule {
        &self.rules[id]
    }

    pub fn rules(&self) -> &[BinaryRule] {
        &self.rules
    }

    pub fn terminal(&self, index: usize) -> &TerminalRule {
        &self.terminals[index]
    }

    /// Parse a segmented sample.
    pub fn parse<S: Segmentation + ?Sized>(&self, sample: &S) -> Recognition {
        let n = sample.component_count();
        let mut stats = ParseStats {
            components: n,
            ..Default::default()
        };
        if n == 0 {
            return Recognition::empty(stats);
        }

        let mut chart = Chart::new(n, self.nonterminals.len());
        self.seed_components(sample, &mut chart);

        let regions: Vec<Region> = chart.span(1).map(|id| chart.cell(id).region).collect();
        let reference = ReferenceSize::estimate(&regions);
        info!("reference symbol size (RX,RY) = {}", reference);
        stats.reference = reference;

        if n > 1 {
            self.merge_components(sample, &mut chart, reference);
        }

        let ctx = ScoreContext {
            reference,
            penalize_subscript_height: self.config.penalize_subscript_height,
        };
        self.combine(&mut chart, &ctx, &mut stats);

        stats.nodes_per_span = (1..=n).map(|span| chart.size(span)).collect();
        info!("{} nodes generated", stats.total_nodes());
        derivation::extract(self, &chart, stats)
    }

    fn glyph_symbol(
        &self,
        rule: usize,
        class: ClassId,
        log_prob: LogProb,
        region: Region,
        features: &RegionFeatures,
        components: ComponentSet,
    ) -> Symbol {
        let kind = self.classifier.symbol_type(class);
        Symbol {
            log_prob,
            components,
            baselines: Baselines::for_glyph(region, kind, features.centroids),
            origin: Origin::Terminal { rule, class },
        }
    }

    /// Span 1: one cell per component, holding every terminal production
    /// that accepts one of the component's likely classes.
    fn seed_components<S: Segmentation + ?Sized>(&self, sample: &S, chart: &mut Chart) {
        let n = sample.component_count();
        let cfg = &self.config;

        for i in 0..n {
            let features = sample.region_features(&[i]);
            let region = sample.component_box(i);
            let candidates = self.classifier.classify(&features.pixels, cfg.seed_candidates);
            let mut cell = Cell::new(region, self.nonterminals.len());

            for (index, rule) in self.terminals.iter().enumerate() {
                // Worst first, so the most likely class lands in the slot last.
                for &(class, posterior) in candidates.iter().rev() {
                    if posterior <= cfg.seed_min_posterior {
                        continue;
                    }
                    let Some(entry) = rule.entry(class) else {
                        continue;
                    };
                    if !entry.prior.is_possible() {
                        continue;
                    }

                    let log_prob = entry.prior * LogProb::from_prob(posterior);
                    let components = ComponentSet::from_components(n, &[i]);
                    let symbol =
                        self.glyph_symbol(index, class, log_prob, region, &features, components);
                    cell.set(rule.nonterminal, symbol);
                    debug!(
                        "{} {:.8} [{}] {}",
                        region,
                        log_prob.prob(),
                        rule.nonterminal,
                        self.classifier.class_name(class)
                    );
                }
            }

            chart.add(1, cell);
        }
    }

    /// Span 2: glyphs made of two nearby components.
    fn merge_components<S: Segmentation + ?Sized>(
        &self,
        sample: &S,
        chart: &mut Chart,
        reference: ReferenceSize,
    ) {
        let n = sample.component_count();
        let cfg = &self.config;

        for i in 0..n {
            for j in sample.nearby_components(i, reference.rx / 2, reference.ry) {
                if j <= i {
                    continue;
                }

                let pair = [i, j];
                let features = sample.region_features(&pair);
                let region = sample.bounding_box(&pair);
                let candidates = self.classifier.classify(&features.pixels, cfg.merge_candidates);
                let floor = pair_floor(&candidates);
                let mut cell = Cell::new(region, self.nonterminals.len());
                let mut combined = false;

                for (index, rule) in self.terminals.iter().enumerate() {
                    for &(class, posterior) in candidates.iter().rev() {
                        if posterior <= floor {
                            continue;
                        }
                        let Some(entry) = rule.entry(class) else {
                            continue;
                        };
                        if !entry.prior.is_possible() {
                            continue;
                        }

                        let mut p = posterior;
                        if p > cfg.merge_boost_min_posterior && self.frequently_split(class) {
                            p = (p * cfg.merge_boost).min(1.0);
                        }
                        if p < cfg.merge_min_posterior {
                            continue;
                        }

                        let log_prob = entry.prior * LogProb::from_prob(p * p * p);
                        let components = ComponentSet::from_components(n, &pair);
                        let symbol =
                            self.glyph_symbol(index, class, log_prob, region, &features, components);
                        cell.set(rule.nonterminal, symbol);
                        combined = true;
                        debug!(
                            "{} {:.8} [{}] {}",
                            region,
                            log_prob.prob(),
                            rule.nonterminal,
                            self.classifier.class_name(class)
                        );
                    }
                }

                if combined {
                    chart.add(2, cell);
                }
            }
        }
    }

    fn frequently_split(&self, class: ClassId) -> bool {
        let name = self.classifier.class_name(class);
        self.config.frequently_split.iter().any(|s| s == name)
    }

    /// Spans 2..=N by combining smaller spans.
    fn combine(&self, chart: &mut Chart, ctx: &ScoreContext, stats: &mut ParseStats) {
        let n = chart.max_span();
        let mut indexes = vec![SpatialIndex::build(chart, 1, ctx.reference)];
        let ix = &self.rule_index;

        for span in 2..=n {
            let mut fusions = Fusions::default();

            for a in 1..span {
                let b = span - a;
                let index = &indexes[b - 1];

                for c1 in chart.span(a) {
                    let region = chart.cell(c1).region;

                    for c2 in index.query(&region, Direction::Horizontal) {
                        self.try_rules(&ix.horizontal, chart, c1, c2, ctx, &mut fusions);
                    }
                    for c2 in index.query(&region, Direction::Down) {
                        self.try_rules(&ix.below, chart, c1, c2, ctx, &mut fusions);
                        self.try_rules(&ix.below_aligned, chart, c1, c2, ctx, &mut fusions);
                        self.try_rules(&ix.stacked, chart, c1, c2, ctx, &mut fusions);
                    }
                    for c2 in index.query(&region, Direction::Up) {
                        self.try_rules(&ix.below, chart, c2, c1, ctx, &mut fusions);
                        self.try_rules(&ix.stacked, chart, c2, c1, ctx, &mut fusions);
                    }
                    for c2 in index.query(&region, Direction::Inside) {
                        self.try_rules(&ix.inside, chart, c1, c2, ctx, &mut fusions);
                    }
                }
            }

            stats.fusion_attempts += fusions.attempts;
            stats.fusions += fusions.cells.len();
            for cell in fusions.cells {
                chart.add(span, cell);
            }
            info!("span {}: {} nodes", span, chart.size(span));

            if span < n {
                indexes.push(SpatialIndex::build(chart, span, ctx.reference));
            }
        }
    }

    fn try_rules(
        &self,
        rules: &[RuleId],
        chart: &Chart,
        a: CellId,
        b: CellId,
        ctx: &ScoreContext,
        out: &mut Fusions,
    ) {
        let (ca, cb) = (chart.cell(a), chart.cell(b));
        for &id in rules {
            let rule = &self.rules[id];
            if !(ca.has(rule.left) && cb.has(rule.right)) {
                continue;
            }
            out.attempts += 1;
            if let Some(cell) = self.fusion(id, chart, a, b, ctx) {
                out.cells.push(cell);
            }
        }
    }

    /// Apply rule `id` to the `left` symbol of cell `a` and the `right`
    /// symbol of cell `b`.
    ///
    /// Succeeds when the relation score exceeds the fusion threshold, the
    /// rule's prior is possible and the two symbols explain disjoint sets of
    /// components. The result is a new cell over the union region holding
    /// only the parent symbol.
    pub fn fusion(
        &self,
        id: RuleId,
        chart: &Chart,
        a: CellId,
        b: CellId,
        ctx: &ScoreContext,
    ) -> Option<Cell> {
        let rule = &self.rules[id];
        let (ca, cb) = (chart.cell(a), chart.cell(b));
        let (sa, sb) = (ca.get(rule.left)?, cb.get(rule.right)?);

        let score = rule.relation.score(
            Placed {
                region: &ca.region,
                baselines: &sa.baselines,
            },
            Placed {
                region: &cb.region,
                baselines: &sb.baselines,
            },
            ctx,
        );

        if score <= self.config.fusion_threshold
            || !rule.prior.is_possible()
            || !sa.components.is_disjoint(&sb.components)
        {
            return None;
        }

        let mut cell = Cell::new(ca.region.union(&cb.region), chart.nonterminals());
        cell.offer(
            rule.parent,
            Symbol {
                log_prob: rule.prior * LogProb::new(score.ln()) * sa.log_prob * sb.log_prob,
                components: sa.components.union(&sb.components),
                baselines: rule.relation.merge(&sa.baselines, &sb.baselines, rule.merge),
                origin: Origin::Binary {
                    rule: id,
                    left: a,
                    right: b,
                },
            },
        );
        Some(cell)
    }
}

/// Posterior a component-pair class must exceed. When the best class is
/// already likely, only classes close to it pass.
fn pair_floor(candidates: &[(ClassId, f64)]) -> f64 {
    match candidates.first() {
        Some(&(_, best)) if best > 0.6 => best - 0.1,
        _ => PAIR_FLOOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::SymbolType;
    use crate::derivation::Coverage;
    use crate::sample::Centroids;
    use std::fs;
    use std::path::PathBuf;

    /// Classifier answering from a table keyed by the first feature byte.
    struct TableClassifier {
        names: Vec<String>,
        answers: FxHashMap<u8, Vec<(ClassId, f64)>>,
    }

    impl TableClassifier {
        fn new(names: &[&str]) -> Self {
            TableClassifier {
                names: names.iter().map(|s| s.to_string()).collect(),
                answers: FxHashMap::default(),
            }
        }

        fn answer(mut self, key: u8, ranked: &[(&str, f64)]) -> Self {
            let ranked = ranked
                .iter()
                .map(|&(name, p)| (self.names.iter().position(|n| n == name).unwrap(), p))
                .collect();
            self.answers.insert(key, ranked);
            self
        }
    }

    impl Classifier for TableClassifier {
        fn class_count(&self) -> usize {
            self.names.len()
        }

        fn class_id(&self, name: &str) -> Option<ClassId> {
            self.names.iter().position(|n| n == name)
        }

        fn class_name(&self, class: ClassId) -> &str {
            &self.names[class]
        }

        fn symbol_type(&self, _class: ClassId) -> SymbolType {
            SymbolType::Normal
        }

        fn classify(&self, features: &[u8], top_n: usize) -> Vec<(ClassId, f64)> {
            let mut ranked = self.answers.get(&features[0]).cloned().unwrap_or_default();
            ranked.truncate(top_n);
            ranked
        }
    }

    /// Components given by their boxes. A single component `i` presents
    /// feature key `i`; a pair presents `100 + i + j`.
    struct Boxes(Vec<Region>);

    impl Segmentation for Boxes {
        fn component_count(&self) -> usize {
            self.0.len()
        }

        fn component_box(&self, component: usize) -> Region {
            self.0[component]
        }

        fn region_features(&self, components: &[usize]) -> RegionFeatures {
            let key = match components {
                [i] => *i as u8,
                _ => 100 + components.iter().sum::<usize>() as u8,
            };
            let r = self.bounding_box(components);
            let mid = (r.y + r.t) / 2;
            RegionFeatures {
                pixels: vec![key],
                centroids: Centroids {
                    ascender: mid,
                    mean: mid,
                    descender: mid,
                },
            }
        }

        fn nearby_components(&self, component: usize, dx: i32, dy: i32) -> Vec<usize> {
            let r = self.0[component];
            let grown = Region::new(r.x - dx, r.y - dy, r.s + dx - 1, r.t + dy - 1);
            (0..self.0.len())
                .filter(|&c| c != component && self.0[c].overlap(&grown) > 0.0)
                .collect()
        }
    }

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn digits() -> GrammarBuilder {
        init_logs();
        let classifier = TableClassifier::new(&["x", "two", "five", "minus", "equal"])
            .answer(0, &[("x", 0.9)])
            .answer(1, &[("two", 0.9)])
            .answer(2, &[("five", 0.9)]);
        let mut b = GrammarBuilder::new(Box::new(classifier));
        b.nonterminal("Expr");
        b.nonterminal("Term");
        b.start_symbol("Expr").unwrap();
        b.terminal("Term", [(1.0, "x", "x"), (1.0, "two", "2"), (0.5, "five", "5")])
            .unwrap();
        b.rule(Relation::Horizontal, "Expr", "Term", "Term", 1.0, "$1$2")
            .unwrap();
        b
    }

    #[test]
    fn test_single_glyph() {
        init_logs();
        let classifier = TableClassifier::new(&["five"]).answer(0, &[("five", 0.9)]);
        let mut b = GrammarBuilder::new(Box::new(classifier));
        b.nonterminal("Digit");
        b.start_symbol("Digit").unwrap();
        b.terminal("Digit", [(0.8, "five", "5")]).unwrap();
        let grammar = b.build();

        let result = grammar.parse(&Boxes(vec![Region::new(0, 0, 10, 14)]));
        assert_eq!(result.coverage, Coverage::Full);
        assert_eq!(result.latex, "5");
        let lp = result.log_prob.unwrap().value();
        assert!((lp - (0.8f64.ln() + 0.9f64.ln())).abs() < 1e-9);
        assert_eq!(result.trace, vec!["%VT% T Digit -> 5"]);
        assert_eq!(result.to_string(), "Used rules:\n%VT% T Digit -> 5\n\nLaTeX: 5");
        assert_eq!(result.stats.nodes_per_span, vec![1]);
    }

    #[test]
    fn test_horizontal_fusion() {
        let grammar = digits().build();
        let sample = Boxes(vec![Region::new(0, 0, 10, 10), Region::new(14, 0, 24, 10)]);
        let result = grammar.parse(&sample);

        assert_eq!(result.stats.reference, ReferenceSize::new(10, 10));
        assert_eq!(result.coverage, Coverage::Full);
        assert_eq!(result.latex, "x2");
        assert_eq!(
            result.trace,
            vec![
                "%VT% H Expr -> Term Term",
                "%VT% T Term -> x",
                "%VT% T Term -> 2"
            ]
        );
        assert_eq!(result.symbols, vec!["#0_0_10_10 x", "#14_0_24_10 2"]);

        // score = (1 - 4/30 + 1) / 2
        let score = f64::from(((1.0 - 4.0 / 30.0) as f32 + 1.0) / 2.0);
        let expected = score.ln() + 2.0 * 0.9f64.ln();
        assert!((result.log_prob.unwrap().value() - expected).abs() < 1e-6);
        assert_eq!(result.stats.nodes_per_span, vec![2, 1]);
        assert_eq!(result.stats.fusions, 1);
    }

    #[test]
    fn test_partial_recognition() {
        let grammar = digits().build();
        let sample = Boxes(vec![
            Region::new(0, 0, 10, 10),
            Region::new(14, 0, 24, 10),
            Region::new(300, 0, 310, 10),
        ]);
        let result = grammar.parse(&sample);

        assert_eq!(result.coverage, Coverage::Partial { symbols: 2 });
        assert_eq!(result.stats.nodes_per_span, vec![3, 1, 0]);
        assert_eq!(
            result.to_string(),
            "Used rules:\n\
             %VT% H Expr -> Term Term\n\
             %VT% T Term -> x\n\
             %VT% T Term -> 2\n\
             \n\
             Symbols:\n\
             #0_0_10_10 x\n\
             #14_0_24_10 2\n\
             Partial Recognition (2 symbols)\n\
             LaTeX: x2"
        );
    }

    #[test]
    fn test_nothing_combines() {
        let grammar = digits().build();
        let sample = Boxes(vec![Region::new(0, 0, 10, 10), Region::new(200, 0, 210, 10)]);
        let result = grammar.parse(&sample);

        assert_eq!(result.coverage, Coverage::Empty);
        assert_eq!(result.stats.nodes_per_span, vec![2, 0]);
        assert_eq!(result.log_prob, None);
        assert_eq!(
            result.to_string(),
            "Partial Recognition (0 symbols)\nLaTeX: \\emptyset"
        );
    }

    #[test]
    fn test_no_components() {
        let grammar = digits().build();
        let result = grammar.parse(&Boxes(Vec::new()));
        assert_eq!(result.coverage, Coverage::Empty);
        assert_eq!(result.stats.total_nodes(), 0);
    }

    #[test]
    fn test_seed_skips_unlikely_classes() {
        let classifier = TableClassifier::new(&["x", "two"]).answer(0, &[("two", 0.51), ("x", 0.5)]);
        let mut b = GrammarBuilder::new(Box::new(classifier));
        b.nonterminal("Term");
        b.start_symbol("Term").unwrap();
        b.terminal("Term", [(1.0, "x", "x"), (1.0, "two", "2")]).unwrap();
        let result = b.build().parse(&Boxes(vec![Region::new(0, 0, 10, 10)]));

        // 0.5 is not strictly above the threshold.
        assert_eq!(result.latex, "2");
    }

    #[test]
    fn test_merge_split_glyph() {
        let classifier = TableClassifier::new(&["minus", "equal"])
            .answer(0, &[("minus", 0.9)])
            .answer(1, &[("minus", 0.9)])
            .answer(101, &[("equal", 0.72)]);
        let mut b = GrammarBuilder::new(Box::new(classifier));
        b.nonterminal("Sym");
        b.start_symbol("Sym").unwrap();
        b.terminal("Sym", [(1.0, "minus", "-"), (1.0, "equal", "=")]).unwrap();
        let grammar = b.build();

        let sample = Boxes(vec![Region::new(0, 0, 10, 2), Region::new(0, 4, 10, 6)]);
        let result = grammar.parse(&sample);

        assert_eq!(result.stats.reference, ReferenceSize::new(10, 3));
        assert_eq!(result.coverage, Coverage::Full);
        assert_eq!(result.latex, "=");
        assert_eq!(result.symbols, vec!["#0_0_10_6 ="]);

        let boosted: f64 = 0.72 * 1.1;
        let expected = 3.0 * boosted.ln();
        assert!((result.log_prob.unwrap().value() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_merge_rejects_weak_pairs() {
        let classifier = TableClassifier::new(&["minus", "b"])
            .answer(0, &[("minus", 0.9)])
            .answer(1, &[("minus", 0.9)])
            .answer(101, &[("b", 0.64)]);
        let mut b = GrammarBuilder::new(Box::new(classifier));
        b.nonterminal("Sym");
        b.start_symbol("Sym").unwrap();
        b.terminal("Sym", [(1.0, "minus", "-"), (1.0, "b", "b")]).unwrap();

        let sample = Boxes(vec![Region::new(0, 0, 10, 2), Region::new(0, 4, 10, 6)]);
        let result = b.build().parse(&sample);
        assert_eq!(result.stats.nodes_per_span, vec![2, 0]);
        assert_eq!(result.coverage, Coverage::Partial { symbols: 1 });
    }

    #[test]
    fn test_pair_floor() {
        let ranked = [(0, 0.95), (1, 0.75), (2, 0.3), (3, 0.2), (4, 0.1)];
        assert!((pair_floor(&ranked) - 0.85).abs() < 1e-12);
        assert!((pair_floor(&[(0, 0.7)]) - 0.6).abs() < 1e-12);

        assert_eq!(pair_floor(&[(0, 0.6), (1, 0.55)]), PAIR_FLOOR);
        assert_eq!(pair_floor(&[]), PAIR_FLOOR);
    }

    fn split_glyph_grammar(pair: &[(&str, f64)], terminals: &[(f64, &str, &str)]) -> Grammar {
        let classifier = TableClassifier::new(&["minus", "equal", "colon", "b"])
            .answer(0, &[("minus", 0.9)])
            .answer(1, &[("minus", 0.9)])
            .answer(101, pair);
        let mut b = GrammarBuilder::new(Box::new(classifier));
        b.nonterminal("Sym");
        b.start_symbol("Sym").unwrap();
        b.terminal("Sym", terminals.iter().copied()).unwrap();
        b.build()
    }

    fn split_glyph() -> Boxes {
        Boxes(vec![Region::new(0, 0, 10, 2), Region::new(0, 4, 10, 6)])
    }

    #[test]
    fn test_pair_floor_follows_best_class() {
        // The floor is 0.85, so the runner-up is rejected even though it is
        // the only class the grammar knows.
        let grammar = split_glyph_grammar(
            &[("equal", 0.95), ("b", 0.75)],
            &[(1.0, "minus", "-"), (1.0, "b", "b")],
        );
        let result = grammar.parse(&split_glyph());

        assert_eq!(result.stats.nodes_per_span, vec![2, 0]);
        assert_eq!(result.coverage, Coverage::Partial { symbols: 1 });
    }

    #[test]
    fn test_merge_most_likely_class_wins_slot() {
        let grammar = split_glyph_grammar(
            &[("equal", 0.9), ("colon", 0.85)],
            &[(1.0, "minus", "-"), (0.1, "equal", "="), (1.0, "colon", ":")],
        );
        let result = grammar.parse(&split_glyph());

        assert_eq!(result.coverage, Coverage::Full);
        assert_eq!(result.latex, "=");
        let boosted: f64 = 0.9 * 1.1;
        let expected = 0.1f64.ln() + 3.0 * boosted.ln();
        assert!((result.log_prob.unwrap().value() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_seed_most_likely_class_wins_slot() {
        let classifier =
            TableClassifier::new(&["x", "two"]).answer(0, &[("x", 0.9), ("two", 0.6)]);
        let mut b = GrammarBuilder::new(Box::new(classifier));
        b.nonterminal("Term");
        b.start_symbol("Term").unwrap();
        b.terminal("Term", [(0.1, "x", "x"), (1.0, "two", "2")]).unwrap();
        let result = b.build().parse(&Boxes(vec![Region::new(0, 0, 10, 10)]));

        // The prior does not matter: the classifier's best class is kept.
        assert_eq!(result.latex, "x");
        let expected = 0.1f64.ln() + 0.9f64.ln();
        assert!((result.log_prob.unwrap().value() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_seed_later_production_overwrites_slot() {
        let classifier =
            TableClassifier::new(&["x", "two"]).answer(0, &[("two", 0.9), ("x", 0.6)]);
        let mut b = GrammarBuilder::new(Box::new(classifier));
        b.nonterminal("Term");
        b.start_symbol("Term").unwrap();
        b.terminal("Term", [(1.0, "two", "2")]).unwrap();
        b.terminal("Term", [(1.0, "x", "x")]).unwrap();
        let result = b.build().parse(&Boxes(vec![Region::new(0, 0, 10, 10)]));

        assert_eq!(result.latex, "x");
    }

    /// A row of three digits "257" stacked with a single "x". With the row
    /// on top, its left edge lies outside the upward window of the "x", so
    /// the full stack can only be found looking down from the row. With the
    /// row at the bottom it can only be found looking up from the row.
    fn stacked_row(relation: Relation, row_on_top: bool) -> Recognition {
        init_logs();
        let classifier = TableClassifier::new(&["x", "two", "five", "seven"])
            .answer(0, &[("two", 0.9)])
            .answer(1, &[("five", 0.9)])
            .answer(2, &[("seven", 0.9)])
            .answer(3, &[("x", 0.9)]);
        let mut b = GrammarBuilder::new(Box::new(classifier));
        b.nonterminal("Frac");
        b.nonterminal("Row");
        b.nonterminal("Digit");
        b.nonterminal("Var");
        b.start_symbol("Frac").unwrap();
        b.terminal("Digit", [(1.0, "two", "2"), (1.0, "five", "5"), (1.0, "seven", "7")])
            .unwrap();
        b.terminal("Var", [(1.0, "x", "x")]).unwrap();
        b.rule(Relation::Horizontal, "Row", "Digit", "Digit", 1.0, "$1$2")
            .unwrap();
        b.rule(Relation::Horizontal, "Row", "Row", "Digit", 1.0, "$1$2")
            .unwrap();
        let (upper, lower) = if row_on_top { ("Row", "Var") } else { ("Var", "Row") };
        b.rule(relation, "Frac", upper, lower, 1.0, "\\frac{$1}{$2}")
            .unwrap();

        let (row_y, var_y) = if row_on_top { (0, 14) } else { (14, 0) };
        let sample = Boxes(vec![
            Region::new(0, row_y, 10, row_y + 10),
            Region::new(14, row_y, 24, row_y + 10),
            Region::new(28, row_y, 38, row_y + 10),
            Region::new(15, var_y, 25, var_y + 10),
        ]);
        b.build().parse(&sample)
    }

    #[test]
    fn test_fraction_found_below() {
        for relation in [Relation::Below, Relation::BelowAligned, Relation::Stacked] {
            let result = stacked_row(relation, true);
            assert_eq!(result.stats.reference, ReferenceSize::new(10, 10));
            assert_eq!(result.coverage, Coverage::Full, "{}", relation);
            assert_eq!(result.latex, "\\frac{257}{x}");
            assert_eq!(result.trace[0], format!("%VT% {} Frac -> Row Var", relation.code()));
        }
    }

    #[test]
    fn test_fraction_found_above() {
        for relation in [Relation::Below, Relation::Stacked] {
            let result = stacked_row(relation, false);
            assert_eq!(result.coverage, Coverage::Full, "{}", relation);
            assert_eq!(result.latex, "\\frac{x}{257}");
            assert_eq!(result.trace[0], format!("%VT% {} Frac -> Var Row", relation.code()));
        }
    }

    #[test]
    fn test_aligned_stack_not_tried_above() {
        // Only the two-digit row "57" is in the downward window of the "x".
        let result = stacked_row(Relation::BelowAligned, false);
        assert_eq!(result.coverage, Coverage::Partial { symbols: 3 });
        assert_eq!(result.latex, "\\frac{x}{57}");
    }

    #[test]
    fn test_enclosed_glyph() {
        let classifier = TableClassifier::new(&["sqrt", "x"])
            .answer(0, &[("sqrt", 0.9)])
            .answer(1, &[("x", 0.9)]);
        let mut b = GrammarBuilder::new(Box::new(classifier));
        b.nonterminal("Root");
        b.nonterminal("Radical");
        b.nonterminal("Var");
        b.start_symbol("Root").unwrap();
        b.terminal("Radical", [(1.0, "sqrt", "\\sqrt")]).unwrap();
        b.terminal("Var", [(1.0, "x", "x")]).unwrap();
        b.rule(Relation::Inside, "Root", "Radical", "Var", 1.0, "\\sqrt{$2}")
            .unwrap();

        let sample = Boxes(vec![Region::new(0, 0, 40, 30), Region::new(15, 8, 35, 26)]);
        let result = b.build().parse(&sample);

        assert_eq!(result.stats.reference, ReferenceSize::new(40, 30));
        assert_eq!(result.coverage, Coverage::Full);
        assert_eq!(result.latex, "\\sqrt{x}");
        assert_eq!(result.trace[0], "%VT% I Root -> Radical Var");

        // 1 - (5² + 4²) / (40² + 30²)
        let score = f64::from((1.0 - 41.0f64 / 2500.0) as f32);
        let expected = score.ln() + 2.0 * 0.9f64.ln();
        assert!((result.log_prob.unwrap().value() - expected).abs() < 1e-6);
    }

    fn placed_symbol(chart: &mut Chart, region: Region, nt: NonterminalId, comps: &[usize]) -> CellId {
        let mut cell = Cell::new(region, chart.nonterminals());
        cell.offer(
            nt,
            Symbol {
                log_prob: LogProb::from_prob(0.9),
                components: ComponentSet::from_components(4, comps),
                baselines: Baselines::for_glyph(
                    region,
                    SymbolType::Normal,
                    Centroids {
                        ascender: 5,
                        mean: 5,
                        descender: 5,
                    },
                ),
                origin: Origin::Terminal { rule: 0, class: 0 },
            },
        );
        chart.add(comps.len(), cell)
    }

    #[test]
    fn test_fusion_requires_disjoint_components() {
        let grammar = digits().build();
        let term = grammar.nonterminal_id("Term").unwrap();
        let ctx = ScoreContext {
            reference: ReferenceSize::new(10, 10),
            ..Default::default()
        };

        let mut chart = Chart::new(4, grammar.nonterminal_count());
        let a = placed_symbol(&mut chart, Region::new(0, 0, 10, 10), term, &[0, 1]);
        let b = placed_symbol(&mut chart, Region::new(14, 0, 24, 10), term, &[1, 2]);
        let c = placed_symbol(&mut chart, Region::new(14, 0, 25, 10), term, &[2, 3]);

        assert!(grammar.fusion(0, &chart, a, b, &ctx).is_none());

        let fused = grammar.fusion(0, &chart, a, c, &ctx).unwrap();
        assert_eq!(fused.region, Region::new(0, 0, 25, 10));
        let expr = grammar.nonterminal_id("Expr").unwrap();
        let symbol = fused.get(expr).unwrap();
        assert_eq!(symbol.components.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(
            symbol.origin,
            Origin::Binary {
                rule: 0,
                left: a,
                right: c
            }
        );
    }

    #[test]
    fn test_fusion_threshold() {
        let grammar = digits()
            .config(ParserConfig {
                fusion_threshold: 0.95,
                ..Default::default()
            })
            .build();
        let sample = Boxes(vec![Region::new(0, 0, 10, 10), Region::new(14, 0, 24, 10)]);
        let result = grammar.parse(&sample);
        assert_eq!(result.coverage, Coverage::Empty);
        assert_eq!(result.stats.fusions, 0);
        assert!(result.stats.fusion_attempts > 0);
    }

    #[test]
    fn test_undefined_nonterminal() {
        let mut b = digits();
        let err = b
            .rule(Relation::Below, "Expr", "Term", "Frac", 1.0, "$1$2")
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::UndefinedNonterminal { ref name, .. } if name == "Frac"));
        assert!(b.start_symbol("Missing").is_err());
        assert!(b.terminal("Missing", Vec::<(f64, &str, &str)>::new()).is_err());
    }

    #[test]
    fn test_stats_display() {
        let stats = ParseStats {
            nodes_per_span: vec![3, 2, 0],
            ..Default::default()
        };
        assert_eq!(
            stats.to_string(),
            "Size 1: Nodes generated 3\nSize 2: Nodes generated 2\nSize 3: Nodes generated 0\n\nTotal generated = 5"
        );
    }

    /// Write a grammar and its resources into a fresh temporary directory.
    fn grammar_dir(name: &str, rules: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("formula_cyk_{}_{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let glyph = |v: u8| vec![v.to_string(); 225].join(" ");
        let db = format!("2\nfive {}\ntwo {}\n", glyph(0), glyph(255));
        fs::write(dir.join("symbols.db"), db).unwrap();
        fs::write(dir.join("symbols.types"), "five n\ntwo n\n").unwrap();
        fs::write(dir.join("digits.txt"), "3\n1.0 five 5\n1.0 two 2\n1.0 seven 7\n").unwrap();

        let grammar = format!(
            "symbols.db\nsymbols.types\nExpr\nTerm\nSTART\nExpr\nPTERM\nTerm digits.txt\nPBIN\n{}",
            rules
        );
        fs::write(dir.join("grammar.txt"), grammar).unwrap();
        dir
    }

    #[test]
    fn test_load_grammar() {
        let dir = grammar_dir("load", "1.0 H Expr Term Term \"$1$2\"\n0.5 V Expr Term Term \"\\frac{$1}{$2}\" ABB\n");
        let grammar = Grammar::load(dir.join("grammar.txt")).unwrap();

        assert_eq!(grammar.nonterminal_count(), 2);
        assert_eq!(grammar.start_symbols(), &[0]);
        assert_eq!(grammar.classifier().class_count(), 2);
        assert_eq!(grammar.terminal(0).len(), 2);
        assert_eq!(grammar.rules().len(), 2);
        assert_eq!(grammar.rule(1).relation, Relation::Below);
        assert!(!grammar.rule(1).merge.hor);
        assert_eq!(grammar.rule(1).template.to_string(), "\\frac{$1}{$2}");

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_load_rejects_undefined_nonterminal() {
        let dir = grammar_dir("undefined", "1.0 H Expr Term Factor \"$1$2\"\n");
        let err = Grammar::load(dir.join("grammar.txt")).err().unwrap();
        assert!(matches!(
            err,
            LoadError::UndefinedNonterminal { line: 10, ref name } if name == "Factor"
        ));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_load_missing_file() {
        let err = Grammar::load("/nonexistent/grammar.txt").err().unwrap();
        assert!(matches!(err, LoadError::Io { .. }));
    }
}
