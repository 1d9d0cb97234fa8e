//! Spatial relations between two hypotheses.
//!
//! Every binary rule names one of seven fixed relations. A relation decides
//! how well a right operand `B` is placed with respect to a left operand `A`
//! (a score in `[0, 1]`, 0 meaning incompatible), and how the baselines of
//! the combined hypothesis are derived from those of its children.
//!
//! Partial scores are computed in single precision; range tests and the
//! returned score use the values widened to `f64`.

use crate::reference::ReferenceSize;
use crate::region::{Baselines, Lines, Region};
use log::trace;
use std::fmt;

/// Maximum fraction of either region that may be covered by the other.
const MAX_OVERLAP: f64 = 0.85;

/// The seven relation kinds of a binary rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Relation {
    /// `B` follows `A` on the same baseline.
    Horizontal,
    /// `B` is centred below `A` (fractions).
    Below,
    /// `B` is below `A` with both edges aligned.
    BelowAligned,
    /// `A` and `B` are stacked left-aligned (a superscript over a subscript).
    Stacked,
    /// `B` is raised to the right of `A`.
    Superscript,
    /// `B` is lowered to the right of `A`.
    Subscript,
    /// `B` is enclosed by `A` (square roots).
    Inside,
}

/// Which child each baseline of a vertical composite is taken from.
///
/// `true` takes the field from the upper child `A`, `false` from `B`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeFlags {
    pub sup: bool,
    pub hor: bool,
    pub sub: bool,
}

impl Default for MergeFlags {
    fn default() -> Self {
        MergeFlags {
            sup: true,
            hor: true,
            sub: true,
        }
    }
}

impl MergeFlags {
    /// Parse a flag string such as `"AAB"`. Only the first three characters
    /// count; each is `A` for the left child, anything else for the right.
    pub fn parse(flags: &str) -> Option<Self> {
        let mut chars = flags.chars();
        let (sup, hor, sub) = (chars.next()?, chars.next()?, chars.next()?);
        Some(MergeFlags {
            sup: sup == 'A',
            hor: hor == 'A',
            sub: sub == 'A',
        })
    }
}

/// Inputs to scoring that are fixed for a whole parse.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScoreContext {
    pub reference: ReferenceSize,
    /// Apply the superscript height-ratio penalty to subscripts as well.
    pub penalize_subscript_height: bool,
}

/// A hypothesis as seen by a relation: where it is and its baselines.
#[derive(Clone, Copy, Debug)]
pub struct Placed<'a> {
    pub region: &'a Region,
    pub baselines: &'a Baselines,
}

impl Relation {
    /// Relation named in a grammar file.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "H" => Some(Relation::Horizontal),
            "V" => Some(Relation::Below),
            "Vs" => Some(Relation::BelowAligned),
            "SSE" => Some(Relation::Stacked),
            "Sup" => Some(Relation::Superscript),
            "Sub" => Some(Relation::Subscript),
            "Ins" => Some(Relation::Inside),
            _ => None,
        }
    }

    /// Name used in grammar files.
    pub fn name(&self) -> &'static str {
        match self {
            Relation::Horizontal => "H",
            Relation::Below => "V",
            Relation::BelowAligned => "Vs",
            Relation::Stacked => "SSE",
            Relation::Superscript => "Sup",
            Relation::Subscript => "Sub",
            Relation::Inside => "Ins",
        }
    }

    /// One-letter code used in Viterbi traces.
    pub fn code(&self) -> char {
        match self {
            Relation::Horizontal => 'H',
            Relation::Below => 'V',
            Relation::BelowAligned => 'e',
            Relation::Stacked => 'S',
            Relation::Superscript => 'P',
            Relation::Subscript => 'B',
            Relation::Inside => 'I',
        }
    }

    /// Whether grammar lines for this relation carry merge flags.
    pub fn takes_merge_flags(&self) -> bool {
        matches!(self, Relation::Below | Relation::BelowAligned)
    }

    /// Geometric compatibility of `b` placed relative to `a`.
    pub fn score(&self, a: Placed<'_>, b: Placed<'_>, ctx: &ScoreContext) -> f64 {
        let score = match self {
            Relation::Inside => inside(a.region, b.region, ctx.reference),
            _ if too_overlapped(a.region, b.region) => 0.0,
            Relation::Horizontal => beside(a, b, a.baselines.right.hor, ctx.reference)
                .map_or(0.0, |(p1, p2)| f64::from((p1 + p2) / 2.0)),
            Relation::Superscript => script(a, b, a.baselines.right.sup, true, ctx.reference),
            Relation::Subscript => script(
                a,
                b,
                a.baselines.right.sub,
                ctx.penalize_subscript_height,
                ctx.reference,
            ),
            Relation::Below => below(a.region, b.region, ctx.reference),
            Relation::BelowAligned => below_aligned(a.region, b.region, ctx.reference),
            Relation::Stacked => stacked(a.region, b.region, ctx.reference),
        };
        trace!("p({} {} {}) = {}", a.region, self.name(), b.region, score);
        score
    }

    /// Baselines of the hypothesis combining `a` (left child) and `b`.
    pub fn merge(&self, a: &Baselines, b: &Baselines, flags: MergeFlags) -> Baselines {
        match self {
            Relation::Horizontal | Relation::Inside => Baselines {
                left: a.left,
                right: b.right,
            },
            Relation::Below | Relation::BelowAligned => {
                let pick = |la: Lines, lb: Lines| Lines {
                    sup: if flags.sup { la.sup } else { lb.sup },
                    hor: if flags.hor { la.hor } else { lb.hor },
                    sub: if flags.sub { la.sub } else { lb.sub },
                };
                Baselines {
                    left: pick(a.left, b.left),
                    right: pick(a.right, b.right),
                }
            }
            Relation::Stacked => {
                let stack = |la: Lines, lb: Lines| Lines {
                    sup: la.hor,
                    hor: (la.hor + lb.hor) / 2,
                    sub: lb.hor,
                };
                Baselines {
                    left: stack(a.left, b.left),
                    right: stack(a.right, b.right),
                }
            }
            Relation::Superscript => Baselines {
                left: a.left,
                right: Lines {
                    sup: b.right.hor,
                    hor: a.right.hor,
                    sub: a.right.sub,
                },
            },
            Relation::Subscript => Baselines {
                left: a.left,
                right: Lines {
                    sup: a.right.sup,
                    hor: a.right.hor,
                    sub: b.right.hor,
                },
            },
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn too_overlapped(a: &Region, b: &Region) -> bool {
    f64::from(a.overlap(b)) > MAX_OVERLAP || f64::from(b.overlap(a)) > MAX_OVERLAP
}

fn average(p1: f32, p2: f32) -> f64 {
    if p1 <= 0.0 || p2 <= 0.0 {
        0.0
    } else {
        f64::from((p1 + p2) / 2.0)
    }
}

/// Partial scores of `b` to the right of `a`, with `b`'s central line
/// compared against `line` of `a`. `None` when out of range.
fn beside(a: Placed<'_>, b: Placed<'_>, line: i32, r: ReferenceSize) -> Option<(f32, f32)> {
    let (ra, rb) = (a.region, b.region);

    if rb.x < ra.s - r.rx.min(ra.width()) / 2 {
        return None;
    }

    let bh = b.baselines.left.hor;
    let hr = r.ry.max(ra.height()) as f32;
    let tolerance = f64::from(hr) * 0.7;
    if f64::from(bh) < f64::from(line) - tolerance || f64::from(bh) > f64::from(line) + tolerance {
        return None;
    }

    let dx = (rb.x - ra.s).abs();
    let p1 = (1.0 - f64::from(dx) / (3.0 * f64::from(r.rx))) as f32;
    let p2 = (1.0 - f64::from((bh - line).abs() as f32 / hr)) as f32;

    if p1 <= 0.0 || p2 <= 0.0 {
        None
    } else {
        Some((p1, p2))
    }
}

/// Superscript and subscript scoring: `beside` against the raised or
/// lowered line, optionally scaled down when `a` is shorter than `b`.
fn script(a: Placed<'_>, b: Placed<'_>, line: i32, penalize: bool, r: ReferenceSize) -> f64 {
    let Some((p1, p2)) = beside(a, b, line, r) else {
        return 0.0;
    };

    let mut score = (p1 + p2) / 2.0;
    if penalize {
        let clamp = |h: f32| if h <= 0.0 { 0.1 } else { h };
        let ha = clamp((a.baselines.right.sub - a.baselines.right.sup) as f32);
        let hb = clamp((b.baselines.left.sub - b.baselines.left.sup) as f32);
        let ratio = ha / hb;
        if ratio < 1.0 {
            score = (f64::from(score) * (f64::from(ratio) - 0.05)) as f32;
        }
    }
    f64::from(score)
}

fn below(a: &Region, b: &Region, r: ReferenceSize) -> f64 {
    if b.y < a.t {
        return 0.0;
    }

    let amx = a.width();
    let wr = (f64::from(r.rx.max(amx)) * 0.9) as f32;
    let cb = b.x + (b.s - b.x) / 2;
    let tolerance = f64::from(wr) * 0.7;
    if f64::from(cb) < f64::from(a.x) - tolerance || f64::from(cb) > f64::from(a.s) + tolerance {
        return 0.0;
    }

    let dy = (b.y - a.t).abs();
    let p1 = (1.0 - f64::from(dy) / (3.0 * f64::from(r.ry))) as f32;
    let p2 = (1.0 - f64::from((cb - (a.x + amx / 2)).abs() as f32 / wr)) as f32;
    average(p1, p2)
}

fn below_aligned(a: &Region, b: &Region, r: ReferenceSize) -> f64 {
    if b.y < a.t {
        return 0.0;
    }

    let dy = (b.y - a.t).abs();
    let edges = (a.x - b.x).abs() + (a.s - b.s).abs();
    let p1 = (1.0 - f64::from(dy) / (3.0 * f64::from(r.ry))) as f32;
    let p2 = (1.0 - f64::from(edges) / (3.0 * f64::from(r.rx))) as f32;
    average(p1, p2)
}

fn stacked(a: &Region, b: &Region, r: ReferenceSize) -> f64 {
    if b.y < a.t {
        return 0.0;
    }

    let p1 = (1.0 - f64::from((b.y - a.t).abs()) / (3.0 * f64::from(r.ry))) as f32;
    let p2 = (1.0 - f64::from((a.x - b.x).abs()) / (3.0 * f64::from(r.rx))) as f32;
    average(p1, p2)
}

/// No lower bound: a badly placed enclosed region scores below zero.
fn inside(a: &Region, b: &Region, r: ReferenceSize) -> f64 {
    if f64::from(b.overlap(a)) < MAX_OVERLAP {
        return 0.0;
    }
    if b.x < a.x || b.y < a.y {
        return 0.0;
    }

    let dx = (a.s - b.s).abs();
    let dy = (a.t - b.t).abs();
    let num = (dx * dx + dy * dy) as f32;
    let den = (r.rx * r.rx + r.ry * r.ry) as f32;
    f64::from((1.0 - f64::from(num / den)) as f32)
}
