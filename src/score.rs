//! Log-domain probabilities.
//!
//! Hypotheses are ranked in the Viterbi (max, ×) semiring, carried out in log
//! space: combining two derivations adds their log-probabilities and choosing
//! between competitors takes the maximum. `LogProb` wraps the value in an
//! `OrderedFloat` so it can be compared, sorted and used with `max_by_key`.

use ordered_float::OrderedFloat;
use std::fmt;
use std::ops::Mul;

/// Natural-log probability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogProb(pub OrderedFloat<f64>);

impl LogProb {
    /// The log of zero; the absorbing element for `*`.
    pub const IMPOSSIBLE: LogProb = LogProb(OrderedFloat(f64::NEG_INFINITY));

    /// The log of one; the identity for `*`.
    pub const CERTAIN: LogProb = LogProb(OrderedFloat(0.0));

    pub fn new(log_value: f64) -> Self {
        LogProb(OrderedFloat(log_value))
    }

    /// Log of a probability in `[0, 1]`. Non-positive inputs are impossible.
    pub fn from_prob(p: f64) -> Self {
        if p > 0.0 {
            LogProb::new(p.ln())
        } else {
            LogProb::IMPOSSIBLE
        }
    }

    pub fn value(&self) -> f64 {
        self.0.into_inner()
    }

    /// Back to the linear domain.
    pub fn prob(&self) -> f64 {
        self.value().exp()
    }

    pub fn is_possible(&self) -> bool {
        self.value() > f64::NEG_INFINITY
    }
}

/// Joint score of independent events.
impl Mul for LogProb {
    type Output = Self;

    fn mul(self, other: Self) -> Self {
        LogProb::new(self.value() + other.value())
    }
}

impl fmt::Display for LogProb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}
