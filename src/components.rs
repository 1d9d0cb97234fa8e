//! Fixed-width set of connected-component indices.
//!
//! Every hypothesis records which primitive components it explains. Two
//! hypotheses may only be combined when these sets are disjoint, and the
//! combination covers their union, so both operations are word-parallel.

use std::fmt;

const WORD_BITS: usize = u64::BITS as usize;

/// Set of component indices in `0..capacity`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ComponentSet {
    words: Box<[u64]>,
    capacity: usize,
}

impl ComponentSet {
    /// Empty set able to hold indices below `capacity`.
    pub fn new(capacity: usize) -> Self {
        ComponentSet {
            words: vec![0; capacity.div_ceil(WORD_BITS)].into_boxed_slice(),
            capacity,
        }
    }

    /// Set holding exactly the given components.
    pub fn from_components(capacity: usize, components: &[usize]) -> Self {
        let mut set = ComponentSet::new(capacity);
        for &c in components {
            set.insert(c);
        }
        set
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a component. Panics if `component >= capacity`.
    pub fn insert(&mut self, component: usize) {
        assert!(
            component < self.capacity,
            "component {} out of range for set of {}",
            component,
            self.capacity
        );
        self.words[component / WORD_BITS] |= 1u64 << (component % WORD_BITS);
    }

    pub fn contains(&self, component: usize) -> bool {
        component < self.capacity
            && (self.words[component / WORD_BITS] & (1u64 << (component % WORD_BITS))) != 0
    }

    /// Number of components in the set.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// True when no component belongs to both sets.
    pub fn is_disjoint(&self, other: &ComponentSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| (a & b) == 0)
    }

    /// Components in either set.
    pub fn union(&self, other: &ComponentSet) -> ComponentSet {
        debug_assert_eq!(self.capacity, other.capacity);
        ComponentSet {
            words: self
                .words
                .iter()
                .zip(other.words.iter())
                .map(|(a, b)| a | b)
                .collect(),
            capacity: self.capacity,
        }
    }

    /// Iterate over members in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(i * WORD_BITS + bit)
            })
        })
    }
}

impl fmt::Debug for ComponentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
