//! Dense register sets.
//!
//! The lattice element of every dataflow problem: a fixed-width bit set over
//! a routine's register indices.

use std::fmt;

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct RegSet {
    words: Vec<u64>,
    width: usize,
}

impl RegSet {
    /// Empty set over registers `0..width`.
    pub fn new(width: usize) -> Self {
        RegSet {
            words: vec![0; width.div_ceil(64)],
            width,
        }
    }

    /// Set containing every register in `0..width`.
    pub fn full(width: usize) -> Self {
        let mut set = RegSet::new(width);
        for r in 0..width {
            set.insert(r);
        }
        set
    }

    /// Set containing registers `0..count`.
    pub fn prefix(width: usize, count: usize) -> Self {
        let mut set = RegSet::new(width);
        for r in 0..count.min(width) {
            set.insert(r);
        }
        set
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Returns `true` when `reg` was newly added.
    #[inline]
    pub fn insert(&mut self, reg: usize) -> bool {
        if reg >= self.width {
            return false;
        }
        let word = &mut self.words[reg / 64];
        let bit = 1u64 << (reg % 64);
        let added = *word & bit == 0;
        *word |= bit;
        added
    }

    #[inline]
    pub fn remove(&mut self, reg: usize) {
        if reg < self.width {
            self.words[reg / 64] &= !(1u64 << (reg % 64));
        }
    }

    #[inline]
    pub fn contains(&self, reg: usize) -> bool {
        reg < self.width && self.words[reg / 64] & (1u64 << (reg % 64)) != 0
    }

    /// Union in place; returns `true` when `self` grew.
    pub fn union_with(&mut self, other: &RegSet) -> bool {
        let mut changed = false;
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            let next = *w | *o;
            changed |= next != *w;
            *w = next;
        }
        changed
    }

    /// Intersection in place; returns `true` when `self` shrank.
    pub fn intersect_with(&mut self, other: &RegSet) -> bool {
        let mut changed = false;
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            let next = *w & *o;
            changed |= next != *w;
            *w = next;
        }
        changed
    }

    pub fn is_subset(&self, other: &RegSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter().chain(std::iter::repeat(&0)))
            .all(|(a, b)| a & !b == 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.width).filter(|r| self.contains(*r))
    }

    /// Grow the universe to `width`, keeping members.
    pub fn resize(&mut self, width: usize) {
        self.words.resize(width.div_ceil(64), 0);
        self.width = width;
    }
}

impl fmt::Debug for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
