//! # Cached Range Set
//!
//! An ordered set of closed key intervals `[start, end]`. A stored range
//! asserts that the cache is authoritative over it: for every key inside,
//! an item record exists in the item tree iff the key exists in the
//! persistent layer, so a missing item is a valid negative lookup.
//!
//! ## Invariants
//!
//! - Stored ranges are pairwise disjoint.
//! - Overlapping ranges are fused on insertion. Merely **adjacent** ranges
//!   (`a.end + 1 == b.start`) are left separate — adjacency carries no
//!   extra information and fusing it would force key stepping on every
//!   insert.
//!
//! ## Representation
//!
//! A `BTreeMap<Key, Key>` keyed by range start. A point query finds the
//! last range starting at or below the key and checks its end; overlap
//! scans walk map ranges instead of restarting a tree descent.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;

use tracing::trace;

use crate::key::Key;

/// The ordered set of cached ranges.
#[derive(Debug, Default)]
pub struct RangeSet {
    map: BTreeMap<Key, Key>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the range enclosing `key`, if any.
    pub fn find(&self, key: &Key) -> Option<(Key, Key)> {
        self.map
            .range(..=*key)
            .next_back()
            .filter(|(_, end)| *end >= key)
            .map(|(start, end)| (*start, *end))
    }

    /// Returns the first stored range whose start is >= `key`.
    pub fn next_range(&self, key: &Key) -> Option<(Key, Key)> {
        self.map
            .range(*key..)
            .next()
            .map(|(start, end)| (*start, *end))
    }

    /// Returns the first stored range in start order.
    pub fn first(&self) -> Option<(Key, Key)> {
        self.map.first_key_value().map(|(start, end)| (*start, *end))
    }

    /// Removes a specific stored range by its start key.
    pub fn remove_exact(&mut self, start: &Key) -> Option<Key> {
        self.map.remove(start)
    }

    /// Collects the starts of every stored range overlapping `[start, end]`.
    fn overlapping(&self, start: &Key, end: &Key) -> Vec<Key> {
        let mut starts: Vec<Key> = self
            .map
            .range(*start..=*end)
            .map(|(s, _)| *s)
            .collect();

        // A range beginning below `start` may still reach into the
        // interval.
        if let Some((s, e)) = self
            .map
            .range(..*start)
            .next_back()
            .map(|(s, e)| (*s, *e))
            && e >= *start
        {
            starts.insert(0, s);
        }

        starts
    }

    /// Merges `[start, end]` into the set, fusing any overlapping ranges
    /// into their union.
    pub fn insert(&mut self, mut start: Key, mut end: Key) {
        debug_assert!(start <= end);

        for s in self.overlapping(&start, &end) {
            let e = self.map.remove(&s).expect("overlap scan returned stale start");
            if s < start {
                start = s;
            }
            if e > end {
                end = e;
            }
            trace!(absorbed_start = %s, absorbed_end = %e, "range fused on insert");
        }

        self.map.insert(start, end);
    }

    /// Removes `[start, end]` from coverage. Fully covered ranges are
    /// erased; a strictly interior removal splits the enclosing range into
    /// two; partial overlaps shrink the stored range to the surviving side
    /// using key increment/decrement for the `±1` boundaries.
    pub fn remove(&mut self, start: &Key, end: &Key) {
        debug_assert!(start <= end);

        for s in self.overlapping(start, end) {
            let e = self.map.remove(&s).expect("overlap scan returned stale start");

            if s < *start {
                // Surviving left piece [s, start - 1].
                self.map.insert(s, start.prev());
            }
            if e > *end {
                // Surviving right piece [end + 1, e].
                self.map.insert(end.next(), e);
            }
            if s < *start && e > *end {
                trace!(rng_start = %s, rng_end = %e, "range split by removal");
            }
        }
    }

    /// Iterates stored ranges in start order.
    pub fn iter(&self) -> impl Iterator<Item = (Key, Key)> + '_ {
        self.map.iter().map(|(start, end)| (*start, *end))
    }

    /// Iterates stored ranges whose start is >= `key`, in start order.
    pub fn iter_from(&self, key: &Key) -> impl Iterator<Item = (Key, Key)> + '_ {
        self.map.range(*key..).map(|(start, end)| (*start, *end))
    }
}

// ------------------------------------------------------------------------------------------------
// Test support
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
impl RangeSet {
    /// Verifies disjointness: every stored range is well formed and ends
    /// before the next one starts.
    pub(crate) fn check_invariants(&self) {
        let mut prev_end: Option<Key> = None;
        for (start, end) in self.iter() {
            assert!(start <= end, "inverted range");
            if let Some(pe) = prev_end {
                assert!(pe < start, "overlapping ranges stored");
            }
            prev_end = Some(end);
        }
    }
}
