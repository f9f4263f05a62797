//! Memory-pressure shrinking.
//!
//! Evicting a clean item is only safe if the range invariant survives: a
//! key missing inside a cached range is an authoritative negative, so an
//! evicted item must take its range coverage with it. The shrinker walks
//! outward from an LRU victim to find boundary items whose keys can be
//! nudged by one to become new range endpoints, then erases the items
//! between the boundaries and shrinks, splits, or drops the enclosing
//! range to match.
//!
//! Items whose keys are outside every range are plain cached positives and
//! are freed directly. Patterns of keys that refuse to yield a boundary
//! are rotated to the LRU tail rather than looping forever.

use tracing::{debug, trace};

use super::{CacheInner, CacheError, ItemCache};
use crate::items::ItemId;
use crate::key::Key;

/// Direction of a boundary walk from the victim item.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Walk {
    Left,
    Right,
}

impl ItemCache {
    /// Shrinks the cache under memory pressure, trying to free around
    /// `nr_to_scan` items. Returns the remaining LRU size, clamped to the
    /// signed maximum the memory subsystem expects.
    pub fn shrink(&self, nr_to_scan: usize) -> Result<usize, CacheError> {
        if nr_to_scan == 0 {
            let inner = self.lock_inner()?;
            return Ok(inner.items.lru_len().min(i32::MAX as usize));
        }

        let mut inner = self.lock_inner()?;
        let inner = &mut *inner;

        let mut nr = nr_to_scan;
        let mut first_rotated: Option<ItemId> = None;

        while nr > 0 {
            let Some(id) = inner.items.lru_front() else {
                break;
            };
            assert!(!inner.items.is_self_dirty(id), "dirty item on the lru");

            let key = *inner.items.key(id);

            // Not covered by any range: a plain cached positive, free it.
            let Some((rng_start, rng_end)) = inner.ranges.find(&key) else {
                trace!(key = %key, "shrinking item outside ranges");
                self.erase_item(inner, id);
                nr -= 1;
                continue;
            };

            let freed = self.shrink_around(inner, &rng_start, &rng_end, id);
            if freed == 0 {
                // No usable boundary around this item; rotate it away and
                // stop if the rotation comes full circle.
                if first_rotated == Some(id) {
                    break;
                }
                if first_rotated.is_none() {
                    first_rotated = Some(id);
                }
                inner.items.lru_move_back(id);
                continue;
            }

            nr -= freed.min(nr);
        }

        // Ranges describing an empty item tree hold no information worth
        // their memory.
        while inner.items.is_empty() {
            let Some((start, end)) = inner.ranges.first() else {
                break;
            };
            trace!(start = %start, end = %end, "dropping range of empty tree");
            inner.ranges.remove_exact(&start);
        }

        Ok(inner.items.lru_len().min(i32::MAX as usize))
    }

    /// Frees items around an LRU victim inside its enclosing range,
    /// adjusting the range so the cache stays authoritative over whatever
    /// survives. Returns the number of items freed; 0 means no progress.
    fn shrink_around(
        &self,
        inner: &mut CacheInner,
        rng_start: &Key,
        rng_end: &Key,
        victim: ItemId,
    ) -> usize {
        let (first, prev_survivor) = self.shrink_boundary(inner, victim, rng_start, Walk::Left);
        let (last, next_survivor) = self.shrink_boundary(inner, victim, rng_end, Walk::Right);

        // No boundary on one side means no way to place a new endpoint.
        let (Some(first), Some(last)) = (first, last) else {
            debug!(key = %inner.items.key(victim), "shrink found no usable boundary");
            return 0;
        };

        // A split needs a gap between the two surviving sides; a single
        // erased item can't provide one.
        if prev_survivor.is_some() && next_survivor.is_some() && first == last {
            debug!(key = %inner.items.key(victim), "shrink split too small");
            return 0;
        }

        let first_key = *inner.items.key(first);
        let last_key = *inner.items.key(last);

        // Replace the enclosing range with the surviving side(s). Items
        // remain to the left iff a left survivor was seen, symmetric on
        // the right; with both, the range splits around the erased gap.
        inner.ranges.remove_exact(rng_start);
        if prev_survivor.is_some() {
            inner.ranges.insert(*rng_start, first_key.prev());
        }
        if next_survivor.is_some() {
            inner.ranges.insert(last_key.next(), *rng_end);
        }

        trace!(
            first = %first_key,
            last = %last_key,
            split = prev_survivor.is_some() && next_survivor.is_some(),
            "shrinking items"
        );

        let mut nr = 0;
        let mut cur = Some(first);
        while let Some(id) = cur {
            let next = if id == last {
                None
            } else {
                inner.items.next_node(id)
            };
            self.erase_item(inner, id);
            nr += 1;
            cur = next;
        }
        nr
    }

    /// Walks outward from `from`, looking for the furthest item usable as
    /// a shrink boundary before `limit` (the enclosing range endpoint).
    ///
    /// An item is usable when nudging its key by one toward the walk
    /// direction does not cross the next remaining item — only key
    /// encodings with shared prefixes can refuse. The walk records the
    /// boundary and the surviving neighbour beyond it, stops early past
    /// `boundary_min` once a boundary is held, always stops at a dirty
    /// neighbour, and gives up after `boundary_max` steps. Reaching the
    /// range end yields a boundary with no survivor on that side.
    fn shrink_boundary(
        &self,
        inner: &CacheInner,
        from: ItemId,
        limit: &Key,
        walk: Walk,
    ) -> (Option<ItemId>, Option<ItemId>) {
        let mut item = from;
        let mut found = None;
        let mut survivor = None;

        for step in 0..self.config().boundary_max {
            let neighbour = match walk {
                Walk::Right => inner.items.next_node(item),
                Walk::Left => inner.items.prev_node(item),
            };

            let in_range = neighbour.is_some_and(|n| match walk {
                Walk::Right => inner.items.key(n) <= limit,
                Walk::Left => inner.items.key(n) >= limit,
            });
            if !in_range {
                // Nothing else inside the range on this side; the walk
                // item itself bounds the erasure up to the range end.
                return (Some(item), None);
            }
            let neighbour = neighbour.expect("in-range neighbour vanished");

            let usable = match walk {
                Walk::Right => inner.items.key(item).next() <= *inner.items.key(neighbour),
                Walk::Left => inner.items.key(item).prev() >= *inner.items.key(neighbour),
            };
            if usable {
                found = Some(item);
                survivor = Some(neighbour);
                if step >= self.config().boundary_min {
                    break;
                }
            }

            if inner.items.is_self_dirty(neighbour) {
                trace!(key = %inner.items.key(neighbour), "boundary walk hit dirty item");
                break;
            }

            item = neighbour;
        }

        (found, survivor)
    }
}
