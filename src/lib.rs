//! # itemcache
//!
//! The in-memory item cache of a log-structured key-value filesystem. It
//! sits between the filesystem's item API and a segment-based persistent
//! store whose reads are expensive, absorbing writes as dirty items and
//! answering repeated lookups — including negative ones — without
//! re-reading segments.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        ItemCache                          │
//! │  ┌─────────────────┐      ┌────────────────────────────┐  │
//! │  │   Item tree     │      │        Range set           │  │
//! │  │  key → record   │      │  [start, end] intervals    │  │
//! │  │  + dirty bits   │      │  "cache is authoritative"  │  │
//! │  │  + LRU links    │      │                            │  │
//! │  └───────┬─────────┘      └──────────────┬─────────────┘  │
//! │          │  flush dirty                  │  fill on miss  │
//! │          ▼                               ▼                │
//! │   SegmentWriter ◄─ dirty stream   SegmentReader ─► batch  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`cache`] | Public API facade — lookups, writes, flush, invalidate, shrink |
//! | [`items`] | Ordered item tree with dirty-subtree augmentation and LRU links |
//! | [`ranges`] | Disjoint cached-range set with coalescing insert and splitting remove |
//! | [`key`] | Fixed-width key primitives: compare, increment, decrement |
//!
//! ## Key Properties
//!
//! - **Negative caching** — a cached range asserts the cache holds exactly
//!   the items the segments do for those keys, so a miss inside a range is
//!   an authoritative "no such item".
//! - **Tombstones** — deleting a key the segments still hold leaves a
//!   dirty deletion item in the cache until it is flushed.
//! - **Proportional dirty enumeration** — flush walks dirty items in key
//!   order in time proportional to the dirty count, via per-node subtree
//!   bits maintained through every rotation.
//! - **Range-aware eviction** — the shrinker frees cold items while
//!   shrinking or splitting their covering range, so negative caching
//!   stays sound under memory pressure.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use itemcache::{CacheConfig, CacheLock, ItemCache, Key};
//! # use itemcache::{Batch, CacheError, SegmentReader, TransactionTracker};
//! # struct Reader;
//! # impl SegmentReader for Reader {
//! #     fn read_items(&self, cache: &ItemCache, _key: &Key, start: &Key, end: &Key)
//! #         -> Result<(), CacheError> {
//! #         cache.insert_batch(Batch::new(), start, end)
//! #     }
//! # }
//! # struct Tracker;
//! # impl TransactionTracker for Tracker {
//! #     fn track_items(&self, _: i64, _: i64) {}
//! #     fn sync(&self, _: bool) -> Result<(), CacheError> { Ok(()) }
//! # }
//!
//! let cache = ItemCache::new(CacheConfig::default(), Arc::new(Reader), Arc::new(Tracker));
//! let lock = CacheLock::write(Key::zeros(), Key::ones());
//!
//! cache.create(&Key::from_u64(1), Some(b"hello"), &lock)?;
//!
//! let mut buf = [0u8; 8];
//! let n = cache.lookup(&Key::from_u64(1), Some(&mut buf), &lock)?;
//! assert_eq!(&buf[..n], b"hello");
//! # Ok::<(), CacheError>(())
//! ```

pub mod cache;
pub mod items;
pub mod key;
pub mod ranges;

pub use cache::{
    Batch, CacheConfig, CacheError, CacheLock, ItemCache, LockMode, MAX_VAL_SIZE, SavedItems,
    SegmentReader, SegmentWriter, TransactionTracker,
};
pub use key::{KEY_LEN, Key};
