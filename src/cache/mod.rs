//! # Item Cache
//!
//! The public face of the crate: an in-memory cache of filesystem items
//! that sits between the item API and a segment store whose reads are
//! expensive.
//!
//! ## Design Overview
//!
//! Two structures cooperate under one lock:
//!
//! 1. The **item tree** ([`ItemTree`]) holds one record per cached key,
//!    augmented so dirty items enumerate in key order proportionally to
//!    the dirty count.
//! 2. The **range set** ([`RangeSet`]) records closed key intervals over
//!    which the cache is authoritative. A missing item inside a cached
//!    range is a negative lookup hit; outside any range it means nothing
//!    and triggers a fill.
//!
//! Deletions of persistent keys become tombstone items that survive in the
//! cache until they are flushed to a segment; lookups skip them, creations
//! clobber them.
//!
//! ## Concurrency Model
//!
//! All shared state lives in a single `Mutex<CacheInner>`. Critical
//! sections are short tree and list manipulations. Anything that calls out
//! — the segment reader on a miss, the transaction sync in writeback —
//! runs with the lock released, and every caller loops back to re-check
//! both item and range presence after re-acquiring.
//!
//! ## Fill Loop
//!
//! Read-through operations share one shape: observe under the lock; if the
//! position is not covered by a cached range, release the lock, ask the
//! [`SegmentReader`] to populate it (the reader calls
//! [`ItemCache::insert_batch`] with the covered range), and retry. The
//! internal fill signal never escapes to callers; a failed fill aborts the
//! loop with the reader's error.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

mod shrink;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{error, trace, warn};

use crate::items::{ItemId, ItemRecord, ItemTree};
use crate::key::Key;
use crate::ranges::RangeSet;

// ------------------------------------------------------------------------------------------------
// Constants and configuration
// ------------------------------------------------------------------------------------------------

/// Largest value accepted for a single item, in bytes.
pub const MAX_VAL_SIZE: usize = 4096;

/// Tunables for an [`ItemCache`] instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Max accepted value length in bytes.
    pub max_val_size: usize,

    /// Shrink boundary walks stop early past this many examined items once
    /// a usable boundary is found.
    pub boundary_min: usize,

    /// Hard limit on items examined per shrink boundary walk.
    pub boundary_max: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_val_size: MAX_VAL_SIZE,
            boundary_min: 32,
            boundary_max: 300,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`ItemCache`] operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Caller bug: lock coverage failure, inverted range, or oversize value.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No item at the key; authoritative when a cached range covers it.
    #[error("item not found")]
    NotFound,

    /// Create of a key that already has a live item.
    #[error("item already exists")]
    Exists,

    /// The found value's length did not match the caller's exact-size
    /// buffer; callers treat this as corruption.
    #[error("value length mismatch")]
    SizeMismatch,

    /// I/O failure from a collaborator (segment reader, transaction sync).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Locks
// ------------------------------------------------------------------------------------------------

/// Access mode carried by a distributed lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
    WriteOnly,
}

/// A distributed lock held by the caller over `[start, end]`.
///
/// Coverage checks are advisory on this node: they catch caller bugs, but
/// inter-node consistency only holds if the caller actually holds the lock.
#[derive(Debug, Clone)]
pub struct CacheLock {
    pub mode: LockMode,
    pub start: Key,
    pub end: Key,
}

impl CacheLock {
    pub fn new(mode: LockMode, start: Key, end: Key) -> Self {
        Self { mode, start, end }
    }

    pub fn read(start: Key, end: Key) -> Self {
        Self::new(LockMode::Read, start, end)
    }

    pub fn write(start: Key, end: Key) -> Self {
        Self::new(LockMode::Write, start, end)
    }

    pub fn write_only(start: Key, end: Key) -> Self {
        Self::new(LockMode::WriteOnly, start, end)
    }

    /// True when this lock protects `op` on `key`: the mode matches (a
    /// WRITE lock also satisfies READ) and the key is inside the range.
    pub fn covers(&self, key: &Key, op: LockMode) -> bool {
        let mode_ok =
            op == self.mode || (op == LockMode::Read && self.mode == LockMode::Write);
        mode_ok && key.range_cmp(&self.start, &self.end) == std::cmp::Ordering::Equal
    }
}

// ------------------------------------------------------------------------------------------------
// Collaborator traits
// ------------------------------------------------------------------------------------------------

/// Reads items from the segment store on a cache miss.
pub trait SegmentReader: Send + Sync {
    /// Populates the cache around `key`. On success the reader must have
    /// called [`ItemCache::insert_batch`] with a range that covers `key`
    /// and lies within `[lock_start, lock_end]`.
    ///
    /// Called with the cache lock released.
    fn read_items(
        &self,
        cache: &ItemCache,
        key: &Key,
        lock_start: &Key,
        lock_end: &Key,
    ) -> Result<(), CacheError>;
}

/// Consumes the dirty item stream during a flush.
pub trait SegmentWriter {
    /// Appends one item to the segment being built. Returns false when the
    /// segment is out of space; flush treats that as a broken reservation.
    fn append_item(&mut self, key: &Key, val: &[u8], deletion: bool) -> bool;

    /// True when a segment can hold the given totals in one write.
    fn fits_single(&self, nr_items: u64, val_bytes: u64) -> bool;
}

/// Receives dirty-count deltas and serves sync requests.
pub trait TransactionTracker: Send + Sync {
    /// Called under the cache lock with every dirty accounting change; must
    /// not block or call back into the cache.
    fn track_items(&self, items_delta: i64, val_bytes_delta: i64);

    /// Writes out the current transaction. Called with the cache lock
    /// released.
    fn sync(&self, wait: bool) -> Result<(), CacheError>;
}

// ------------------------------------------------------------------------------------------------
// Batches and saved items
// ------------------------------------------------------------------------------------------------

/// Items staged by a segment reader before a batch insert.
///
/// The reader appends in sorted order; [`ItemCache::insert_batch`] consumes
/// the batch and drops any duplicates that lost to newer cached records.
#[derive(Default)]
pub struct Batch {
    items: Vec<ItemRecord>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

struct SavedItem {
    record: ItemRecord,
    was_dirty: bool,
}

/// Items removed by [`ItemCache::delete_save`], held for a later
/// [`ItemCache::restore`].
#[derive(Default)]
pub struct SavedItems {
    items: Vec<SavedItem>,
}

impl SavedItems {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ------------------------------------------------------------------------------------------------
// Cache state
// ------------------------------------------------------------------------------------------------

pub(crate) struct CacheInner {
    pub(crate) items: ItemTree,
    pub(crate) ranges: RangeSet,
    pub(crate) nr_dirty_items: i64,
    pub(crate) dirty_val_bytes: i64,
}

/// The item cache. Thread-safe; clone-free sharing happens through an
/// `Arc<ItemCache>` held by the filesystem mount.
pub struct ItemCache {
    inner: Mutex<CacheInner>,
    reader: Arc<dyn SegmentReader>,
    tracker: Arc<dyn TransactionTracker>,
    config: CacheConfig,
}

/// Result of one locked attempt in a read-through loop. `Fill` never
/// escapes the loop; it releases the lock, runs the reader, and retries.
enum Step<T> {
    Done(Result<T, CacheError>),
    Fill,
}

/// How an insertion treats an existing item at the same key.
#[derive(Clone, Copy, PartialEq, Eq)]
enum InsertMode {
    /// New logical item: only a tombstone may be replaced (inheriting its
    /// persistence).
    Create,

    /// Force path: any existing item is replaced, inheriting persistence.
    LogicalOverwrite,

    /// Read population: never replaces — the cached record may be newer
    /// than what was just read.
    CachePopulate,
}

impl ItemCache {
    /// Creates a cache wired to its collaborators. The cache spans the
    /// filesystem mount lifetime; memory-pressure callbacks should be
    /// registered to call [`ItemCache::shrink`].
    pub fn new(
        config: CacheConfig,
        reader: Arc<dyn SegmentReader>,
        tracker: Arc<dyn TransactionTracker>,
    ) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                items: ItemTree::new(),
                ranges: RangeSet::new(),
                nr_dirty_items: 0,
                dirty_val_bytes: 0,
            }),
            reader,
            tracker,
            config,
        }
    }

    pub(crate) fn lock_inner(&self) -> Result<MutexGuard<'_, CacheInner>, CacheError> {
        self.inner
            .lock()
            .map_err(|_| CacheError::Internal("cache lock poisoned".into()))
    }

    fn check_val(&self, val: Option<&[u8]>) -> Result<(), CacheError> {
        match val {
            Some(v) if v.len() > self.config.max_val_size => {
                Err(CacheError::InvalidArgument("value too large"))
            }
            _ => Ok(()),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Dirty accounting
    // --------------------------------------------------------------------------------------------

    fn track_dirty(&self, inner: &mut CacheInner, items: i64, vals: i64) {
        inner.nr_dirty_items += items;
        inner.dirty_val_bytes += vals;
        debug_assert!(inner.nr_dirty_items >= 0 && inner.dirty_val_bytes >= 0);
        self.tracker.track_items(items, vals);
    }

    /// Marks an item dirty: off the LRU, counted, bits propagated.
    pub(crate) fn mark_item_dirty(&self, inner: &mut CacheInner, id: ItemId) {
        if inner.items.is_self_dirty(id) {
            return;
        }
        inner.items.lru_unlink(id);
        inner.items.set_self_dirty(id);
        let vals = inner.items.data(id).val_len() as i64;
        self.track_dirty(inner, 1, vals);
    }

    /// Clears an item's dirty state: back on the LRU tail, uncounted.
    pub(crate) fn clear_item_dirty(&self, inner: &mut CacheInner, id: ItemId) {
        if !inner.items.is_self_dirty(id) {
            return;
        }
        inner.items.clear_self_dirty(id);
        inner.items.lru_push_back(id);
        let vals = inner.items.data(id).val_len() as i64;
        self.track_dirty(inner, -1, -vals);
    }

    /// Removes an item from all tracking structures and returns its record.
    pub(crate) fn erase_item(&self, inner: &mut CacheInner, id: ItemId) -> ItemRecord {
        self.clear_item_dirty(inner, id);
        inner.items.remove(id)
    }

    /// Deletes an item from the cache. Non-persistent items are erased
    /// outright; persistent ones become dirty tombstones so the segment
    /// store learns of the erase on the next flush.
    fn delete_item(&self, inner: &mut CacheInner, id: ItemId) {
        if !inner.items.data(id).persistent {
            self.erase_item(inner, id);
            return;
        }

        // Settles the accounting for the old value length before the value
        // is dropped.
        self.clear_item_dirty(inner, id);

        let data = inner.items.data_mut(id);
        data.val = None;
        data.deletion = true;
        self.mark_item_dirty(inner, id);
    }

    /// Adds an item under the replacement policy of `mode`. On rejection
    /// the record is handed back so the caller keeps ownership.
    fn insert_item(
        &self,
        inner: &mut CacheInner,
        mut record: ItemRecord,
        mode: InsertMode,
    ) -> Result<ItemId, ItemRecord> {
        loop {
            let Some(existing) = inner.items.find(&record.key) else {
                return Ok(inner.items.insert(record));
            };

            let replace = match mode {
                InsertMode::CachePopulate => false,
                InsertMode::LogicalOverwrite => true,
                InsertMode::Create => inner.items.data(existing).deletion,
            };
            if !replace {
                return Err(record);
            }

            // The replacement must keep writing a deletion for a key the
            // segments still hold.
            if inner.items.data(existing).persistent {
                record.data.persistent = true;
            }
            self.erase_item(inner, existing);
        }
    }

    /// Finds a live (non-tombstone) item.
    fn find_live(inner: &CacheInner, key: &Key) -> Option<ItemId> {
        inner
            .items
            .find(key)
            .filter(|id| !inner.items.data(*id).deletion)
    }

    /// Copies an item's value into the caller's buffer, truncating to fit.
    /// Returns the bytes copied; 0 when no buffer was supplied.
    fn copy_val(dst: Option<&mut [u8]>, src: &[u8]) -> usize {
        match dst {
            Some(buf) => {
                let n = src.len().min(buf.len());
                buf[..n].copy_from_slice(&src[..n]);
                n
            }
            None => 0,
        }
    }

    /// Runs `attempt` under the lock until it resolves, filling the cache
    /// around `key` whenever it reports a coverage miss.
    fn read_through<T>(
        &self,
        key: &Key,
        lock: &CacheLock,
        mut attempt: impl FnMut(&Self, &mut CacheInner) -> Step<T>,
    ) -> Result<T, CacheError> {
        loop {
            let step = {
                let mut inner = self.lock_inner()?;
                attempt(self, &mut inner)
            };
            match step {
                Step::Done(result) => return result,
                Step::Fill => {
                    trace!(key = %key, "cache miss, reading items from segments");
                    self.reader.read_items(self, key, &lock.start, &lock.end)?;
                }
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Lookups
    // --------------------------------------------------------------------------------------------

    /// Finds the item at `key` and copies its value into `val`, truncated
    /// to the buffer. Returns the bytes copied (0 without a buffer).
    ///
    /// Tombstones read as absent. A miss inside a cached range is an
    /// authoritative [`CacheError::NotFound`]; a miss outside triggers a
    /// segment fill and a retry.
    pub fn lookup(
        &self,
        key: &Key,
        val: Option<&mut [u8]>,
        lock: &CacheLock,
    ) -> Result<usize, CacheError> {
        if !lock.covers(key, LockMode::Read) {
            return Err(CacheError::InvalidArgument("lock does not cover key"));
        }
        trace!(key = %key, "lookup");

        let mut val = val;
        self.read_through(key, lock, |_, inner| {
            if let Some(id) = Self::find_live(inner, key) {
                inner.items.lru_move_back(id);
                let copied = match inner.items.data(id).val.as_deref() {
                    Some(src) => Self::copy_val(val.as_deref_mut(), src),
                    None => 0,
                };
                Step::Done(Ok(copied))
            } else if inner.ranges.find(key).is_some() {
                Step::Done(Err(CacheError::NotFound))
            } else {
                Step::Fill
            }
        })
    }

    /// Like [`ItemCache::lookup`] but requires the stored value length to
    /// equal the buffer length exactly; a mismatch is reported as
    /// [`CacheError::SizeMismatch`], which callers treat as corruption.
    pub fn lookup_exact(
        &self,
        key: &Key,
        val: &mut [u8],
        lock: &CacheLock,
    ) -> Result<(), CacheError> {
        let want = val.len();
        let copied = self.lookup(key, Some(val), lock)?;
        if copied == want {
            Ok(())
        } else {
            Err(CacheError::SizeMismatch)
        }
    }

    /// Returns the next item at or after `key`, bounded by `last` and by
    /// the lock range, skipping tombstones. The value is copied into `val`
    /// as in [`ItemCache::lookup`].
    ///
    /// [`CacheError::NotFound`] means no item inside the bounds — callers
    /// iterating past the lock must reacquire a following lock to go on.
    pub fn next(
        &self,
        key: &Key,
        last: &Key,
        val: Option<&mut [u8]>,
        lock: &CacheLock,
    ) -> Result<(Key, usize), CacheError> {
        // Clamp to the lock range to cut compares down the line.
        let last = if lock.end < *last { lock.end } else { *last };

        if *key > last {
            return Err(CacheError::NotFound);
        }
        if !lock.covers(key, LockMode::Read) {
            return Err(CacheError::InvalidArgument("lock does not cover key"));
        }
        trace!(key = %key, last = %last, "next");

        let mut val = val;
        let mut pos = *key;
        loop {
            let step = {
                let mut inner = self.lock_inner()?;
                match inner.ranges.find(&pos) {
                    None => Step::Fill,
                    Some((_, range_end)) => {
                        let bound = if range_end < last { range_end } else { last };

                        let mut cand = inner.items.next(&pos);
                        while let Some(id) = cand {
                            if *inner.items.key(id) > bound {
                                cand = None;
                                break;
                            }
                            if !inner.items.data(id).deletion {
                                break;
                            }
                            cand = inner.items.next_node(id);
                        }

                        match cand {
                            Some(id) => {
                                let found = *inner.items.key(id);
                                inner.items.lru_move_back(id);
                                let copied = match inner.items.data(id).val.as_deref() {
                                    Some(src) => Self::copy_val(val.as_deref_mut(), src),
                                    None => 0,
                                };
                                Step::Done(Ok((found, copied)))
                            }
                            None if range_end < last => {
                                // Empty covered stretch; resume past it.
                                pos = range_end.next();
                                continue;
                            }
                            None => Step::Done(Err(CacheError::NotFound)),
                        }
                    }
                }
            };
            match step {
                Step::Done(result) => return result,
                Step::Fill => {
                    trace!(pos = %pos, "next: filling uncovered position");
                    self.reader.read_items(self, &pos, &lock.start, &lock.end)?;
                }
            }
        }
    }

    /// Mirror of [`ItemCache::next`]: the previous item at or before `key`,
    /// bounded below by `first` and the lock range.
    pub fn prev(
        &self,
        key: &Key,
        first: &Key,
        val: Option<&mut [u8]>,
        lock: &CacheLock,
    ) -> Result<(Key, usize), CacheError> {
        let first = if lock.start > *first {
            lock.start
        } else {
            *first
        };

        if *key < first {
            return Err(CacheError::NotFound);
        }
        if !lock.covers(key, LockMode::Read) {
            return Err(CacheError::InvalidArgument("lock does not cover key"));
        }
        trace!(key = %key, first = %first, "prev");

        let mut val = val;
        let mut pos = *key;
        loop {
            let step = {
                let mut inner = self.lock_inner()?;
                match inner.ranges.find(&pos) {
                    None => Step::Fill,
                    Some((range_start, _)) => {
                        let bound = if range_start > first {
                            range_start
                        } else {
                            first
                        };

                        let mut cand = inner.items.prev(&pos);
                        while let Some(id) = cand {
                            if *inner.items.key(id) < bound {
                                cand = None;
                                break;
                            }
                            if !inner.items.data(id).deletion {
                                break;
                            }
                            cand = inner.items.prev_node(id);
                        }

                        match cand {
                            Some(id) => {
                                let found = *inner.items.key(id);
                                inner.items.lru_move_back(id);
                                let copied = match inner.items.data(id).val.as_deref() {
                                    Some(src) => Self::copy_val(val.as_deref_mut(), src),
                                    None => 0,
                                };
                                Step::Done(Ok((found, copied)))
                            }
                            None if range_start > first => {
                                pos = range_start.prev();
                                continue;
                            }
                            None => Step::Done(Err(CacheError::NotFound)),
                        }
                    }
                }
            };
            match step {
                Step::Done(result) => return result,
                Step::Fill => {
                    trace!(pos = %pos, "prev: filling uncovered position");
                    self.reader.read_items(self, &pos, &lock.start, &lock.end)?;
                }
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Creates a new dirty item. The surrounding range is read in first so
    /// an existing item is seen; [`CacheError::Exists`] if one is.
    pub fn create(
        &self,
        key: &Key,
        val: Option<&[u8]>,
        lock: &CacheLock,
    ) -> Result<(), CacheError> {
        self.check_val(val)?;
        if !lock.covers(key, LockMode::Write) {
            return Err(CacheError::InvalidArgument("lock does not cover key"));
        }
        trace!(key = %key, "create");

        let mut pending = Some(ItemRecord::new(*key, val.map(<[u8]>::to_vec)));
        self.read_through(key, lock, |cache, inner| {
            if inner.ranges.find(key).is_none() {
                return Step::Fill;
            }
            let record = pending.take().expect("create retried after completion");
            match cache.insert_item(inner, record, InsertMode::Create) {
                Ok(id) => {
                    cache.mark_item_dirty(inner, id);
                    Step::Done(Ok(()))
                }
                Err(rejected) => {
                    pending = Some(rejected);
                    Step::Done(Err(CacheError::Exists))
                }
            }
        })
    }

    /// Creates an item without reading first. The caller asserts that
    /// overwriting any existing item is correct; the new item is forced
    /// persistent so a later delete still writes a tombstone for whatever
    /// the segments may hold.
    pub fn create_force(
        &self,
        key: &Key,
        val: Option<&[u8]>,
        lock: &CacheLock,
    ) -> Result<(), CacheError> {
        self.check_val(val)?;
        if !lock.covers(key, LockMode::WriteOnly) {
            return Err(CacheError::InvalidArgument("lock does not cover key"));
        }
        trace!(key = %key, "create_force");

        let mut record = ItemRecord::new(*key, val.map(<[u8]>::to_vec));
        record.data.persistent = true;

        let mut inner = self.lock_inner()?;
        match self.insert_item(&mut inner, record, InsertMode::LogicalOverwrite) {
            Ok(id) => self.mark_item_dirty(&mut inner, id),
            Err(_) => {
                error!(key = %key, "item cache corrupted during forced create");
                panic!("item cache corrupted during forced create");
            }
        }
        Ok(())
    }

    /// Replaces the value of an existing item and marks it dirty.
    pub fn update(
        &self,
        key: &Key,
        val: Option<&[u8]>,
        lock: &CacheLock,
    ) -> Result<(), CacheError> {
        self.check_val(val)?;
        if !lock.covers(key, LockMode::Write) {
            return Err(CacheError::InvalidArgument("lock does not cover key"));
        }
        trace!(key = %key, "update");

        self.read_through(key, lock, |cache, inner| {
            if let Some(id) = Self::find_live(inner, key) {
                // Clearing first settles counters for the old length.
                cache.clear_item_dirty(inner, id);
                inner.items.data_mut(id).val = val.map(<[u8]>::to_vec);
                cache.mark_item_dirty(inner, id);
                Step::Done(Ok(()))
            } else if inner.ranges.find(key).is_some() {
                Step::Done(Err(CacheError::NotFound))
            } else {
                Step::Fill
            }
        })
    }

    /// Ensures the item exists and is dirty, reading it in if needed.
    pub fn dirty(&self, key: &Key, lock: &CacheLock) -> Result<(), CacheError> {
        if !lock.covers(key, LockMode::Write) {
            return Err(CacheError::InvalidArgument("lock does not cover key"));
        }
        trace!(key = %key, "dirty");

        self.read_through(key, lock, |cache, inner| {
            if let Some(id) = Self::find_live(inner, key) {
                cache.mark_item_dirty(inner, id);
                Step::Done(Ok(()))
            } else if inner.ranges.find(key).is_some() {
                Step::Done(Err(CacheError::NotFound))
            } else {
                Step::Fill
            }
        })
    }

    /// In-place update of an already-dirty item whose buffer is at least
    /// as large as the new value. The value allocation is kept; a smaller
    /// value sits in it until the item is freed.
    ///
    /// # Panics
    ///
    /// The caller guarantees the item exists, is dirty, and is not growing;
    /// any violation is a fatal integrity failure.
    pub fn update_dirty(&self, key: &Key, val: Option<&[u8]>) -> Result<(), CacheError> {
        let mut inner = self.lock_inner()?;
        let inner = &mut *inner;

        let id = Self::find_live(inner, key)
            .expect("update_dirty of a missing item");
        assert!(
            inner.items.is_self_dirty(id),
            "update_dirty of a clean item"
        );

        let old_len = inner.items.data(id).val_len();
        let new_len = val.map_or(0, <[u8]>::len);
        assert!(new_len <= old_len, "update_dirty grows the value");

        if let Some(src) = val {
            let buf = inner
                .items
                .data_mut(id)
                .val
                .as_mut()
                .expect("sized value without a buffer");
            buf[..new_len].copy_from_slice(src);
            buf.truncate(new_len);
        } else if let Some(buf) = inner.items.data_mut(id).val.as_mut() {
            buf.truncate(0);
        }

        self.track_dirty(inner, 0, new_len as i64 - old_len as i64);
        Ok(())
    }

    /// Deletes the item at `key`, reading it in first. Persistent items
    /// leave a dirty tombstone behind; others vanish outright.
    pub fn delete(&self, key: &Key, lock: &CacheLock) -> Result<(), CacheError> {
        if !lock.covers(key, LockMode::Write) {
            return Err(CacheError::InvalidArgument("lock does not cover key"));
        }
        trace!(key = %key, "delete");

        self.read_through(key, lock, |cache, inner| {
            if let Some(id) = Self::find_live(inner, key) {
                cache.delete_item(inner, id);
                Step::Done(Ok(()))
            } else if inner.ranges.find(key).is_some() {
                Step::Done(Err(CacheError::NotFound))
            } else {
                Step::Fill
            }
        })
    }

    /// Installs a tombstone without reading first. The caller knows an
    /// item exists in the segments and skips the read; the tombstone is
    /// forced persistent so it is guaranteed to be written.
    pub fn delete_force(&self, key: &Key, lock: &CacheLock) -> Result<(), CacheError> {
        if !lock.covers(key, LockMode::WriteOnly) {
            return Err(CacheError::InvalidArgument("lock does not cover key"));
        }
        trace!(key = %key, "delete_force");

        let mut record = ItemRecord::new(*key, None);
        record.data.persistent = true;

        let mut inner = self.lock_inner()?;
        match self.insert_item(&mut inner, record, InsertMode::LogicalOverwrite) {
            Ok(id) => {
                self.mark_item_dirty(&mut inner, id);
                self.delete_item(&mut inner, id);
            }
            Err(_) => {
                error!(key = %key, "item cache corrupted during forced delete");
                panic!("item cache corrupted during forced delete");
            }
        }
        Ok(())
    }

    /// Deletes an item the caller has already created or dirtied in this
    /// transaction. Never fills; quietly succeeds if the item is gone.
    pub fn delete_dirty(&self, key: &Key) -> Result<(), CacheError> {
        let mut inner = self.lock_inner()?;
        let inner = &mut *inner;
        if let Some(id) = Self::find_live(inner, key) {
            self.delete_item(inner, id);
        }
        Ok(())
    }

    /// Deletes an item but saves it, dirty state included, so that
    /// [`ItemCache::restore`] can reinstall it. A correctly-persistent
    /// tombstone takes its place in the cache.
    pub fn delete_save(
        &self,
        key: &Key,
        saved: &mut SavedItems,
        lock: &CacheLock,
    ) -> Result<(), CacheError> {
        if !lock.covers(key, LockMode::Write) {
            return Err(CacheError::InvalidArgument("lock does not cover key"));
        }
        trace!(key = %key, "delete_save");

        self.read_through(key, lock, |cache, inner| {
            if let Some(id) = Self::find_live(inner, key) {
                let was_dirty = inner.items.is_self_dirty(id);
                let record = cache.erase_item(inner, id);
                let persistent = record.data.persistent;
                saved.items.push(SavedItem { record, was_dirty });

                let mut del = ItemRecord::new(*key, None);
                del.data.persistent = persistent;
                match cache.insert_item(inner, del, InsertMode::Create) {
                    Ok(del_id) => cache.delete_item(inner, del_id),
                    Err(_) => {
                        error!(key = %key, "item cache corrupted during delete_save");
                        panic!("item cache corrupted during delete_save");
                    }
                }
                Step::Done(Ok(()))
            } else if inner.ranges.find(key).is_some() {
                Step::Done(Err(CacheError::NotFound))
            } else {
                Step::Fill
            }
        })
    }

    /// Reinstalls previously saved items, overwriting whatever the cache
    /// holds at their keys, and re-marks the ones saved dirty.
    ///
    /// The caller must have kept locks covering the keys across the
    /// save/restore window so the cached ranges still exist.
    pub fn restore(&self, saved: SavedItems, lock: &CacheLock) -> Result<(), CacheError> {
        if saved.is_empty() {
            return Ok(());
        }

        let mut inner = self.lock_inner()?;
        let inner = &mut *inner;

        for item in &saved.items {
            let mode = if item.was_dirty {
                LockMode::Write
            } else {
                LockMode::Read
            };
            if !lock.covers(&item.record.key, mode)
                || inner.ranges.find(&item.record.key).is_none()
            {
                return Err(CacheError::InvalidArgument(
                    "restore outside lock or cached range",
                ));
            }
        }

        for item in saved.items {
            let SavedItem { record, was_dirty } = item;
            let key = record.key;
            if let Some(existing) = Self::find_live(inner, &key) {
                self.erase_item(inner, existing);
            }
            match self.insert_item(inner, record, InsertMode::Create) {
                Ok(id) => {
                    if was_dirty {
                        self.mark_item_dirty(inner, id);
                    }
                }
                Err(_) => {
                    error!(key = %key, "item cache corrupted during restore");
                    panic!("item cache corrupted during restore");
                }
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Batch population
    // --------------------------------------------------------------------------------------------

    /// Stages one read item for a later [`ItemCache::insert_batch`]. The
    /// reader adds in sort order.
    pub fn add_batch(
        &self,
        batch: &mut Batch,
        key: &Key,
        val: Option<&[u8]>,
    ) -> Result<(), CacheError> {
        self.check_val(val)?;
        batch
            .items
            .push(ItemRecord::new(*key, val.map(<[u8]>::to_vec)));
        Ok(())
    }

    /// Atomically installs a batch of clean read items and the range
    /// `[start, end]` the reader covered.
    ///
    /// The range goes in first; items that collide with records already in
    /// the cache are dropped — the caller was not locked against writers
    /// while reading, so the cached record may be newer. The ordering is
    /// safe because concurrent readers still require range coverage before
    /// trusting an absence.
    pub fn insert_batch(
        &self,
        batch: Batch,
        start: &Key,
        end: &Key,
    ) -> Result<(), CacheError> {
        if start > end {
            return Err(CacheError::InvalidArgument("inverted batch range"));
        }
        trace!(start = %start, end = %end, count = batch.len(), "insert_batch");

        let mut inner = self.lock_inner()?;
        let inner = &mut *inner;

        inner.ranges.insert(*start, *end);

        for mut record in batch.items {
            record.data.persistent = true;
            if let Err(dup) = self.insert_item(inner, record, InsertMode::CachePopulate) {
                trace!(key = %dup.key, "batch duplicate dropped");
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Dirty enumeration and flush
    // --------------------------------------------------------------------------------------------

    /// True when any item is dirty.
    pub fn has_dirty(&self) -> Result<bool, CacheError> {
        Ok(self.lock_inner()?.nr_dirty_items != 0)
    }

    /// True when the current dirty items plus the given extras still fit
    /// in a single segment write.
    pub fn dirty_fits_single(
        &self,
        extra_items: u64,
        extra_bytes: u64,
        writer: &dyn SegmentWriter,
    ) -> Result<bool, CacheError> {
        let inner = self.lock_inner()?;
        Ok(writer.fits_single(
            extra_items + inner.nr_dirty_items as u64,
            extra_bytes + inner.dirty_val_bytes as u64,
        ))
    }

    /// Appends all dirty items, in key order, to the segment writer.
    /// Flushed items become clean and persistent; flushed tombstones are
    /// erased from the cache. Returns the number of items written.
    ///
    /// The transaction reservation guarantees everything fits; an append
    /// refusal mid-flush is a fatal integrity failure.
    pub fn flush_to_segment(
        &self,
        writer: &mut dyn SegmentWriter,
    ) -> Result<u64, CacheError> {
        let mut inner = self.lock_inner()?;
        let inner = &mut *inner;

        let mut written = 0u64;
        let mut cur = inner.items.first_dirty();
        while let Some(id) = cur {
            let deletion = inner.items.data(id).deletion;
            let appended = {
                let data = inner.items.data(id);
                writer.append_item(
                    inner.items.key(id),
                    data.val.as_deref().unwrap_or(&[]),
                    deletion,
                )
            };
            assert!(appended, "segment reservation ran out mid-flush");

            debug_assert!(
                !deletion || inner.items.data(id).persistent,
                "non-persistent tombstone reached flush"
            );

            self.clear_item_dirty(inner, id);
            inner.items.data_mut(id).persistent = true;

            let next = inner.items.next_dirty(id);
            if deletion {
                self.erase_item(inner, id);
            }
            cur = next;
            written += 1;
        }

        trace!(written, "flush_to_segment");
        Ok(written)
    }

    /// True when a dirty item exists in `[start, end]`.
    fn dirty_item_within(inner: &CacheInner, start: &Key, end: &Key) -> bool {
        let Some(mut id) = inner.items.next(start) else {
            return false;
        };
        if !inner.items.is_self_dirty(id) {
            match inner.items.next_dirty(id) {
                Some(next) => id = next,
                None => return false,
            }
        }
        inner.items.key(id) <= end
    }

    /// Writes out dirty items in `[start, end]` by syncing the whole
    /// transaction if any fall inside. Returns the dirty count that drove
    /// the decision, 0 when nothing needed writing.
    pub fn writeback(&self, start: &Key, end: &Key) -> Result<u64, CacheError> {
        let count = {
            let inner = self.lock_inner()?;
            if inner.nr_dirty_items != 0 && Self::dirty_item_within(&inner, start, end) {
                inner.nr_dirty_items as u64
            } else {
                0
            }
        };

        if count > 0 {
            trace!(start = %start, end = %end, count, "writeback syncing");
            self.tracker.sync(true)?;
        }
        Ok(count)
    }

    // --------------------------------------------------------------------------------------------
    // Invalidation and coverage queries
    // --------------------------------------------------------------------------------------------

    /// Drops every cached item in `[start, end]` and removes the interval
    /// from range coverage, splitting overlapping ranges as needed. The
    /// caller has ensured no dirty items remain in the range. Returns the
    /// number of items erased.
    pub fn invalidate(&self, start: &Key, end: &Key) -> Result<u64, CacheError> {
        if start > end {
            return Err(CacheError::InvalidArgument("inverted range"));
        }
        trace!(start = %start, end = %end, "invalidate");

        let mut inner = self.lock_inner()?;
        let inner = &mut *inner;

        let mut count = 0u64;
        let mut cur = inner.items.next(start);
        while let Some(id) = cur {
            if inner.items.key(id) > end {
                break;
            }
            let next = inner.items.next_node(id);
            if inner.items.is_self_dirty(id) {
                warn!(key = %inner.items.key(id), "invalidating a dirty item");
            }
            self.erase_item(inner, id);
            count += 1;
            cur = next;
        }

        inner.ranges.remove(start, end);
        Ok(count)
    }

    /// True when the cache covers any part of `[start, end]`; with
    /// `dirty`, true only when a dirty item lies inside.
    pub fn range_cached(
        &self,
        start: &Key,
        end: &Key,
        dirty: bool,
    ) -> Result<bool, CacheError> {
        let inner = self.lock_inner()?;

        if dirty {
            return Ok(Self::dirty_item_within(&inner, start, end));
        }

        if inner.ranges.find(start).is_some() {
            return Ok(true);
        }
        Ok(inner
            .ranges
            .next_range(start)
            .is_some_and(|(next_start, _)| next_start <= *end))
    }

    /// Copies the bounds of cached ranges in start order, beginning with
    /// the range containing `key` (or the first after it). At most `nr`
    /// pairs are returned.
    pub fn copy_range_keys(&self, key: &Key, nr: usize) -> Result<Vec<(Key, Key)>, CacheError> {
        let inner = self.lock_inner()?;

        let from = inner
            .ranges
            .find(key)
            .map(|(start, _)| start)
            .unwrap_or(*key);

        Ok(inner.ranges.iter_from(&from).take(nr).collect())
    }

    /// Copies the keys of cached non-tombstone items in order, starting at
    /// the first item at or after `key`. At most `nr` keys are returned.
    pub fn copy_keys(&self, key: &Key, nr: usize) -> Result<Vec<Key>, CacheError> {
        let inner = self.lock_inner()?;

        let mut keys = Vec::new();
        let mut cur = inner.items.next(key);
        while let Some(id) = cur {
            if keys.len() == nr {
                break;
            }
            if !inner.items.data(id).deletion {
                keys.push(*inner.items.key(id));
            }
            cur = inner.items.next_node(id);
        }
        Ok(keys)
    }

    // --------------------------------------------------------------------------------------------
    // Introspection for tests and the shrinker
    // --------------------------------------------------------------------------------------------

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }
}

// ------------------------------------------------------------------------------------------------
// Test support
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
impl ItemCache {
    /// Verifies the cross-structure invariants: tree structure, range
    /// disjointness, and counters matching a recount of dirty items.
    pub(crate) fn check_invariants(&self) {
        let inner = self.lock_inner().unwrap();
        inner.items.check_invariants();
        inner.ranges.check_invariants();

        let mut nr = 0i64;
        let mut bytes = 0i64;
        let mut cur = inner.items.first_dirty();
        while let Some(id) = cur {
            assert!(inner.items.is_self_dirty(id));
            nr += 1;
            bytes += inner.items.data(id).val_len() as i64;
            cur = inner.items.next_dirty(id);
        }
        assert_eq!(nr, inner.nr_dirty_items, "dirty item count out of sync");
        assert_eq!(bytes, inner.dirty_val_bytes, "dirty byte count out of sync");

        // Tombstones are always persistent and empty.
        let mut cur = inner.items.next(&Key::zeros());
        while let Some(id) = cur {
            let data = inner.items.data(id);
            if data.deletion {
                assert!(data.persistent, "non-persistent tombstone cached");
                assert_eq!(data.val_len(), 0, "tombstone with a value");
            }
            cur = inner.items.next_node(id);
        }
    }

    pub(crate) fn nr_dirty(&self) -> i64 {
        self.lock_inner().unwrap().nr_dirty_items
    }

    pub(crate) fn dirty_bytes(&self) -> i64 {
        self.lock_inner().unwrap().dirty_val_bytes
    }

    pub(crate) fn item_count(&self) -> usize {
        self.lock_inner().unwrap().items.len()
    }

    pub(crate) fn range_count(&self) -> usize {
        self.lock_inner().unwrap().ranges.len()
    }

    pub(crate) fn lru_count(&self) -> usize {
        self.lock_inner().unwrap().items.lru_len()
    }
}
