use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;

use crate::cache::{
    Batch, CacheConfig, CacheError, CacheLock, ItemCache, SegmentReader, SegmentWriter,
    TransactionTracker,
};
use crate::key::Key;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn k(n: u64) -> Key {
    Key::from_u64(n)
}

/// A full-key-space write lock, the default for tests that aren't
/// exercising lock bounds.
pub fn full_lock() -> CacheLock {
    CacheLock::write(Key::zeros(), Key::ones())
}

// ------------------------------------------------------------------------------------------------
// Mock segment reader
// ------------------------------------------------------------------------------------------------

/// A segment store standing in for the real reader: a sorted map of
/// records plus a fill policy. Each `read_items` call batches the records
/// inside the chosen window into the cache and installs the window as a
/// cached range.
pub struct TestReader {
    store: Mutex<BTreeMap<Key, Vec<u8>>>,

    /// `None` fills the whole lock range in one call; `Some(w)` fills
    /// `[key - w, key + w]` clamped to the lock, modelling bounded segment
    /// reads.
    window: Option<u64>,

    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl TestReader {
    pub fn new(records: &[(u64, &[u8])], window: Option<u64>) -> Self {
        let store = records
            .iter()
            .map(|(n, v)| (k(*n), v.to_vec()))
            .collect::<BTreeMap<_, _>>();
        Self {
            store: Mutex::new(store),
            window,
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SegmentReader for TestReader {
    fn read_items(
        &self,
        cache: &ItemCache,
        key: &Key,
        lock_start: &Key,
        lock_end: &Key,
    ) -> Result<(), CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CacheError::Io(std::io::Error::other(
                "injected segment read failure",
            )));
        }

        let (start, end) = match self.window {
            None => (*lock_start, *lock_end),
            Some(w) => {
                let mut start = *key;
                for _ in 0..w {
                    if start == *lock_start {
                        break;
                    }
                    start.dec();
                }
                let mut end = *key;
                for _ in 0..w {
                    if end == *lock_end {
                        break;
                    }
                    end.inc();
                }
                (start, end)
            }
        };

        let mut batch = Batch::new();
        {
            let store = self.store.lock().unwrap();
            for (key, val) in store.range(start..=end) {
                cache.add_batch(&mut batch, key, Some(val))?;
            }
        }
        cache.insert_batch(batch, &start, &end)
    }
}

// ------------------------------------------------------------------------------------------------
// Mock segment writer
// ------------------------------------------------------------------------------------------------

/// Collects appended items and enforces an optional capacity, mirroring a
/// reserved segment under construction.
pub struct TestWriter {
    pub appended: Vec<(Key, Vec<u8>, bool)>,
    pub capacity: Option<usize>,
    pub max_items: u64,
    pub max_bytes: u64,
}

impl TestWriter {
    pub fn new() -> Self {
        Self {
            appended: Vec::new(),
            capacity: None,
            max_items: 1024,
            max_bytes: 1024 * 1024,
        }
    }
}

impl SegmentWriter for TestWriter {
    fn append_item(&mut self, key: &Key, val: &[u8], deletion: bool) -> bool {
        if let Some(cap) = self.capacity
            && self.appended.len() >= cap
        {
            return false;
        }
        self.appended.push((*key, val.to_vec(), deletion));
        true
    }

    fn fits_single(&self, nr_items: u64, val_bytes: u64) -> bool {
        nr_items <= self.max_items && val_bytes <= self.max_bytes
    }
}

// ------------------------------------------------------------------------------------------------
// Mock transaction tracker
// ------------------------------------------------------------------------------------------------

/// Mirrors the cache's dirty accounting and counts sync requests.
#[derive(Default)]
pub struct TestTracker {
    pub items: AtomicI64,
    pub bytes: AtomicI64,
    pub syncs: AtomicUsize,
}

impl TestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked(&self) -> (i64, i64) {
        (
            self.items.load(Ordering::SeqCst),
            self.bytes.load(Ordering::SeqCst),
        )
    }

    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }
}

impl TransactionTracker for TestTracker {
    fn track_items(&self, items_delta: i64, val_bytes_delta: i64) {
        self.items.fetch_add(items_delta, Ordering::SeqCst);
        self.bytes.fetch_add(val_bytes_delta, Ordering::SeqCst);
    }

    fn sync(&self, _wait: bool) -> Result<(), CacheError> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Harness
// ------------------------------------------------------------------------------------------------

pub struct TestCache {
    pub cache: Arc<ItemCache>,
    pub reader: Arc<TestReader>,
    pub tracker: Arc<TestTracker>,
}

/// Builds a cache over a mock segment store. `window` chooses the reader's
/// fill policy; see [`TestReader`].
pub fn setup_with(records: &[(u64, &[u8])], window: Option<u64>) -> TestCache {
    setup_with_config(records, window, CacheConfig::default())
}

/// [`setup_with`] plus a custom config, for tests steering the shrink
/// boundary walks.
pub fn setup_with_config(
    records: &[(u64, &[u8])],
    window: Option<u64>,
    config: CacheConfig,
) -> TestCache {
    init_tracing();

    let reader = Arc::new(TestReader::new(records, window));
    let tracker = Arc::new(TestTracker::new());
    let cache = Arc::new(ItemCache::new(
        config,
        Arc::clone(&reader) as Arc<dyn SegmentReader>,
        Arc::clone(&tracker) as Arc<dyn TransactionTracker>,
    ));

    TestCache {
        cache,
        reader,
        tracker,
    }
}

/// An empty segment store with whole-lock fills.
pub fn setup() -> TestCache {
    setup_with(&[], None)
}

/// Looks a key up into an oversized buffer and returns the value bytes.
pub fn lookup_vec(cache: &ItemCache, key: &Key, lock: &CacheLock) -> Result<Vec<u8>, CacheError> {
    let mut buf = vec![0u8; 128];
    let n = cache.lookup(key, Some(&mut buf), lock)?;
    buf.truncate(n);
    Ok(buf)
}
