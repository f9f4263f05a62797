//! Forward and reverse iteration: lock clamping, tombstone skipping, and
//! hole-filling across uncovered gaps.

#[cfg(test)]
mod tests {
    use crate::cache::tests::helpers::*;
    use crate::cache::{CacheError, CacheLock};
    use crate::key::Key;

    #[test]
    fn next_walks_items_in_order() {
        let t = setup_with(&[(2, b"x"), (5, b"y")], None);
        let lock = full_lock();

        let (key, _) = t.cache.next(&k(0), &k(9), None, &lock).unwrap();
        assert_eq!(key, k(2));
        let (key, _) = t.cache.next(&k(3), &k(9), None, &lock).unwrap();
        assert_eq!(key, k(5));
        assert!(matches!(
            t.cache.next(&k(6), &k(9), None, &lock),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn next_copies_the_value() {
        let t = setup_with(&[(2, b"two")], None);
        let lock = full_lock();

        let mut buf = [0u8; 8];
        let (key, n) = t.cache.next(&k(0), &k(9), Some(&mut buf), &lock).unwrap();
        assert_eq!(key, k(2));
        assert_eq!(&buf[..n], b"two");
    }

    #[test]
    fn next_past_last_never_touches_the_cache() {
        let t = setup();
        let lock = full_lock();

        assert!(matches!(
            t.cache.next(&k(10), &k(5), None, &lock),
            Err(CacheError::NotFound)
        ));
        assert_eq!(t.reader.calls(), 0);
    }

    #[test]
    fn next_is_clamped_by_the_lock_end() {
        let t = setup_with(&[(8, b"v")], None);
        let lock = CacheLock::write(Key::zeros(), k(5));

        // k8 exists but sits beyond the lock; iteration must not see it.
        assert!(matches!(
            t.cache.next(&k(0), &k(9), None, &lock),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn next_skips_tombstones() {
        let t = setup_with(&[(2, b"a"), (3, b"b"), (4, b"c")], None);
        let lock = full_lock();

        t.cache.delete(&k(3), &lock).unwrap();

        let (key, _) = t.cache.next(&k(3), &k(9), None, &lock).unwrap();
        assert_eq!(key, k(4));
    }

    #[test]
    fn next_fills_holes_between_ranges() {
        // Bounded fills force iteration across several cached ranges.
        let t = setup_with(&[(10, b"a"), (40, b"b")], Some(5));
        let lock = full_lock();

        let (key, _) = t.cache.next(&k(8), &k(50), None, &lock).unwrap();
        assert_eq!(key, k(10));
        let first_fills = t.reader.calls();
        assert!(first_fills >= 1);

        // Continuing past the first range's end walks through uncovered
        // territory until k40's range is cached.
        let (key, _) = t.cache.next(&k(11), &k(50), None, &lock).unwrap();
        assert_eq!(key, k(40));
        assert!(t.reader.calls() > first_fills);
        t.cache.check_invariants();
    }

    #[test]
    fn prev_walks_items_in_reverse() {
        let t = setup_with(&[(2, b"x"), (5, b"y")], None);
        let lock = full_lock();

        let (key, _) = t.cache.prev(&k(9), &k(0), None, &lock).unwrap();
        assert_eq!(key, k(5));
        let (key, _) = t.cache.prev(&k(4), &k(0), None, &lock).unwrap();
        assert_eq!(key, k(2));
        assert!(matches!(
            t.cache.prev(&k(1), &k(0), None, &lock),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn prev_before_first_never_touches_the_cache() {
        let t = setup();
        let lock = full_lock();

        assert!(matches!(
            t.cache.prev(&k(5), &k(10), None, &lock),
            Err(CacheError::NotFound)
        ));
        assert_eq!(t.reader.calls(), 0);
    }

    #[test]
    fn prev_is_clamped_by_the_lock_start() {
        let t = setup_with(&[(2, b"v")], None);
        let lock = CacheLock::write(k(5), Key::ones());

        assert!(matches!(
            t.cache.prev(&k(9), &k(0), None, &lock),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn prev_skips_tombstones() {
        let t = setup_with(&[(2, b"a"), (3, b"b"), (4, b"c")], None);
        let lock = full_lock();

        t.cache.delete(&k(3), &lock).unwrap();

        let (key, _) = t.cache.prev(&k(3), &k(0), None, &lock).unwrap();
        assert_eq!(key, k(2));
    }

    #[test]
    fn iteration_scans_created_items() {
        let t = setup();
        let lock = full_lock();

        // Fill the empty store once so creates land in a cached range.
        assert!(matches!(
            t.cache.lookup(&k(0), None, &lock),
            Err(CacheError::NotFound)
        ));

        for n in [3u64, 1, 7] {
            t.cache.create(&k(n), Some(b"v"), &lock).unwrap();
        }

        let mut walked = Vec::new();
        let mut pos = k(0);
        loop {
            match t.cache.next(&pos, &k(100), None, &lock) {
                Ok((key, _)) => {
                    walked.push(key);
                    pos = key.next();
                }
                Err(CacheError::NotFound) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(walked, vec![k(1), k(3), k(7)]);
    }
}
