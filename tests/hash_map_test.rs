//! Concurrent hash map tests: capacity policy, tombstone accounting,
//! mark/sweep, reclaim, and multi-threaded insert/lookup.

use palisade::ConcurrentHashMap;

#[test]
fn capacity_is_a_power_of_two_minus_one() {
    assert_eq!(ConcurrentHashMap::new(12).capacity(), 31);
    assert_eq!(ConcurrentHashMap::new(1).capacity(), 1);
    assert_eq!(ConcurrentHashMap::new(100).capacity(), 255);
}

#[test]
fn insert_get_and_overwrite() {
    let map = ConcurrentHashMap::new(16);
    assert!(map.is_empty());

    assert!(map.insert(42, 7));
    assert!(map.insert(1000, 8));
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(42), Some(7));
    assert_eq!(map.get(1000), Some(8));
    assert_eq!(map.get(5), None);

    // Overwriting an existing key does not consume capacity.
    assert!(map.insert(42, 99));
    assert_eq!(map.get(42), Some(99));
    assert_eq!(map.len(), 2);
}

#[test]
fn colliding_keys_probe_linearly() {
    let map = ConcurrentHashMap::new(8);
    let stride = (map.capacity() + 1) as u64;
    // All of these land on the same home slot.
    for i in 0..5u64 {
        assert!(map.insert(3 + i * stride, i as u32));
    }
    for i in 0..5u64 {
        assert_eq!(map.get(3 + i * stride), Some(i as u32));
    }
}

#[test]
fn remove_leaves_a_capacity_consuming_tombstone() {
    let map = ConcurrentHashMap::new(4);
    let cap = map.capacity();
    for k in 0..cap as u64 {
        assert!(map.insert(k, 0));
    }
    assert!(!map.insert(1000, 0));

    assert!(map.remove(0));
    assert!(!map.remove(0), "double remove finds nothing");
    assert!(!map.contains(0));
    assert_eq!(map.len(), cap - 1);

    // The tombstone still occupies the slot budget.
    assert!(!map.insert(1000, 0));
}

#[test]
fn reclaim_compacts_tombstones() {
    let mut map = ConcurrentHashMap::new(8);
    let cap = map.capacity();
    for k in 0..cap as u64 {
        assert!(map.insert(k, k as u32));
    }
    for k in 0..3u64 {
        assert!(map.remove(k));
    }
    assert!(!map.insert(500, 1), "tombstones still charged");

    assert_eq!(map.reclaim(), 3);
    assert_eq!(map.len(), cap - 3);
    // Surviving entries kept their values.
    for k in 3..cap as u64 {
        assert_eq!(map.get(k), Some(k as u32));
    }
    // The recovered slots are usable again.
    for k in 0..3u64 {
        assert!(map.insert(500 + k, 1));
    }
}

#[test]
fn marked_entries_stay_visible_until_swept() {
    let map = ConcurrentHashMap::new(16);
    for k in 0..10u64 {
        assert!(map.insert(k, k as u32));
    }

    for k in 0..4u64 {
        assert!(map.mark(k, 7));
    }
    assert!(map.mark(9, 13));
    assert!(!map.mark(1000, 7), "absent keys cannot be marked");

    // Marking changes nothing observable yet.
    assert_eq!(map.len(), 10);
    for k in 0..4u64 {
        assert_eq!(map.get(k), Some(k as u32));
    }

    // Only the matching tag is swept.
    assert_eq!(map.sweep(7), 4);
    assert_eq!(map.len(), 6);
    for k in 0..4u64 {
        assert!(!map.contains(k));
    }
    assert!(map.contains(9));

    assert_eq!(map.sweep(7), 0);
    assert_eq!(map.sweep(13), 1);
    assert!(!map.contains(9));
}

#[test]
fn marked_entries_survive_reclaim() {
    let mut map = ConcurrentHashMap::new(8);
    assert!(map.insert(1, 10));
    assert!(map.insert(2, 20));
    assert!(map.mark(1, 3));
    assert!(map.remove(2));

    assert_eq!(map.reclaim(), 1);
    // The mark and its tag survive compaction.
    assert_eq!(map.get(1), Some(10));
    assert_eq!(map.sweep(3), 1);
    assert!(map.is_empty());
}

#[test]
fn clear_resets_everything() {
    let mut map = ConcurrentHashMap::new(8);
    let cap = map.capacity();
    for k in 0..cap as u64 {
        assert!(map.insert(k, 0));
    }
    map.remove(0);
    map.clear();
    assert!(map.is_empty());
    for k in 0..cap as u64 {
        assert!(map.insert(k, 0));
    }
}

#[test]
fn concurrent_inserts_from_disjoint_keys() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 256;

    let map = ConcurrentHashMap::new((THREADS * PER_THREAD) as usize);
    std::thread::scope(|s| {
        for t in 0..THREADS {
            let map = &map;
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    let key = t << 32 | i;
                    assert!(map.insert(key, (t * PER_THREAD + i) as u32));
                }
            });
        }
    });

    assert_eq!(map.len(), (THREADS * PER_THREAD) as usize);
    for t in 0..THREADS {
        for i in 0..PER_THREAD {
            assert_eq!(map.get(t << 32 | i), Some((t * PER_THREAD + i) as u32));
        }
    }
}

#[test]
fn concurrent_insert_remove_round_trips() {
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 128;

    let map = ConcurrentHashMap::new((THREADS * PER_THREAD) as usize);
    std::thread::scope(|s| {
        for t in 0..THREADS {
            let map = &map;
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    let key = t << 32 | i;
                    assert!(map.insert(key, 1));
                    assert!(map.remove(key));
                }
            });
        }
    });
    assert!(map.is_empty());
}
