#![cfg(loom)]
//! Loom model of the fixed pool's CAS pop/push paths.
//!
//! Run with `RUSTFLAGS="--cfg loom" cargo test --test pool_loom --release`.

use core::ptr::NonNull;
use std::sync::Arc;

use loom::sync::atomic::{AtomicBool, Ordering};

use palisade::{Arena, FixedPool, NULL_INDEX};

struct Harness {
    // Keeps the backing bytes alive while the pool points into them.
    _backing: Box<[u64]>,
    pool: FixedPool,
}

fn harness(slots: usize) -> Arc<Harness> {
    let mut backing = vec![0u64; slots].into_boxed_slice();
    let arena = unsafe {
        Arena::from_raw_parts(
            NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap(),
            backing.len() * 8,
        )
    };
    let pool = FixedPool::new(arena, 8).unwrap();
    Arc::new(Harness { _backing: backing, pool })
}

#[test]
fn pop_push_grants_exclusive_slot_ownership() {
    loom::model(|| {
        let h = harness(2);
        let claimed = Arc::new([AtomicBool::new(false), AtomicBool::new(false)]);

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let h = Arc::clone(&h);
                let claimed = Arc::clone(&claimed);
                loom::thread::spawn(move || {
                    let idx = h.pool.allocate_index();
                    if idx != NULL_INDEX {
                        assert!(!claimed[idx as usize].swap(true, Ordering::AcqRel));
                        claimed[idx as usize].store(false, Ordering::Release);
                        unsafe { h.pool.deallocate_index(idx) };
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!(h.pool.is_full());
    });
}

#[test]
fn exhaustion_returns_the_sentinel_not_a_duplicate() {
    loom::model(|| {
        let h = harness(1);

        let contender = {
            let h = Arc::clone(&h);
            loom::thread::spawn(move || {
                let idx = h.pool.allocate_index();
                if idx != NULL_INDEX {
                    unsafe { h.pool.deallocate_index(idx) };
                    1
                } else {
                    0
                }
            })
        };

        let local = h.pool.allocate_index();
        if local != NULL_INDEX {
            unsafe { h.pool.deallocate_index(local) };
        }
        contender.join().unwrap();

        assert!(h.pool.is_full());
    });
}
