//! `ConcurrentHashMap` — a lock-free fixed-capacity open-addressing map.
//!
//! Keys are caller-hashed 64-bit integers (the map performs no hashing of its
//! own) and values are 32-bit integers. The table length is a power of two
//! and never changes; usable capacity is one less, so a probe can always
//! terminate. Probing is linear.
//!
//! Each slot carries an atomic state word: `Empty`, `Busy` (an insert is
//! publishing), `Occupied`, `Marked(tag)` (tombstoned-for-later by
//! [`mark`](ConcurrentHashMap::mark), still alive), or `Tombstone`. Removal
//! tombstones a slot rather than emptying it; tombstones consume capacity
//! until [`reclaim`](ConcurrentHashMap::reclaim) or
//! [`clear`](ConcurrentHashMap::clear) compacts them, the same explicit
//! reclaim philosophy the pools use for chunks.
//!
//! `insert`/`get`/`contains`/`remove`/`mark`/`sweep` take `&self` and are
//! safe from many threads; `reclaim` and `clear` rebuild the table and
//! require exclusive access.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Slot states, stored in the low byte of the state word; the high 32 bits
/// hold the mark tag.
const EMPTY: u64 = 0;
const BUSY: u64 = 1;
const OCCUPIED: u64 = 2;
const MARKED: u64 = 3;
const TOMBSTONE: u64 = 4;

const STATE_MASK: u64 = 0xff;
const TAG_SHIFT: u64 = 32;

#[inline]
fn pack(state: u64, tag: u32) -> u64 {
    (u64::from(tag) << TAG_SHIFT) | state
}

#[inline]
fn state_of(word: u64) -> u64 {
    word & STATE_MASK
}

#[inline]
fn tag_of(word: u64) -> u32 {
    (word >> TAG_SHIFT) as u32
}

struct Slot {
    state: AtomicU64,
    key: AtomicU64,
    value: AtomicU32,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(EMPTY),
            key: AtomicU64::new(0),
            value: AtomicU32::new(0),
        }
    }
}

/// A fixed-capacity concurrent hash map from pre-hashed `u64` keys to `u32`
/// values.
pub struct ConcurrentHashMap {
    slots: Box<[Slot]>,
    mask: usize,
    /// Occupied + marked entries.
    len: CachePadded<AtomicUsize>,
    /// Occupied + marked + tombstoned slots; what capacity is charged for.
    used: CachePadded<AtomicUsize>,
}

impl ConcurrentHashMap {
    /// Creates a map able to hold at least `requested` entries.
    ///
    /// The actual [`capacity`](Self::capacity) is
    /// `next_power_of_two(requested) * 2 - 1` (e.g. `12` rounds to `31`).
    #[must_use]
    pub fn new(requested: usize) -> Self {
        let table_len = requested.max(1).next_power_of_two() * 2;
        let slots: Box<[Slot]> = (0..table_len).map(|_| Slot::new()).collect();
        tracing::debug!(requested, capacity = table_len - 1, "hash map initialized");
        Self {
            slots,
            mask: table_len - 1,
            len: CachePadded::new(AtomicUsize::new(0)),
            used: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Number of live entries (occupied plus marked; tombstones excluded).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// `true` when no live entry exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries; fixed at construction.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Inserts or overwrites `key`. Returns `false` when the map is full
    /// (tombstones count against capacity until reclaimed).
    pub fn insert(&self, key: u64, value: u32) -> bool {
        let start = key as usize & self.mask;
        let mut i = 0;
        while i < self.slots.len() {
            let slot = &self.slots[(start + i) & self.mask];
            let word = slot.state.load(Ordering::Acquire);
            match state_of(word) {
                EMPTY => {
                    match slot.state.compare_exchange(
                        word,
                        BUSY,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            let prev = self.used.fetch_add(1, Ordering::Relaxed);
                            if prev >= self.capacity() {
                                // Lost the capacity race; give the slot back.
                                self.used.fetch_sub(1, Ordering::Relaxed);
                                slot.state.store(EMPTY, Ordering::Release);
                                return false;
                            }
                            slot.key.store(key, Ordering::Relaxed);
                            slot.value.store(value, Ordering::Relaxed);
                            slot.state.store(OCCUPIED, Ordering::Release);
                            self.len.fetch_add(1, Ordering::Relaxed);
                            return true;
                        }
                        // Someone else claimed it; re-examine this slot.
                        Err(_) => continue,
                    }
                }
                BUSY => {
                    // An insert is publishing here; its key is unknown yet.
                    core::hint::spin_loop();
                    continue;
                }
                OCCUPIED | MARKED => {
                    if slot.key.load(Ordering::Relaxed) == key {
                        slot.value.store(value, Ordering::Relaxed);
                        return true;
                    }
                    i += 1;
                }
                // Tombstones are dead weight until reclaim; never reused.
                _ => i += 1,
            }
        }
        false
    }

    /// Looks a key up. Marked entries are still visible until swept.
    #[must_use]
    pub fn get(&self, key: u64) -> Option<u32> {
        let start = key as usize & self.mask;
        for i in 0..self.slots.len() {
            let slot = &self.slots[(start + i) & self.mask];
            match state_of(slot.state.load(Ordering::Acquire)) {
                EMPTY => return None,
                OCCUPIED | MARKED => {
                    if slot.key.load(Ordering::Relaxed) == key {
                        return Some(slot.value.load(Ordering::Relaxed));
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// `true` if `key` has a live entry.
    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    /// Tombstones `key`'s entry. Returns `false` for absent keys, a normal
    /// outcome rather than an error.
    pub fn remove(&self, key: u64) -> bool {
        self.transition(key, |_| TOMBSTONE, true)
    }

    /// Tags `key`'s entry for a later bulk [`sweep`](Self::sweep). The entry
    /// stays visible and [`len`](Self::len) does not shrink yet.
    pub fn mark(&self, key: u64, tag: u32) -> bool {
        self.transition(key, move |_| pack(MARKED, tag), false)
    }

    /// Tombstones every entry previously marked with `tag`; returns how many.
    pub fn sweep(&self, tag: u32) -> usize {
        let mut count = 0;
        for slot in self.slots.iter() {
            let mut word = slot.state.load(Ordering::Acquire);
            while state_of(word) == MARKED && tag_of(word) == tag {
                match slot.state.compare_exchange_weak(
                    word,
                    TOMBSTONE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.len.fetch_sub(1, Ordering::Relaxed);
                        count += 1;
                        break;
                    }
                    Err(actual) => word = actual,
                }
            }
        }
        tracing::debug!(tag, count, "sweep complete");
        count
    }

    /// Compacts every tombstone back to empty by re-slotting the live
    /// entries; returns how many tombstones were recovered.
    /// [`len`](Self::len) is unchanged.
    pub fn reclaim(&mut self) -> usize {
        let mut live: Vec<(u64, u32, u64)> = Vec::with_capacity(self.len());
        let mut tombstones = 0;

        for slot in self.slots.iter() {
            let word = slot.state.load(Ordering::Relaxed);
            match state_of(word) {
                OCCUPIED | MARKED => live.push((
                    slot.key.load(Ordering::Relaxed),
                    slot.value.load(Ordering::Relaxed),
                    word,
                )),
                TOMBSTONE => tombstones += 1,
                _ => {}
            }
            slot.state.store(EMPTY, Ordering::Relaxed);
        }

        for (key, value, word) in &live {
            let start = *key as usize & self.mask;
            for i in 0..self.slots.len() {
                let slot = &self.slots[(start + i) & self.mask];
                if state_of(slot.state.load(Ordering::Relaxed)) == EMPTY {
                    slot.key.store(*key, Ordering::Relaxed);
                    slot.value.store(*value, Ordering::Relaxed);
                    slot.state.store(*word, Ordering::Relaxed);
                    break;
                }
            }
        }

        self.used.store(live.len(), Ordering::Relaxed);
        tracing::debug!(tombstones, live = live.len(), "reclaim complete");
        tombstones
    }

    /// Empties the map entirely, tombstones included.
    pub fn clear(&mut self) {
        for slot in self.slots.iter() {
            slot.state.store(EMPTY, Ordering::Relaxed);
        }
        self.len.store(0, Ordering::Relaxed);
        self.used.store(0, Ordering::Relaxed);
    }

    /// Finds `key` among live entries and CASes its state word through
    /// `next`; `shrinks_len` distinguishes remove from mark.
    fn transition(&self, key: u64, next: impl Fn(u64) -> u64, shrinks_len: bool) -> bool {
        let start = key as usize & self.mask;
        for i in 0..self.slots.len() {
            let slot = &self.slots[(start + i) & self.mask];
            let mut word = slot.state.load(Ordering::Acquire);
            loop {
                match state_of(word) {
                    EMPTY => return false,
                    OCCUPIED | MARKED => {
                        if slot.key.load(Ordering::Relaxed) != key {
                            break;
                        }
                        match slot.state.compare_exchange_weak(
                            word,
                            next(word),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                if shrinks_len {
                                    self.len.fetch_sub(1, Ordering::Relaxed);
                                }
                                return true;
                            }
                            Err(actual) => word = actual,
                        }
                    }
                    _ => break,
                }
            }
        }
        false
    }
}

impl core::fmt::Debug for ConcurrentHashMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConcurrentHashMap")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_to_pow2_minus_one() {
        assert_eq!(ConcurrentHashMap::new(12).capacity(), 31);
        assert_eq!(ConcurrentHashMap::new(1).capacity(), 1);
        assert_eq!(ConcurrentHashMap::new(31).capacity(), 63);
    }

    #[test]
    fn state_word_packs_the_tag() {
        let word = pack(MARKED, 0xdead_beef);
        assert_eq!(state_of(word), MARKED);
        assert_eq!(tag_of(word), 0xdead_beef);
    }
}
