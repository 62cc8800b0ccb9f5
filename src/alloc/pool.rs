//! `FixedPool` — a lock-free fixed-size block pool.
//!
//! Manages an [`Arena`] as `capacity` equal-size slots. The free list is
//! threaded through the free slots themselves: a free slot's first four bytes
//! hold the index of the next free slot. The list head packs a 32-bit
//! generation tag beside the head index into a single `AtomicU64`, so the
//! pop/push compare-and-swap loops cannot be fooled by ABA reuse of an index.
//!
//! `allocate_index` and `deallocate_index` take `&self` and are safe to call
//! concurrently from many threads; exhaustion returns [`NULL_INDEX`] instead
//! of blocking. [`TypedPool`] layers construct/destruct semantics on top.
//!
//! [`Arena`]: crate::Arena

use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering;

#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, AtomicU64};
#[cfg(not(loom))]
use core::sync::atomic::{AtomicU32, AtomicU64};

use crossbeam_utils::CachePadded;

use crate::arena::Arena;
use crate::error::ConfigError;

/// Sentinel returned by [`FixedPool::allocate_index`] when the pool is empty.
pub const NULL_INDEX: u32 = u32::MAX;

const TAG_SHIFT: u32 = 32;

#[inline]
fn pack(tag: u32, index: u32) -> u64 {
    (u64::from(tag) << TAG_SHIFT) | u64::from(index)
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> TAG_SHIFT) as u32, word as u32)
}

/// A lock-free pool of fixed-size blocks over a caller-owned arena.
pub struct FixedPool {
    base: NonNull<u8>,
    block_size: usize,
    capacity: u32,
    /// Packed `[generation tag : 32 | head index : 32]`.
    head: CachePadded<AtomicU64>,
    free_count: CachePadded<AtomicU32>,
}

unsafe impl Send for FixedPool {}
unsafe impl Sync for FixedPool {}

impl FixedPool {
    /// Formats `arena` as `arena.len() / block_size` free slots.
    ///
    /// # Errors
    /// `ConfigError::BlockTooSmall` if `block_size` cannot hold the intrusive
    /// next index (4 bytes), `ConfigError::BlockTooLarge` if not even one
    /// block fits, `ConfigError::ArenaTooLarge` if there are more than
    /// `u32::MAX - 1` slots.
    pub fn new(arena: Arena, block_size: usize) -> Result<Self, ConfigError> {
        const MIN_BLOCK: usize = mem::size_of::<u32>();
        if block_size < MIN_BLOCK {
            return Err(ConfigError::BlockTooSmall { size: block_size, min: MIN_BLOCK });
        }
        let capacity = arena.len() / block_size;
        if capacity == 0 {
            return Err(ConfigError::BlockTooLarge { block: block_size, arena: arena.len() });
        }
        if capacity >= NULL_INDEX as usize {
            return Err(ConfigError::ArenaTooLarge(arena.len()));
        }
        let capacity = capacity as u32;

        // Unaligned stores: slots carry no alignment guarantee of their own.
        let base = arena.base();
        unsafe {
            for i in 0..capacity - 1 {
                ptr::write_unaligned(base.as_ptr().add(i as usize * block_size).cast::<u32>(), i + 1);
            }
            ptr::write_unaligned(
                base.as_ptr().add((capacity - 1) as usize * block_size).cast::<u32>(),
                NULL_INDEX,
            );
        }

        Ok(Self {
            base,
            block_size,
            capacity,
            head: CachePadded::new(AtomicU64::new(pack(0, 0))),
            free_count: CachePadded::new(AtomicU32::new(capacity)),
        })
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Size of each slot in bytes.
    #[inline]
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of slots currently free.
    #[inline]
    #[must_use]
    pub fn count_free(&self) -> usize {
        self.free_count.load(Ordering::Relaxed) as usize
    }

    /// `true` when every slot is free (no outstanding allocation).
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count_free() == self.capacity()
    }

    /// `true` when no slot is free.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count_free() == 0
    }

    /// Pops a free slot index, or [`NULL_INDEX`] if the pool is exhausted.
    ///
    /// Never blocks; safe to call from many threads.
    pub fn allocate_index(&self) -> u32 {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (tag, idx) = unpack(current);
            if idx == NULL_INDEX {
                return NULL_INDEX;
            }

            // The slot may be popped and repurposed by another thread after
            // this read; the tag makes the CAS below fail in that case and
            // the stale value is discarded.
            let next = unsafe { ptr::read_unaligned(self.slot_raw(idx).cast::<u32>()) };
            let new = pack(tag.wrapping_add(1), next);

            match self.head.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.free_count.fetch_sub(1, Ordering::Relaxed);
                    return idx;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Pushes `index` back onto the free list.
    ///
    /// # Safety
    /// `index` must have been returned by [`allocate_index`] on this pool and
    /// not deallocated since. The slot's contents are overwritten.
    ///
    /// [`allocate_index`]: Self::allocate_index
    pub unsafe fn deallocate_index(&self, index: u32) {
        debug_assert!(index < self.capacity);

        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (tag, head_idx) = unpack(current);
            ptr::write_unaligned(self.slot_raw(index).cast::<u32>(), head_idx);
            let new = pack(tag.wrapping_add(1), index);

            match self.head.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.free_count.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Pointer to the slot with the given index.
    ///
    /// # Panics
    /// Panics in debug builds if `index` is out of range.
    #[inline]
    #[must_use]
    pub fn slot_ptr(&self, index: u32) -> NonNull<u8> {
        debug_assert!(index < self.capacity);
        unsafe { NonNull::new_unchecked(self.slot_raw(index)) }
    }

    /// Index of the slot containing `ptr`.
    #[inline]
    pub(crate) fn index_of(&self, ptr: *const u8) -> u32 {
        let off = ptr as usize - self.base.as_ptr() as usize;
        (off / self.block_size) as u32
    }

    /// `true` if `ptr` lies inside the pool's slot region.
    #[inline]
    pub(crate) fn owns(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.capacity as usize * self.block_size
    }

    #[inline]
    fn slot_raw(&self, index: u32) -> *mut u8 {
        unsafe { self.base.as_ptr().add(index as usize * self.block_size) }
    }
}

impl core::fmt::Debug for FixedPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FixedPool")
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("free", &self.count_free())
            .finish()
    }
}

/// A typed wrapper over [`FixedPool`] with construct/destruct semantics.
///
/// `create` placement-constructs a `T` in a free slot, `destroy` drops it in
/// place and returns the slot. The pool never drops live objects itself:
/// destroying everything before the pool goes away is the caller's job, the
/// same way it is for the raw index API.
pub struct TypedPool<T> {
    pool: FixedPool,
    _marker: PhantomData<T>,
}

impl<T> TypedPool<T> {
    /// Formats `arena` as slots large enough for `T`.
    ///
    /// # Errors
    /// `ConfigError::MisalignedArena` if the arena base is not aligned for
    /// `T`; otherwise whatever [`FixedPool::new`] rejects.
    pub fn new(arena: Arena) -> Result<Self, ConfigError> {
        let align = mem::align_of::<T>().max(mem::size_of::<u32>());
        if arena.base().as_ptr() as usize % align != 0 {
            return Err(ConfigError::MisalignedArena(align));
        }
        // Slot stride: fits T and the intrusive index, multiple of T's align.
        let block = mem::size_of::<T>()
            .max(mem::size_of::<u32>())
            .div_ceil(align)
            * align;
        Ok(Self { pool: FixedPool::new(arena, block)?, _marker: PhantomData })
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Number of free slots.
    #[inline]
    #[must_use]
    pub fn count_free(&self) -> usize {
        self.pool.count_free()
    }

    /// `true` when no object is outstanding.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.pool.is_full()
    }

    /// Constructs `value` in a free slot, or returns `None` (dropping the
    /// value) when the pool is exhausted.
    pub fn create(&self, value: T) -> Option<NonNull<T>> {
        let idx = self.pool.allocate_index();
        if idx == NULL_INDEX {
            return None;
        }
        let slot = self.pool.slot_ptr(idx).cast::<T>();
        unsafe { ptr::write(slot.as_ptr(), value) };
        Some(slot)
    }

    /// Drops the object in place and frees its slot.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`create`] on this pool and not
    /// destroyed since.
    ///
    /// [`create`]: Self::create
    pub unsafe fn destroy(&self, ptr: NonNull<T>) {
        debug_assert!(self.pool.owns(ptr.as_ptr().cast()));
        ptr::drop_in_place(ptr.as_ptr());
        let idx = self.pool.index_of(ptr.as_ptr().cast());
        self.pool.deallocate_index(idx);
    }
}

impl<T> core::fmt::Debug for TypedPool<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TypedPool").field("pool", &self.pool).finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn arena_of(buf: &mut Vec<u8>) -> Arena {
        unsafe { Arena::from_raw_parts(NonNull::new(buf.as_mut_ptr()).unwrap(), buf.len()) }
    }

    #[test]
    fn pack_round_trips() {
        let word = pack(7, NULL_INDEX);
        assert_eq!(unpack(word), (7, NULL_INDEX));
    }

    #[test]
    fn rejects_undersized_blocks() {
        let mut buf = vec![0u8; 64];
        let err = FixedPool::new(arena_of(&mut buf), 2).unwrap_err();
        assert_eq!(err, ConfigError::BlockTooSmall { size: 2, min: 4 });
    }

    #[test]
    fn free_chain_visits_every_slot_once() {
        let mut buf = vec![0u8; 16 * 8];
        let pool = FixedPool::new(arena_of(&mut buf), 16).unwrap();
        let mut seen = [false; 8];
        for _ in 0..8 {
            let idx = pool.allocate_index();
            assert_ne!(idx, NULL_INDEX);
            assert!(!seen[idx as usize], "index {idx} handed out twice");
            seen[idx as usize] = true;
        }
        assert_eq!(pool.allocate_index(), NULL_INDEX);
    }
}
