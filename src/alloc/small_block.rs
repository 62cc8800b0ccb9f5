//! `SmallBlockAlloc` — a multi-class allocator over one arena.
//!
//! The arena is divided into equal chunks held by an [`ArenaChunks`] source.
//! Each declared size class owns a [`GrowablePool`] drawing chunks from that
//! shared source, so a request is routed to the smallest sufficient class and
//! served by that class's lock-free pool.
//!
//! Chunks migrate between classes only under pressure: when a class needs to
//! grow and the source has no chunk left, every class releases its fully
//! empty chunks back to the source and the allocation is retried. Freeing
//! enough blocks of one class therefore lets a different class claim the
//! vacated chunk on its next growth.
//!
//! Like the segregated and buddy allocators this type is single-writer by
//! contract; the lock-free surface lives in [`FixedPool`](crate::FixedPool)
//! and [`GrowablePool`].

use core::ptr::NonNull;
use std::sync::Arc;

use crate::alloc::growable::{ChunkSource, GrowablePool, CHUNK_ALIGN};
use crate::alloc::pool::{FixedPool, NULL_INDEX};
use crate::alloc::ArenaAlloc;
use crate::arena::Arena;
use crate::error::ConfigError;

/// A [`ChunkSource`] carving chunks out of a caller-owned arena.
///
/// Internally this is just a [`FixedPool`] whose blocks are whole chunks, so
/// acquiring and releasing chunks is lock-free like any other pool.
#[derive(Debug)]
pub struct ArenaChunks {
    chunks: FixedPool,
}

impl ArenaChunks {
    /// Formats `arena` as a pool of `chunk_size`-byte chunks.
    ///
    /// # Errors
    /// `chunk_size` must be a power of two no smaller than [`CHUNK_ALIGN`]
    /// and the arena base must be aligned to it; violations are
    /// configuration errors.
    pub fn new(arena: Arena, chunk_size: usize) -> Result<Self, ConfigError> {
        if !chunk_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo { what: "chunk_size", value: chunk_size });
        }
        if chunk_size < CHUNK_ALIGN {
            return Err(ConfigError::BlockTooSmall { size: chunk_size, min: CHUNK_ALIGN });
        }
        if arena.base().as_ptr() as usize % chunk_size != 0 {
            return Err(ConfigError::MisalignedArena(chunk_size));
        }
        Ok(Self { chunks: FixedPool::new(arena, chunk_size)? })
    }

    /// Total number of chunks in the arena.
    #[must_use]
    pub fn total_chunks(&self) -> usize {
        self.chunks.capacity()
    }

    /// Chunks not currently claimed by any pool.
    #[must_use]
    pub fn free_chunks(&self) -> usize {
        self.chunks.count_free()
    }
}

impl ChunkSource for ArenaChunks {
    fn chunk_size(&self) -> usize {
        self.chunks.block_size()
    }

    fn acquire(&self) -> Option<NonNull<u8>> {
        let idx = self.chunks.allocate_index();
        if idx == NULL_INDEX {
            return None;
        }
        Some(self.chunks.slot_ptr(idx))
    }

    unsafe fn release(&self, chunk: NonNull<u8>) {
        self.chunks.deallocate_index(self.chunks.index_of(chunk.as_ptr()));
    }
}

struct SizeClassPool {
    size: usize,
    pool: GrowablePool<Arc<ArenaChunks>>,
}

/// A segregated small-block allocator composing one growable pool per size
/// class over a shared arena.
pub struct SmallBlockAlloc {
    chunks: Arc<ArenaChunks>,
    classes: Vec<SizeClassPool>,
}

impl SmallBlockAlloc {
    /// Creates the allocator over `arena` with the given chunk size and size
    /// classes (deduplicated and sorted ascending).
    ///
    /// # Errors
    /// Loud configuration failures, distinct from allocation pressure:
    /// - `MisalignedArena` unless the arena base is aligned to `chunk_size`;
    /// - `BadArenaMultiple` unless the arena size is an exact non-zero
    ///   multiple of `chunk_size * (num_classes + 1)`;
    /// - `BadSizeClasses` if the class list is empty, or a class cannot fit
    ///   at least one block in a chunk.
    pub fn new(
        arena: Arena,
        chunk_size: usize,
        size_classes: &[usize],
    ) -> Result<Self, ConfigError> {
        if size_classes.is_empty() {
            return Err(ConfigError::BadSizeClasses);
        }

        let required = chunk_size
            .checked_mul(size_classes.len() + 1)
            .ok_or(ConfigError::BadSizeClasses)?;
        if arena.len() == 0 || arena.len() % required != 0 {
            return Err(ConfigError::BadArenaMultiple { size: arena.len(), required });
        }

        let chunks = Arc::new(ArenaChunks::new(arena, chunk_size)?);

        let mut sizes: Vec<usize> = size_classes.to_vec();
        sizes.sort_unstable();
        sizes.dedup();

        let mut classes = Vec::with_capacity(sizes.len());
        for size in sizes {
            let pool = GrowablePool::new(Arc::clone(&chunks), size)
                .map_err(|_| ConfigError::BadSizeClasses)?;
            classes.push(SizeClassPool { size, pool });
        }

        tracing::debug!(
            chunk_size,
            total_chunks = chunks.total_chunks(),
            num_classes = classes.len(),
            "small-block allocator initialized"
        );
        Ok(Self { chunks, classes })
    }

    /// Allocates from the smallest class that covers `size`.
    ///
    /// Returns `None` for sizes no class covers and when the arena has no
    /// chunk left even after reclaiming empty chunks from all classes.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let idx = self.classes.iter().position(|c| c.size >= size)?;

        if let Some(ptr) = self.classes[idx].pool.allocate() {
            return Some(ptr);
        }

        // The shared source is dry. Pull fully empty chunks back from every
        // class; this is the only path on which a chunk changes class.
        let mut reclaimed = 0;
        for class in &mut self.classes {
            reclaimed += class.pool.shrink(None);
        }
        if reclaimed == 0 {
            return None;
        }
        tracing::debug!(reclaimed, "empty chunks returned to the arena");
        self.classes[idx].pool.allocate()
    }

    /// Returns a block to its class. A null pointer is a no-op.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer previously returned by [`allocate`]
    /// on this instance and not deallocated since.
    ///
    /// [`allocate`]: Self::allocate
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let block = NonNull::new_unchecked(ptr);
        for class in &self.classes {
            if class.pool.owns(ptr) {
                class.pool.deallocate(block);
                return;
            }
        }
        debug_assert!(false, "deallocate of a pointer no class owns");
    }

    /// Number of declared size classes.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Chunks currently unclaimed by any class.
    #[must_use]
    pub fn free_chunks(&self) -> usize {
        self.chunks.free_chunks()
    }

    /// Chunk accounting check: every arena chunk is either free in the
    /// source or owned by exactly one class.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let owned: usize = self.classes.iter().map(|c| c.pool.num_chunks()).sum();
        let consistent = self.chunks.free_chunks() + owned == self.chunks.total_chunks();
        consistent && self.classes.iter().all(|c| c.pool.count_free() <= c.pool.capacity())
    }
}

impl ArenaAlloc for SmallBlockAlloc {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        SmallBlockAlloc::allocate(self, size)
    }

    unsafe fn deallocate(&mut self, ptr: *mut u8) {
        SmallBlockAlloc::deallocate(self, ptr);
    }

    fn is_valid(&self) -> bool {
        SmallBlockAlloc::is_valid(self)
    }
}

impl core::fmt::Debug for SmallBlockAlloc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmallBlockAlloc")
            .field("classes", &self.classes.len())
            .field("total_chunks", &self.chunks.total_chunks())
            .field("free_chunks", &self.chunks.free_chunks())
            .finish()
    }
}
