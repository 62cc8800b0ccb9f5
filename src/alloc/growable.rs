//! `GrowablePool` — a pool that grows and shrinks by whole chunks.
//!
//! A growable pool owns a singly linked list of fixed-size chunks obtained
//! from a [`ChunkSource`]. Each chunk starts with a header embedding a
//! [`FixedPool`] over the chunk's payload, so allocation inside a chunk is
//! the same lock-free index stack as everywhere else.
//!
//! When every chunk is exhausted, `allocate` lazily grows the pool by one
//! chunk. Two threads may both observe exhaustion and each append a chunk;
//! both chunks are kept. That is a deliberate relaxed-consistency choice:
//! transient over-provisioning, never lost memory.
//!
//! Chunks are only ever returned to the source by [`GrowablePool::shrink`]
//! (exclusive access) or by dropping the pool — never opportunistically on
//! deallocate.

use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::alloc::{alloc, dealloc, Layout};
use std::sync::Arc;

use crate::alloc::pool::{FixedPool, NULL_INDEX};
use crate::arena::Arena;
use crate::error::ConfigError;

/// Alignment of chunks handed to a [`GrowablePool`]. The chunk header is
/// placed at the chunk's first byte and contains cache-padded atomics, so
/// this must cover their 128-byte alignment.
pub const CHUNK_ALIGN: usize = 128;

/// A provider of equal-size memory chunks.
///
/// The source decides where chunk memory lives: the process heap
/// ([`HeapChunks`]) or a caller-owned arena
/// ([`ArenaChunks`](crate::ArenaChunks)).
pub trait ChunkSource {
    /// Size of every chunk this source hands out.
    fn chunk_size(&self) -> usize;

    /// Acquires one chunk, aligned to [`CHUNK_ALIGN`], or `None` when the
    /// source is exhausted.
    fn acquire(&self) -> Option<NonNull<u8>>;

    /// Returns a chunk to the source.
    ///
    /// # Safety
    /// `chunk` must have come from [`acquire`] on this source and must no
    /// longer be accessed.
    ///
    /// [`acquire`]: Self::acquire
    unsafe fn release(&self, chunk: NonNull<u8>);
}

impl<S: ChunkSource + ?Sized> ChunkSource for &S {
    fn chunk_size(&self) -> usize {
        (**self).chunk_size()
    }
    fn acquire(&self) -> Option<NonNull<u8>> {
        (**self).acquire()
    }
    unsafe fn release(&self, chunk: NonNull<u8>) {
        (**self).release(chunk);
    }
}

impl<S: ChunkSource + ?Sized> ChunkSource for Arc<S> {
    fn chunk_size(&self) -> usize {
        (**self).chunk_size()
    }
    fn acquire(&self) -> Option<NonNull<u8>> {
        (**self).acquire()
    }
    unsafe fn release(&self, chunk: NonNull<u8>) {
        (**self).release(chunk);
    }
}

/// A [`ChunkSource`] backed by the process heap.
#[derive(Debug)]
pub struct HeapChunks {
    chunk_size: usize,
}

impl HeapChunks {
    /// Creates a heap-backed source of `chunk_size`-byte chunks.
    ///
    /// # Errors
    /// `ConfigError::BlockTooSmall` if a chunk cannot hold the chunk header
    /// plus at least one minimal block.
    pub fn new(chunk_size: usize) -> Result<Self, ConfigError> {
        let min = payload_offset() + mem::size_of::<u32>();
        if chunk_size < min {
            return Err(ConfigError::BlockTooSmall { size: chunk_size, min });
        }
        Ok(Self { chunk_size })
    }
}

impl ChunkSource for HeapChunks {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn acquire(&self) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(self.chunk_size, CHUNK_ALIGN).ok()?;
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn release(&self, chunk: NonNull<u8>) {
        let layout = Layout::from_size_align_unchecked(self.chunk_size, CHUNK_ALIGN);
        dealloc(chunk.as_ptr(), layout);
    }
}

/// Header written at the first bytes of every chunk.
#[repr(C)]
struct ChunkHeader {
    next: AtomicPtr<ChunkHeader>,
    pool: FixedPool,
}

/// First byte of a chunk's block payload.
fn payload_offset() -> usize {
    const PAYLOAD_ALIGN: usize = 16;
    mem::size_of::<ChunkHeader>().div_ceil(PAYLOAD_ALIGN) * PAYLOAD_ALIGN
}

/// A pool of fixed-size blocks spread over chunks from a [`ChunkSource`].
pub struct GrowablePool<S: ChunkSource> {
    source: S,
    block_size: usize,
    blocks_per_chunk: usize,
    head: AtomicPtr<ChunkHeader>,
    num_chunks: AtomicUsize,
}

unsafe impl<S: ChunkSource + Send> Send for GrowablePool<S> {}
unsafe impl<S: ChunkSource + Sync> Sync for GrowablePool<S> {}

impl<S: ChunkSource> GrowablePool<S> {
    /// Creates an empty pool of `block_size`-byte blocks over `source`.
    ///
    /// # Errors
    /// `ConfigError::BlockTooSmall` if `block_size` cannot hold the intrusive
    /// free index, `ConfigError::BlockTooLarge` if a chunk cannot hold a
    /// single block after the header.
    pub fn new(source: S, block_size: usize) -> Result<Self, ConfigError> {
        const MIN_BLOCK: usize = mem::size_of::<u32>();
        if block_size < MIN_BLOCK {
            return Err(ConfigError::BlockTooSmall { size: block_size, min: MIN_BLOCK });
        }
        let chunk_size = source.chunk_size();
        let payload = chunk_size.saturating_sub(payload_offset());
        let blocks_per_chunk = payload / block_size;
        if blocks_per_chunk == 0 {
            return Err(ConfigError::BlockTooLarge { block: block_size, arena: chunk_size });
        }

        Ok(Self {
            source,
            block_size,
            blocks_per_chunk,
            head: AtomicPtr::new(ptr::null_mut()),
            num_chunks: AtomicUsize::new(0),
        })
    }

    /// Size of each block in bytes.
    #[inline]
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of chunks currently owned.
    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.num_chunks.load(Ordering::Relaxed)
    }

    /// Total block capacity across all chunks.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.num_chunks() * self.blocks_per_chunk
    }

    /// Free blocks across all chunks.
    #[must_use]
    pub fn count_free(&self) -> usize {
        let mut free = 0;
        let mut cur = self.head.load(Ordering::Acquire);
        while let Some(header) = unsafe { cur.as_ref() } {
            free += header.pool.count_free();
            cur = header.next.load(Ordering::Acquire);
        }
        free
    }

    /// Allocates one block, growing by a chunk when every chunk is exhausted.
    /// Returns `None` only when the source cannot supply another chunk.
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        loop {
            let mut cur = self.head.load(Ordering::Acquire);
            while let Some(header) = unsafe { cur.as_ref() } {
                let idx = header.pool.allocate_index();
                if idx != NULL_INDEX {
                    return Some(header.pool.slot_ptr(idx));
                }
                cur = header.next.load(Ordering::Acquire);
            }
            if !self.grow_one() {
                return None;
            }
        }
    }

    /// Returns `block` to the chunk that owns it.
    ///
    /// # Safety
    /// `block` must have been returned by [`allocate`] on this pool and not
    /// deallocated since.
    ///
    /// [`allocate`]: Self::allocate
    pub unsafe fn deallocate(&self, block: NonNull<u8>) {
        let mut cur = self.head.load(Ordering::Acquire);
        while let Some(header) = cur.as_ref() {
            if header.pool.owns(block.as_ptr()) {
                header.pool.deallocate_index(header.pool.index_of(block.as_ptr()));
                return;
            }
            cur = header.next.load(Ordering::Acquire);
        }
        debug_assert!(false, "deallocate of a block this pool does not own");
    }

    /// `true` if `ptr` lies in one of this pool's chunks.
    #[must_use]
    pub fn owns(&self, ptr: *const u8) -> bool {
        let mut cur = self.head.load(Ordering::Acquire);
        while let Some(header) = unsafe { cur.as_ref() } {
            if header.pool.owns(ptr) {
                return true;
            }
            cur = header.next.load(Ordering::Acquire);
        }
        false
    }

    /// Appends up to `n` chunks; returns how many were actually acquired.
    pub fn grow(&self, n: usize) -> usize {
        (0..n).take_while(|_| self.grow_one()).count()
    }

    /// Releases up to `limit` fully-empty chunks back to the source (all of
    /// them if `None`); returns how many were released. A chunk with any
    /// live block is never released.
    pub fn shrink(&mut self, limit: Option<usize>) -> usize {
        let limit = limit.unwrap_or(usize::MAX);
        let mut freed = 0usize;
        let mut prev: *mut ChunkHeader = ptr::null_mut();
        let mut cur = self.head.load(Ordering::Relaxed);

        while !cur.is_null() && freed < limit {
            unsafe {
                let next = (*cur).next.load(Ordering::Relaxed);
                if (*cur).pool.is_full() {
                    if prev.is_null() {
                        self.head.store(next, Ordering::Relaxed);
                    } else {
                        (*prev).next.store(next, Ordering::Relaxed);
                    }
                    self.source.release(NonNull::new_unchecked(cur.cast::<u8>()));
                    self.num_chunks.fetch_sub(1, Ordering::Relaxed);
                    freed += 1;
                } else {
                    prev = cur;
                }
                cur = next;
            }
        }

        if freed > 0 {
            tracing::debug!(freed, remaining = self.num_chunks(), "pool shrunk");
        }
        freed
    }

    fn grow_one(&self) -> bool {
        let Some(chunk) = self.source.acquire() else {
            return false;
        };
        let chunk_size = self.source.chunk_size();

        unsafe {
            let payload = chunk.as_ptr().add(payload_offset());
            let payload_len = self.blocks_per_chunk * self.block_size;
            let arena = Arena::from_raw_parts(NonNull::new_unchecked(payload), payload_len);
            let Ok(pool) = FixedPool::new(arena, self.block_size) else {
                // Geometry was validated at construction.
                self.source.release(chunk);
                return false;
            };

            let header = chunk.as_ptr().cast::<ChunkHeader>();
            ptr::write(header, ChunkHeader { next: AtomicPtr::new(ptr::null_mut()), pool });

            // Keep the chunk even when the CAS races with another growing
            // thread: both chunks get linked (accepted over-provisioning).
            let mut cur = self.head.load(Ordering::Acquire);
            loop {
                (*header).next.store(cur, Ordering::Relaxed);
                match self.head.compare_exchange_weak(
                    cur,
                    header,
                    Ordering::Release,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => cur = actual,
                }
            }
        }

        self.num_chunks.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(chunk_size, chunks = self.num_chunks(), "pool grew by one chunk");
        true
    }
}

impl<S: ChunkSource> Drop for GrowablePool<S> {
    /// Returns every chunk to the source, live blocks included; outstanding
    /// pointers must not be used afterwards.
    fn drop(&mut self) {
        let mut cur = self.head.load(Ordering::Relaxed);
        while !cur.is_null() {
            unsafe {
                let next = (*cur).next.load(Ordering::Relaxed);
                self.source.release(NonNull::new_unchecked(cur.cast::<u8>()));
                cur = next;
            }
        }
    }
}

impl<S: ChunkSource> core::fmt::Debug for GrowablePool<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GrowablePool")
            .field("block_size", &self.block_size)
            .field("blocks_per_chunk", &self.blocks_per_chunk)
            .field("num_chunks", &self.num_chunks())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn payload_offset_clears_the_header() {
        assert!(payload_offset() >= mem::size_of::<ChunkHeader>());
        assert_eq!(payload_offset() % 16, 0);
    }

    #[test]
    fn rejects_blocks_larger_than_a_chunk() {
        let source = HeapChunks::new(1024).unwrap();
        let err = GrowablePool::new(source, 4096).unwrap_err();
        assert!(matches!(err, ConfigError::BlockTooLarge { .. }));
    }
}
