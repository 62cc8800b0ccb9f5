//! # `palisade` - Arena Allocator Toolkit
//!
//! A family of allocators over caller-owned memory, plus a lock-free
//! concurrent hash map built on the same slot-ownership discipline.
//!
//! ## The arena contract
//!
//! Every allocator manages an [`Arena`]: a contiguous byte region the caller
//! acquires (process heap, mapped file, stack buffer) and lends to exactly
//! one allocator instance. Allocators never allocate or free arena memory
//! themselves; they only hand blocks back to their own internal free
//! structures. Capacity is decided at construction and reclaiming space is
//! always an explicit step.
//!
//! ## The allocators
//!
//! - [`SegregatedAlloc`]: variable-size blocks indexed by a two-level
//!   free-list bitmap for near-O(1) best fit, with split-on-allocate and
//!   coalesce-on-free. Single-writer.
//! - [`BuddyAlloc`]: power-of-two blocks over an implicit binary tree whose
//!   free/split bits live in a separate caller-supplied bookkeeping buffer.
//!   Single-writer.
//! - [`FixedPool`] / [`TypedPool`]: N fixed-size slots with a CAS-based
//!   free-index stack; lock-free, tag-guarded against ABA.
//! - [`GrowablePool`]: a pool spanning whole chunks from a [`ChunkSource`],
//!   growing lazily on exhaustion and shrinking only on request.
//! - [`SmallBlockAlloc`]: one growable pool per declared size class over a
//!   shared arena, routing each request to the smallest sufficient class.
//!
//! ## Failure shape
//!
//! Running out of memory returns `None` (or [`NULL_INDEX`]) and never
//! panics, blocks, or partially mutates state. Handing an allocator a
//! geometry it cannot manage fails loudly at construction with a
//! [`ConfigError`]. Deallocating a null pointer is a no-op; double frees are
//! undefined and only detectable through the `is_valid` diagnostics.
//!
//! ## Example
//!
//! ```rust
//! use core::ptr::NonNull;
//! use palisade::{Arena, SegregatedAlloc};
//!
//! // u64 backing keeps the arena base 8-aligned for the block headers.
//! let mut backing = vec![0u64; 8 * 1024];
//! let arena = unsafe {
//!     Arena::from_raw_parts(
//!         NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap(),
//!         backing.len() * 8,
//!     )
//! };
//!
//! let mut heap = SegregatedAlloc::new(arena).unwrap();
//! let block = heap.allocate(100).unwrap();
//! unsafe { heap.deallocate(block.as_ptr()) };
//! assert!(heap.is_valid());
//! ```

#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod alloc;
pub mod arena;
pub mod collections;
pub mod error;

pub use alloc::{
    ArenaAlloc,
    ArenaChunks,
    BuddyAlloc,
    ChunkSource,
    FixedPool,
    GrowablePool,
    HeapChunks,
    SegregatedAlloc,
    SmallBlockAlloc,
    TypedPool,
    CHUNK_ALIGN,
    NULL_INDEX,
};
pub use arena::Arena;
pub use collections::ConcurrentHashMap;
pub use error::ConfigError;

// Layout assumptions the intrusive structures rely on.
const _: () = {
    use core::mem;

    // A free slot stores its successor index in its first four bytes.
    assert!(mem::size_of::<u32>() == 4);

    // The packed tag|index head must fit one atomic word.
    assert!(mem::size_of::<u64>() == 2 * mem::size_of::<u32>());
};
