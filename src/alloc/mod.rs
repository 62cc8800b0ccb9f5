//! Arena-backed allocators.
//!
//! Every allocator here manages memory the caller owns (see
//! [`Arena`](crate::Arena)) and hands failures back as `None` or a sentinel
//! index; only construction can fail loudly, with a
//! [`ConfigError`](crate::ConfigError).

pub mod buddy;
pub mod growable;
pub mod pool;
pub mod segregated;
pub mod small_block;

pub use buddy::BuddyAlloc;
pub use growable::{ChunkSource, GrowablePool, HeapChunks, CHUNK_ALIGN};
pub use pool::{FixedPool, TypedPool, NULL_INDEX};
pub use segregated::SegregatedAlloc;
pub use small_block::{ArenaChunks, SmallBlockAlloc};

use core::ptr::NonNull;

/// The capability seam shared by the byte-oriented allocators.
///
/// Implemented by [`SegregatedAlloc`], [`BuddyAlloc`] and
/// [`SmallBlockAlloc`]; selected at construction time and dispatched
/// statically, so generic code over `A: ArenaAlloc` carries no vtable.
///
/// The pool family is not covered: its currency is slot indices, not byte
/// ranges.
pub trait ArenaAlloc {
    /// Allocates `size` bytes, or `None` under capacity or fragmentation
    /// pressure. Never panics, never blocks, never partially mutates state
    /// on failure.
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Returns a block. Null is a no-op.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer previously returned by
    /// [`allocate`](Self::allocate) on this instance and not deallocated
    /// since.
    unsafe fn deallocate(&mut self, ptr: *mut u8);

    /// O(n) integrity diagnostic for tests and fuzz harnesses, not
    /// production hot paths.
    fn is_valid(&self) -> bool;
}
