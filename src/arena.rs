//! `Arena` — a caller-owned contiguous memory region.
//!
//! Every allocator in this crate manages an arena it does not own: the caller
//! acquires the backing memory (process heap, mapped file, stack buffer),
//! lends it to exactly one allocator instance, and releases it after that
//! allocator is dropped. Allocators never grow, shrink, or free the arena.

use core::fmt;
use core::ptr::NonNull;

/// A fixed-size contiguous byte region lent to a single allocator.
///
/// An `Arena` is a thin `(base, size)` pair. It performs no allocation and no
/// deallocation; dropping it is a no-op.
pub struct Arena {
    base: NonNull<u8>,
    size: usize,
}

// The arena is a passive region descriptor; exclusive ownership of the bytes
// is part of the `from_raw_parts` contract.
unsafe impl Send for Arena {}

impl Arena {
    /// Creates an arena over `size` bytes starting at `base`.
    ///
    /// # Safety
    /// - `base` must be valid for reads and writes of `size` bytes for the
    ///   whole lifetime of the allocator the arena is given to.
    /// - The region must not be accessed through any other path while the
    ///   allocator is alive.
    #[must_use]
    pub const unsafe fn from_raw_parts(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    /// Base address of the region.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Size of the region in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.size
    }

    /// Returns `true` if the region is zero-sized.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns `true` if `ptr` points inside the region.
    #[inline]
    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.size
    }

    /// Pointer to the byte at `offset`.
    ///
    /// # Safety
    /// `offset` must be within the region.
    #[inline]
    pub(crate) unsafe fn at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.size);
        self.base.as_ptr().add(offset)
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("base", &self.base.as_ptr())
            .field("size", &self.size)
            .finish()
    }
}
