//! Construction-time configuration errors.
//!
//! The allocators distinguish two failure kinds. Running out of memory is a
//! normal outcome signalled by `None` / [`NULL_INDEX`](crate::NULL_INDEX) and
//! never panics. Handing an allocator a geometry it cannot manage is a
//! programmer error and fails loudly at construction with a [`ConfigError`].

use thiserror::Error;

/// A configuration rejected at `new` time.
///
/// Distinct from ordinary allocation failure: a `ConfigError` indicates the
/// caller wired the allocator up wrong, not that the arena is under pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The arena cannot hold even one block plus bookkeeping.
    #[error("arena of {size} bytes is too small (need at least {min})")]
    ArenaTooSmall {
        /// Size the caller supplied.
        size: usize,
        /// Minimum the allocator can work with.
        min: usize,
    },

    /// The arena exceeds the 32-bit offset range used for intra-arena links.
    #[error("arena of {0} bytes exceeds the 4 GiB offset range")]
    ArenaTooLarge(usize),

    /// A size that the allocator requires to be a power of two is not.
    #[error("{what} must be a power of two, got {value}")]
    NotPowerOfTwo {
        /// Which parameter was rejected.
        what: &'static str,
        /// The offending value.
        value: usize,
    },

    /// A block or chunk size too small to thread the intrusive free list
    /// through, or zero.
    #[error("block size {size} is below the {min} byte minimum")]
    BlockTooSmall {
        /// Size the caller supplied.
        size: usize,
        /// Minimum block size for this allocator.
        min: usize,
    },

    /// A block, chunk, or minimum-block size that does not fit the arena.
    #[error("block size {block} does not fit an arena of {arena} bytes")]
    BlockTooLarge {
        /// Size the caller supplied.
        block: usize,
        /// Arena size it was checked against.
        arena: usize,
    },

    /// The arena base address is not aligned as the allocator requires.
    #[error("arena base must be aligned to {0} bytes")]
    MisalignedArena(usize),

    /// The arena size is not the exact multiple the small-block allocator
    /// requires (`chunk_size * (num_classes + 1)`).
    #[error("arena size {size} is not a multiple of {required}")]
    BadArenaMultiple {
        /// Size the caller supplied.
        size: usize,
        /// Required divisor.
        required: usize,
    },

    /// The size-class list is empty, or a class cannot fit in a chunk.
    #[error("invalid size-class list")]
    BadSizeClasses,
}
