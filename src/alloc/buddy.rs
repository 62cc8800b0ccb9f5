//! `BuddyAlloc` — a binary-buddy allocator with external bookkeeping.
//!
//! Manages an [`Arena`] as a perfect binary tree of power-of-two blocks. The
//! per-node state (free / used / split, two bits each) lives in a separate
//! caller-supplied buffer sized by [`BuddyAlloc::bookkeeping_size`], so the
//! allocator itself owns no heap memory and the arena carries no headers.
//!
//! Allocation rounds the request up to the next power-of-two multiple of the
//! minimum block size, takes the smallest free node that fits and splits it
//! top-down; free walks back to the owning node and merges with its buddy
//! bottom-up until a buddy is busy or the root is reached.
//!
//! Single-writer by contract, like [`SegregatedAlloc`](crate::SegregatedAlloc).
//!
//! [`Arena`]: crate::Arena

use core::ptr::NonNull;

use crate::alloc::ArenaAlloc;
use crate::arena::Arena;
use crate::error::ConfigError;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum NodeState {
    Free = 0,
    Used = 1,
    Split = 2,
}

/// A buddy allocator over a caller-owned arena and bookkeeping buffer.
pub struct BuddyAlloc {
    arena: Arena,
    /// Two bits per node, nodes indexed 1-based (children `2i`, `2i + 1`).
    bits: NonNull<u8>,
    min_block: usize,
    /// Depth of the leaf level; the root (depth 0) spans the whole arena.
    max_depth: u32,
}

unsafe impl Send for BuddyAlloc {}

impl BuddyAlloc {
    /// Bytes of bookkeeping required for an arena of `arena_size` bytes with
    /// the given minimum block size. Both must be powers of two.
    #[must_use]
    pub const fn bookkeeping_size(arena_size: usize, min_block: usize) -> usize {
        // 1-based implicit tree over `leaves` leaf nodes: slot 0 unused,
        // 2 * leaves slots, two bits each.
        let leaves = arena_size / min_block;
        (leaves * 4 + 7) / 8
    }

    /// Creates the allocator over `arena`, using `bits` for node state.
    ///
    /// The bookkeeping buffer is zeroed, which marks the whole arena free.
    ///
    /// # Errors
    /// `ConfigError::NotPowerOfTwo` if `arena.len()` or `min_block` is not a
    /// power of two, `ConfigError::BlockTooLarge` if `min_block` exceeds the
    /// arena. These are loud configuration failures, distinct from running
    /// out of memory.
    ///
    /// # Safety
    /// `bits` must be valid for reads and writes of
    /// `bookkeeping_size(arena.len(), min_block)` bytes for the allocator's
    /// lifetime, and not aliased elsewhere.
    pub unsafe fn new(
        arena: Arena,
        min_block: usize,
        bits: NonNull<u8>,
    ) -> Result<Self, ConfigError> {
        if min_block == 0 || !min_block.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo { what: "min_block", value: min_block });
        }
        if !arena.len().is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo { what: "arena size", value: arena.len() });
        }
        if min_block > arena.len() {
            return Err(ConfigError::BlockTooLarge { block: min_block, arena: arena.len() });
        }

        let max_depth = (arena.len() / min_block).trailing_zeros();
        let bytes = Self::bookkeeping_size(arena.len(), min_block);
        core::ptr::write_bytes(bits.as_ptr(), 0, bytes);

        tracing::debug!(
            arena = arena.len(),
            min_block,
            depth = max_depth,
            "buddy allocator initialized"
        );
        Ok(Self { arena, bits, min_block, max_depth })
    }

    /// Largest single request this allocator can ever satisfy.
    #[must_use]
    pub fn max_request(&self) -> usize {
        self.arena.len()
    }

    /// Allocates `size` bytes, rounded up to the next power-of-two multiple
    /// of the minimum block size. Zero-size requests round to one minimum
    /// block. Returns `None` on exhaustion or oversized requests.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size > self.arena.len() {
            return None;
        }
        let block = size.next_power_of_two().max(self.min_block);
        let target = (self.arena.len() / block).trailing_zeros();

        let (mut idx, mut depth) = self.find_best(1, 0, target)?;
        while depth < target {
            self.set_state(idx, NodeState::Split);
            self.set_state(2 * idx, NodeState::Free);
            self.set_state(2 * idx + 1, NodeState::Free);
            idx *= 2;
            depth += 1;
        }
        self.set_state(idx, NodeState::Used);

        let offset = (idx - (1 << depth)) * (self.arena.len() >> depth);
        unsafe { Some(NonNull::new_unchecked(self.arena.at(offset))) }
    }

    /// Frees a block, merging with its buddy while the buddy is also free.
    /// A null pointer is a no-op.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer previously returned by [`allocate`]
    /// on this instance and not freed since.
    ///
    /// [`allocate`]: Self::allocate
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        debug_assert!(self.arena.contains(ptr));
        let offset = ptr as usize - self.arena.base().as_ptr() as usize;

        // Walk down the split path to the node that owns this offset.
        let mut idx = 1usize;
        let mut depth = 0u32;
        let mut node_off = 0usize;
        loop {
            match self.state(idx) {
                NodeState::Used => break,
                NodeState::Split => {
                    let half = self.arena.len() >> (depth + 1);
                    idx *= 2;
                    if offset >= node_off + half {
                        idx += 1;
                        node_off += half;
                    }
                    depth += 1;
                }
                NodeState::Free => {
                    debug_assert!(false, "freeing a block that is not allocated");
                    return;
                }
            }
        }
        debug_assert_eq!(node_off, offset);

        self.set_state(idx, NodeState::Free);
        while depth > 0 {
            let buddy = idx ^ 1;
            if self.state(buddy) != NodeState::Free {
                break;
            }
            idx /= 2;
            depth -= 1;
            self.set_state(idx, NodeState::Free);
        }
    }

    /// Tree consistency check: a split node must have two reachable children
    /// that are not both free, and the leaf level must not be split.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.check(1, 0)
    }

    fn check(&self, idx: usize, depth: u32) -> bool {
        match self.state(idx) {
            NodeState::Free | NodeState::Used => true,
            NodeState::Split => {
                if depth >= self.max_depth {
                    return false;
                }
                let l = self.state(2 * idx);
                let r = self.state(2 * idx + 1);
                if l == NodeState::Free && r == NodeState::Free {
                    // Should have merged.
                    return false;
                }
                self.check(2 * idx, depth + 1) && self.check(2 * idx + 1, depth + 1)
            }
        }
    }

    /// Deepest (smallest) free node at most `target` levels down the tree.
    fn find_best(&self, idx: usize, depth: u32, target: u32) -> Option<(usize, u32)> {
        match self.state(idx) {
            NodeState::Used => None,
            NodeState::Free => Some((idx, depth)),
            NodeState::Split => {
                if depth == target {
                    return None;
                }
                let l = self.find_best(2 * idx, depth + 1, target);
                let r = self.find_best(2 * idx + 1, depth + 1, target);
                match (l, r) {
                    (Some(a), Some(b)) => Some(if b.1 > a.1 { b } else { a }),
                    (a, b) => a.or(b),
                }
            }
        }
    }

    fn state(&self, idx: usize) -> NodeState {
        let byte = unsafe { *self.bits.as_ptr().add(idx / 4) };
        match (byte >> ((idx % 4) * 2)) & 0b11 {
            0 => NodeState::Free,
            1 => NodeState::Used,
            _ => NodeState::Split,
        }
    }

    fn set_state(&mut self, idx: usize, state: NodeState) {
        let shift = (idx % 4) * 2;
        unsafe {
            let p = self.bits.as_ptr().add(idx / 4);
            *p = (*p & !(0b11 << shift)) | ((state as u8) << shift);
        }
    }
}

impl ArenaAlloc for BuddyAlloc {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        BuddyAlloc::allocate(self, size)
    }

    unsafe fn deallocate(&mut self, ptr: *mut u8) {
        BuddyAlloc::deallocate(self, ptr);
    }

    fn is_valid(&self) -> bool {
        BuddyAlloc::is_valid(self)
    }
}

impl core::fmt::Debug for BuddyAlloc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BuddyAlloc")
            .field("arena", &self.arena.len())
            .field("min_block", &self.min_block)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bookkeeping_size_covers_the_tree() {
        // 1 MiB arena, 16-byte leaves: 65536 leaves, 131072 1-based slots,
        // two bits each.
        assert_eq!(BuddyAlloc::bookkeeping_size(1 << 20, 16), 32768);
        assert_eq!(BuddyAlloc::bookkeeping_size(64, 64), 1);
    }
}
