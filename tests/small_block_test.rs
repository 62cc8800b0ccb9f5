//! Small-block allocator tests: geometry validation, class routing, and
//! chunk migration between classes under arena pressure.

use core::ptr::NonNull;
use std::alloc::{alloc_zeroed, dealloc, Layout};

use palisade::{Arena, ConfigError, GrowablePool, HeapChunks, SmallBlockAlloc};

const CHUNK: usize = 4096;

/// Arena storage aligned to the chunk size, as `ArenaChunks` requires.
struct ChunkAligned {
    ptr: *mut u8,
    layout: Layout,
}

impl ChunkAligned {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, CHUNK).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    fn arena(&self) -> Arena {
        unsafe { Arena::from_raw_parts(NonNull::new(self.ptr).unwrap(), self.layout.size()) }
    }
}

impl Drop for ChunkAligned {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// Blocks of `block_size` that fit one chunk, measured through a probe pool.
fn blocks_per_chunk(block_size: usize) -> usize {
    let probe = GrowablePool::new(HeapChunks::new(CHUNK).unwrap(), block_size).unwrap();
    probe.grow(1);
    probe.capacity()
}

#[test]
fn rejects_bad_geometry() {
    let buf = ChunkAligned::new(CHUNK * 3);

    let err = SmallBlockAlloc::new(buf.arena(), CHUNK, &[]).unwrap_err();
    assert_eq!(err, ConfigError::BadSizeClasses);

    // Two classes need a multiple of CHUNK * 3; CHUNK * 4 is not one.
    let buf4 = ChunkAligned::new(CHUNK * 4);
    let err = SmallBlockAlloc::new(buf4.arena(), CHUNK, &[64, 256]).unwrap_err();
    assert_eq!(err, ConfigError::BadArenaMultiple { size: CHUNK * 4, required: CHUNK * 3 });

    // Chunk-aligned length, base nudged off the chunk boundary.
    let padded = ChunkAligned::new(CHUNK * 4);
    let nudged = unsafe {
        Arena::from_raw_parts(NonNull::new(padded.ptr.add(128)).unwrap(), CHUNK * 3)
    };
    let err = SmallBlockAlloc::new(nudged, CHUNK, &[64, 256]).unwrap_err();
    assert_eq!(err, ConfigError::MisalignedArena(CHUNK));

    // A class larger than a chunk's payload can never be served.
    let err = SmallBlockAlloc::new(buf.arena(), CHUNK, &[64, CHUNK * 2]).unwrap_err();
    assert_eq!(err, ConfigError::BadSizeClasses);
}

#[test]
fn routes_each_request_to_its_class() {
    let buf = ChunkAligned::new(CHUNK * 3);
    let mut alloc = SmallBlockAlloc::new(buf.arena(), CHUNK, &[32, 128]).unwrap();
    assert_eq!(alloc.num_classes(), 2);
    assert_eq!(alloc.free_chunks(), 3);

    // First allocation of each class claims that class its own chunk.
    let small = alloc.allocate(16).unwrap();
    assert_eq!(alloc.free_chunks(), 2);
    let large = alloc.allocate(100).unwrap();
    assert_eq!(alloc.free_chunks(), 1);
    assert!(alloc.is_valid());

    // No class covers this size at all.
    assert!(alloc.allocate(4096).is_none());

    unsafe {
        alloc.deallocate(small.as_ptr());
        alloc.deallocate(large.as_ptr());
    }
    // Frees return blocks, not chunks.
    assert_eq!(alloc.free_chunks(), 1);
    assert!(alloc.is_valid());
}

#[test]
fn duplicate_classes_collapse() {
    let buf = ChunkAligned::new(CHUNK * 3);
    let alloc = SmallBlockAlloc::new(buf.arena(), CHUNK, &[64, 64]).unwrap();
    // Deduplicated list, but the arena multiple was checked against the
    // declared list of two.
    assert_eq!(alloc.num_classes(), 1);
}

#[test]
fn null_deallocate_is_a_no_op() {
    let buf = ChunkAligned::new(CHUNK * 2);
    let mut alloc = SmallBlockAlloc::new(buf.arena(), CHUNK, &[64]).unwrap();
    unsafe { alloc.deallocate(core::ptr::null_mut()) };
    assert!(alloc.is_valid());
}

#[test]
fn exhaustion_fails_cleanly_then_frees_reopen_capacity() {
    let buf = ChunkAligned::new(CHUNK * 2);
    let mut alloc = SmallBlockAlloc::new(buf.arena(), CHUNK, &[256]).unwrap();

    let expected = 2 * blocks_per_chunk(256);
    let mut blocks = Vec::with_capacity(expected);
    for _ in 0..expected {
        blocks.push(alloc.allocate(256).expect("capacity not yet exhausted"));
    }
    for _ in 0..4 {
        assert!(alloc.allocate(256).is_none());
    }
    assert!(alloc.is_valid());

    unsafe { alloc.deallocate(blocks.pop().unwrap().as_ptr()) };
    assert!(alloc.allocate(256).is_some());
}

#[test]
fn empty_chunks_migrate_between_classes_under_pressure() {
    let buf = ChunkAligned::new(CHUNK * 3);
    let mut alloc = SmallBlockAlloc::new(buf.arena(), CHUNK, &[64, 256]).unwrap();

    let per_chunk = blocks_per_chunk(256);
    let total = 3 * per_chunk;

    // The large class swallows every chunk in the arena.
    let mut blocks = Vec::with_capacity(total);
    for _ in 0..total {
        blocks.push(alloc.allocate(256).expect("chunk still available"));
    }
    assert_eq!(alloc.free_chunks(), 0);
    assert!(alloc.allocate(256).is_none());

    // The small class cannot grow either: no chunk is free or empty.
    assert!(alloc.allocate(8).is_none());
    assert!(alloc.is_valid());

    // Chunks are filled newest-first, so the tail of the allocation order
    // is exactly the last chunk. Emptying it makes it reassignable.
    for ptr in blocks.drain(total - per_chunk..) {
        unsafe { alloc.deallocate(ptr.as_ptr()) };
    }
    let small = alloc.allocate(8).expect("vacated chunk should migrate");
    assert!(alloc.is_valid());
    assert_eq!(alloc.free_chunks(), 0);

    unsafe { alloc.deallocate(small.as_ptr()) };
    for ptr in blocks.drain(..) {
        unsafe { alloc.deallocate(ptr.as_ptr()) };
    }
    assert!(alloc.is_valid());
}
