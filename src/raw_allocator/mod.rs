//! This module provides the raw allocators and their support types.
//!
//! A "raw allocator" is one, that simply gets requests for a specific number
//! of bytes but does not need to worry about alignment beyond [`ALIGNMENT`].
//! It manages the arena, the block headers and the free lists. Its bookkeeping
//! is guarded by a spin lock, so all operations take `&self`. The scheduler
//! interaction and the `GlobalAlloc`-interface are the job of the
//! [`Heap`](crate::Heap).
//!
//! Two raw allocators share the primitives of this module:
//! - [`PoolAllocator`] serves requests from fixed size classes, each with a
//!   free list of its own (*O(1)* allocation and deallocation).
//! - [`CoalescingAllocator`] keeps a single size-ordered free list and merges
//!   physically adjacent free blocks on deallocation (*O(n)*).
mod buffer;
mod coalescing;
mod entry;
mod frontier;
mod pool;
mod size_class;

pub use coalescing::{CoalescingAllocator, FreeList};
pub use pool::{FreeBlocks, PoolAllocator};
pub use size_class::{ConfigError, SizeClasses, DEFAULT_SIZE_CLASSES, MAX_SIZE_CLASSES};

use core::mem;
use core::ops::Range;
use core::ptr::NonNull;
use thiserror::Error;

/// The alignment of every block and therefore of every returned pointer.
pub const ALIGNMENT: usize = 8;

/// The size of the header in front of every block, rounded up to
/// [`ALIGNMENT`].
pub const HEADER_SIZE: usize = align_up(mem::size_of::<entry::Entry>());

/// The smallest block ever carved: a header plus room for another one.
pub const MIN_BLOCK_SIZE: usize = 2 * HEADER_SIZE;

/// Round `n` up to the next multiple of [`ALIGNMENT`].
const fn align_up(n: usize) -> usize {
    (n + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// The total size of a block with `payload` usable bytes.
///
/// This adds the header, rounds up to the [`ALIGNMENT`] and enforces the
/// [`MIN_BLOCK_SIZE`]. Returns `None` if the size is not representable.
pub const fn block_size(payload: usize) -> Option<usize> {
    match payload.checked_add(HEADER_SIZE + ALIGNMENT - 1) {
        Some(size) => {
            let size = size & !(ALIGNMENT - 1);
            if size < MIN_BLOCK_SIZE {
                Some(MIN_BLOCK_SIZE)
            } else {
                Some(size)
            }
        }
        None => None,
    }
}

/// An error occurred when calling `free()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FreeError {
    /// There is a double-free detected. An already freed-up-block is freed up
    /// again.
    #[error("double free detected")]
    DoubleFreeDetected,
    /// An invalid pointer was freed up (either a pointer outside of the heap
    /// memory or a pointer, that does not point behind a block header).
    #[error("the freed pointer was not allocated by this heap")]
    AllocationNotFound,
}

/// A free block as reported by the introspection of an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// The offset of the block (i.e. its header) from the start of the arena.
    pub offset: usize,
    /// The total size of the block including the header.
    pub size: usize,
    /// The index of the size class owning the block, if the allocator uses
    /// size classes.
    pub class: Option<usize>,
}

/// A memory allocator for contiguous slices of bytes inside a fixed arena.
///
/// This allocator is an intermediate one, which does not need to handle the
/// alignment of a [`Layout`](core::alloc::Layout). Every returned slice is
/// aligned to [`ALIGNMENT`].
///
/// Implementations serialize their operations internally, but never form a
/// reference to the whole arena: a returned block stays valid while other
/// blocks are allocated and freed.
pub trait RawAllocator {
    /// The iterator returned by [`free_blocks()`](RawAllocator::free_blocks).
    type FreeBlocks<'a>: Iterator<Item = FreeBlock>
    where
        Self: 'a;

    /// Initialize the arena. Calling this more than once is a no-op.
    ///
    /// This is done lazily by the first allocation, if it was not done before.
    fn initialize(&self);

    /// Allocate a new memory block of at least `n` bytes.
    ///
    /// The returned slice is the complete payload of the block, which might be
    /// larger than requested. Its contents are unspecified. Requests of zero
    /// bytes fail. If the allocation fails, `None` will be returned and
    /// nothing is modified.
    fn alloc(&self, n: usize) -> Option<NonNull<[u8]>>;

    /// Free the block, whose payload starts at `ptr`.
    ///
    /// The header of the block is checked before the block is linked into a
    /// free list, which detects double frees and many foreign pointers.
    ///
    /// # Safety
    /// `ptr` must either be returned by [`alloc()`](RawAllocator::alloc) of
    /// this very allocator or point outside of its arena. Pointers into the
    /// middle of a block might make the allocator read uninitialized memory.
    unsafe fn free(&self, ptr: *mut u8) -> Result<(), FreeError>;

    /// The advisory number of free bytes (headers included). This says
    /// nothing about fragmentation.
    fn free_bytes(&self) -> usize;

    /// Enumerate every free block without modifying anything.
    ///
    /// The allocator stays locked until the iterator is dropped.
    fn free_blocks(&self) -> Self::FreeBlocks<'_>;

    /// The address range of the arena.
    fn arena(&self) -> Range<*const u8>;
}
