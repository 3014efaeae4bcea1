//! Pool allocator for embedded systems with a cooperative scheduler
//!
//! This crate provides a [`Heap`], which serves allocations from a single,
//! statically sized arena. It implements the [`core::alloc::GlobalAlloc`]-trait,
//! which is required to use the [`alloc`-crate][alloc] on `#![no_std]`-targets,
//! but it can also be used directly via [`Heap::allocate()`] and
//! [`Heap::free()`]. There is no underlying operating system allocator: all
//! memory comes from the arena, which is part of the heap value itself.
//!
//! Every operation is a short critical section: the heap suspends the
//! [`Scheduler`] of the surrounding runtime, does its bookkeeping and resumes
//! the scheduler again. Without a scheduler use [`NoScheduler`].
//!
//! # Usage
//! Copy the following into your binary crate and adjust the number of bytes of
//! the arena (here 4K):
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: poolheap::PoolHeap<4096> = poolheap::PoolHeap::new();
//!
//! extern crate alloc;
//! ```
//! The heap can also be used directly, e.g. with a custom table of size
//! classes:
//! ```
//! let heap = poolheap::PoolHeap::<2048>::new();
//! heap.initialize_pools(&[32, 64, 128]).unwrap();
//!
//! let ptr = heap.allocate(50).unwrap();
//! unsafe { heap.free(ptr.as_ptr()).unwrap() };
//! ```
//!
//! # Variants
//! There are two flavors of the heap, built from the same primitives (the
//! arena, the block header, free lists and the bump frontier):
//! - [`PoolHeap`] rounds every request up to one of a few size classes. Each
//!   class has a free list of its own, so allocating and freeing are *O(1)*.
//!   Freed blocks are only reused for the same class.
//! - [`CoalescingHeap`] keeps a single free list ordered by size and merges
//!   adjacent free blocks on every free. This is *O(n)* in the number of free
//!   blocks, but does not suffer from external fragmentation due to adjacent
//!   free runs.
//!
//! # Implementation
//! The pool heap works as follows (`hhhh` is a block header, which is two
//! machine words: the index of the owning size class and a link to the next
//! free block of that class):
//! 1.  We start with an untouched arena. The bump frontier (`^`) is at its
//!     start.
//!     ```text
//!     .... .... .... .... .... .... .... ....
//!     ^
//!     ```
//! 2.  A request for 10 bytes comes in. It is mapped to the smallest size
//!     class, that is not smaller than the request (say 16). Since the free
//!     list of that class is empty, a new block is carved at the frontier: the
//!     block consists of the header and the class size, rounded up to the
//!     alignment of 8 bytes.
//!     ```text
//!     hhhh 0000 .... .... .... .... .... ....
//!     ^--- ^---      ^
//!     #0   USED
//!     ```
//! 3.  A request for 24 bytes is mapped to the next class (say 32) and carved
//!     the same way.
//!     ```text
//!     hhhh 0000 hhhh 0000 0000 .... .... ....
//!     ^--- ^--- ^--- ^-------       ^
//!     #0   USED #1   USED
//!     ```
//! 4.  The first block is freed. The header in front of the pointer tells the
//!     class, so the block is pushed to the free list of class `#0`. The
//!     frontier never moves back.
//! 5.  Another request for 16 bytes pops the head of the free list of class
//!     `#0`: it reuses the block freed in step 4 without touching the
//!     frontier.
//! 6.  A request larger than the largest class, or one, that would carve past
//!     the end of the arena, fails and returns `None` (or a null pointer via
//!     `GlobalAlloc`). Nothing is modified in that case.
//!
//! Since blocks are never split nor merged, a freed block stays in its class
//! forever. Tune the size classes for the application: every request wastes
//! the difference between the class size and the requested size.
//!
//! The coalescing heap is described at [`CoalescingAllocator`].
//!
//! # Error handling
//! Running out of memory is reported as `None` (and a call of
//! [`Scheduler::allocation_failed()`]). Freeing a pointer twice or a pointer,
//! that was not allocated by the heap, is a contract violation, but the heap
//! detects it in most cases and reports a [`FreeError`] instead of corrupting
//! its free lists.
//!
//! [alloc]: https://doc.rust-lang.org/alloc/index.html
#![no_std]

pub mod raw_allocator;
pub mod scheduler;

pub use raw_allocator::{
    CoalescingAllocator, ConfigError, FreeBlock, FreeError, PoolAllocator, RawAllocator,
    SizeClasses, ALIGNMENT, DEFAULT_SIZE_CLASSES, HEADER_SIZE, MAX_SIZE_CLASSES, MIN_BLOCK_SIZE,
};
pub use scheduler::{NoScheduler, Scheduler};

use core::alloc::{GlobalAlloc, Layout};
use core::ops::Range;
use core::ptr::{self, NonNull};
use scheduler::CriticalSection;

/// The memory allocator for embedded systems.
///
/// This is the core type of this crate: it combines a [`RawAllocator`] with
/// the [`Scheduler`] of the runtime. The arena is part of the raw allocator,
/// therefore the heap memory usage is statically limited to an upper value
/// and counts towards the static memory (e.g. the `.bss`-section).
///
/// Pointers returned by the heap point into the heap value itself: the heap
/// must not be moved while there are live allocations. Placing it into a
/// `static` (as usual for a global allocator) guarantees that.
///
/// Every operation first suspends the scheduler, then the raw allocator takes
/// its spin lock for the bookkeeping. Live allocations are never covered by
/// that lock, so they can be used concurrently with other heap operations.
///
/// The heap reports through the [`log`] facade. If it is the global allocator,
/// the installed logger must not allocate, since it would be called while
/// an allocation is in progress.
pub struct Heap<A, S = NoScheduler> {
    raw: A,
    scheduler: S,
}

/// A [`Heap`] serving requests from size classes.
pub type PoolHeap<const N: usize, S = NoScheduler> = Heap<PoolAllocator<N>, S>;

/// A [`Heap`] coalescing adjacent free blocks.
pub type CoalescingHeap<const N: usize, S = NoScheduler> = Heap<CoalescingAllocator<N>, S>;

impl<A, S> Heap<A, S> {
    /// Create a heap from a raw allocator and the scheduler to suspend during
    /// every operation.
    pub const fn with_scheduler(raw: A, scheduler: S) -> Self {
        Self { raw, scheduler }
    }

    /// The scheduler used by this heap.
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }
}

impl<const N: usize> PoolHeap<N> {
    /// Create a new [`PoolHeap`] with an arena of `N` bytes.
    ///
    /// This function is a `const fn`, therefore you can call it directly when
    /// creating the allocator. The resulting value is all-zero (or
    /// uninitialized), so a `static` heap is placed into `.bss`.
    ///
    /// # Panics
    /// This function will panic, if the supplied arena size, i.e. `N` is less
    /// than [`MIN_BLOCK_SIZE`] or not divisible by `8`.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        Self::with_scheduler(PoolAllocator::new(), NoScheduler)
    }

    /// Create a new [`PoolHeap`] with a fixed table of size classes.
    ///
    /// # Panics
    /// This function panics under the same conditions as [`Self::new()`].
    #[must_use]
    pub const fn with_size_classes(classes: SizeClasses) -> Self {
        Self::with_scheduler(PoolAllocator::with_size_classes(classes), NoScheduler)
    }
}

impl<const N: usize> CoalescingHeap<N> {
    /// Create a new [`CoalescingHeap`] with an arena of `N` bytes.
    ///
    /// # Panics
    /// This function will panic, if the supplied arena size, i.e. `N` is less
    /// than [`MIN_BLOCK_SIZE`] or not divisible by `8`.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        Self::with_scheduler(CoalescingAllocator::new(), NoScheduler)
    }
}

impl<A: RawAllocator, S: Scheduler> Heap<A, S> {
    /// Run `f` on the raw allocator while the scheduler is suspended.
    fn critical_section<R>(&self, f: impl FnOnce(&A) -> R) -> R {
        let _section = CriticalSection::enter(&self.scheduler);
        f(&self.raw)
    }

    /// Initialize the arena.
    ///
    /// This happens automatically on the first allocation, so calling this is
    /// optional. Subsequent calls are no-ops.
    pub fn initialize_heap(&self) {
        self.critical_section(|raw| raw.initialize());
    }

    /// Allocate `size` bytes.
    ///
    /// The returned pointer is aligned to [`ALIGNMENT`] and points to at least
    /// `size` bytes, which are not initialized in any way (freed memory is
    /// handed out again as is). `None` is returned if `size` is zero, if it
    /// does not fit any size class or if the arena is exhausted. In that case
    /// [`Scheduler::allocation_failed()`] is called after the scheduler is
    /// resumed.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let memory = self.critical_section(|raw| raw.alloc(size));
        let ptr = memory.map(|memory| memory.cast::<u8>());
        if ptr.is_none() {
            log::warn!("allocation of {} bytes failed", size);
            self.scheduler.allocation_failed(size);
        }
        ptr
    }

    /// Free a pointer previously returned by [`allocate()`](Self::allocate).
    ///
    /// Freeing a null pointer is a no-op. Double frees and pointers, that are
    /// not owned by this heap, are reported as a [`FreeError`] in most cases
    /// and leave the heap untouched.
    ///
    /// # Safety
    /// `ptr` must be null, a pointer returned by [`allocate()`](Self::allocate)
    /// of this heap or a pointer outside of the arena. The memory must not be
    /// used after it is freed.
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<(), FreeError> {
        if ptr.is_null() {
            return Ok(());
        }
        // SAFETY: the requirements are forwarded to the caller
        self.critical_section(|raw| unsafe { raw.free(ptr) })
    }

    /// The advisory number of free bytes.
    ///
    /// This includes the headers of the free blocks and the untouched part of
    /// the arena, but says nothing about fragmentation: an allocation of that
    /// size will most likely fail.
    pub fn free_capacity_remaining(&self) -> usize {
        self.critical_section(|raw| raw.free_bytes())
    }

    /// Report every free block to `visitor`.
    ///
    /// The heap is not modified. The visitor runs inside the critical section,
    /// so it observes a consistent state, but it must neither allocate from
    /// nor free to this heap.
    pub fn dump_state(&self, visitor: impl FnMut(FreeBlock)) {
        self.critical_section(|raw| raw.free_blocks().for_each(visitor));
    }

    /// The address range of the arena.
    pub fn arena(&self) -> Range<*const u8> {
        self.critical_section(|raw| raw.arena())
    }
}

impl<const N: usize, S: Scheduler> Heap<PoolAllocator<N>, S> {
    /// Configure the size classes of the heap.
    ///
    /// The table has to be strictly ascending. This can be done only once and
    /// only before the first allocation (which configures the
    /// [`DEFAULT_SIZE_CLASSES`] otherwise): later calls fail with
    /// [`ConfigError::AlreadyConfigured`] and leave the first table in effect.
    pub fn initialize_pools(&self, sizes: &[usize]) -> Result<(), ConfigError> {
        let result = self.critical_section(|raw| raw.initialize_pools(sizes));
        if let Err(error) = result {
            log::warn!("size classes rejected: {}", error);
        }
        result
    }

    /// The configured size classes.
    ///
    /// This is [`SizeClasses::EMPTY`] as long as the heap was neither
    /// configured nor used.
    pub fn size_classes(&self) -> SizeClasses {
        self.critical_section(|raw| raw.size_classes())
    }
}

unsafe impl<A: RawAllocator, S: Scheduler> GlobalAlloc for Heap<A, S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            let memory = self.allocate(layout.size());
            return memory.map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        // Over-allocate, so that the pointer can be aligned and there is room
        // for the start of the block right in front of the aligned pointer.
        let Some(size) = layout.size().checked_add(layout.align()) else {
            return ptr::null_mut();
        };
        let Some(block) = self.allocate(size) else {
            return ptr::null_mut();
        };
        let block = block.as_ptr();
        let start = block as usize + core::mem::size_of::<*mut u8>();
        let aligned = (start + layout.align() - 1) & !(layout.align() - 1);

        // SAFETY: `aligned` is at most `layout.align()` bytes after the block
        // start (which is aligned to 8), so the aligned pointer and the
        // `layout.size()` bytes after it are inside the block. The word in
        // front of it is inside the block as well and properly aligned, since
        // `aligned` is a multiple of at least 16.
        unsafe {
            let aligned = block.add(aligned - block as usize);
            #[allow(clippy::cast_ptr_alignment)] // see above
            let slot = aligned.cast::<*mut u8>().sub(1);
            slot.write(block);
            aligned
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let block = if layout.align() <= ALIGNMENT {
            ptr
        } else {
            // SAFETY: `alloc()` stored the block start in front of `ptr`
            #[allow(clippy::cast_ptr_alignment)]
            let slot = unsafe { ptr.cast::<*mut u8>().sub(1) };
            unsafe { slot.read() }
        };

        // SAFETY: `GlobalAlloc` requires `ptr` to be allocated by `alloc()`
        if let Err(error) = unsafe { self.free(block) } {
            // allocators must not unwind, so the block is leaked instead
            log::error!("invalid deallocation of {:p}: {}", ptr, error);
        }
    }
}
