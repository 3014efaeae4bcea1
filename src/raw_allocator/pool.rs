use super::buffer::{Buffer, ValidatedOffset};
use super::entry::Entry;
use super::frontier::Frontier;
use super::size_class::{ConfigError, SizeClasses, DEFAULT_SIZE_CLASSES, MAX_SIZE_CLASSES};
use super::{block_size, FreeBlock, FreeError, RawAllocator, HEADER_SIZE, MIN_BLOCK_SIZE};

use core::ops::Range;
use core::ptr::NonNull;
use spin::{Mutex, MutexGuard};

/// The free list of a single size class.
///
/// It operates by linking previously freed blocks of this class together,
/// using the header of each block to store the offset of the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pool {
    /// The class size, i.e. the payload handed out to callers.
    size: usize,
    /// The total size of a block of this class (header included).
    block: usize,
    /// The head of the free list.
    free: Option<ValidatedOffset>,
}
impl Pool {
    const UNUSED: Self = Self {
        size: 0,
        block: 0,
        free: None,
    };
}

/// The bookkeeping of a [`PoolAllocator`], guarded by its lock.
struct State {
    /// The configured table or [`SizeClasses::EMPTY`] if not configured yet.
    classes: SizeClasses,
    pools: [Pool; MAX_SIZE_CLASSES],
    frontier: Frontier,
    free_bytes: usize,
    heap_initialized: bool,
    pools_initialized: bool,
}
impl State {
    fn build_pools(&mut self) {
        for (pool, &size) in self.pools.iter_mut().zip(self.classes.as_slice()) {
            *pool = Pool {
                size,
                // the table is validated, so the block size is representable
                block: block_size(size).unwrap_or(usize::MAX),
                free: None,
            };
        }
        self.pools_initialized = true;
        log::debug!("size classes configured: {:?}", self.classes.as_slice());
    }
}

/// A raw allocator serving requests from fixed size classes.
///
/// Every request is rounded up to the smallest fitting size class. Freed
/// blocks are kept in the free list of their class and reused by later
/// requests of the same class. If the list of a class is empty, a new block is
/// carved from the untouched tail of the arena (the bump frontier). Blocks are
/// never split or merged, which makes both allocation and deallocation *O(1)*.
///
/// Every block is prefixed by a header storing the index of its class, so that
/// freeing a block does not need to know its size.
///
/// All the state is zero or uninitialized after [`new()`](Self::new), so a
/// large allocator placed in a `static` does not occupy space in `.data`. The
/// arena and the pools are initialized lazily.
pub struct PoolAllocator<const N: usize> {
    buffer: Buffer<N>,
    state: Mutex<State>,
}
impl<const N: usize> PoolAllocator<N> {
    /// Create a new [`PoolAllocator`] with an arena of `N` bytes.
    ///
    /// The size classes can be configured by a single call to
    /// [`initialize_pools()`](Self::initialize_pools) before the first
    /// allocation; otherwise [`DEFAULT_SIZE_CLASSES`] are used.
    ///
    /// # Panics
    /// This function panics if the arena size is less than the
    /// [`MIN_BLOCK_SIZE`] or if it is not divisible by 8.
    pub const fn new() -> Self {
        Self::with_size_classes(SizeClasses::EMPTY)
    }

    /// Create a new [`PoolAllocator`] with a fixed table of size classes.
    ///
    /// Later calls to [`initialize_pools()`](Self::initialize_pools) fail.
    ///
    /// # Panics
    /// This function panics under the same conditions as [`Self::new()`].
    pub const fn with_size_classes(classes: SizeClasses) -> Self {
        assert!(N >= MIN_BLOCK_SIZE, "too small heap memory");
        assert!(N % 8 == 0, "memory size has to be divisible by 8");

        Self {
            buffer: Buffer::new(),
            state: Mutex::new(State {
                classes,
                pools: [Pool::UNUSED; MAX_SIZE_CLASSES],
                frontier: Frontier::new(),
                free_bytes: 0,
                heap_initialized: false,
                pools_initialized: false,
            }),
        }
    }

    /// Configure the size classes.
    ///
    /// This initializes the heap (if not done already) and creates an empty
    /// pool for every class. The table is only accepted once: if the classes
    /// were configured before, either by this method, by
    /// [`with_size_classes()`](Self::with_size_classes) or implicitly by the
    /// first allocation, [`ConfigError::AlreadyConfigured`] is returned and
    /// nothing is changed.
    pub fn initialize_pools(&self, sizes: &[usize]) -> Result<(), ConfigError> {
        let mut state = self.state.lock();
        if !state.classes.is_empty() || state.pools_initialized {
            return Err(ConfigError::AlreadyConfigured);
        }
        let classes = SizeClasses::try_from(sizes)?;

        self.initialize_heap(&mut state);
        state.classes = classes;
        state.build_pools();
        Ok(())
    }

    /// The configured size classes ([`SizeClasses::EMPTY`] if the classes are
    /// neither configured nor used yet).
    pub fn size_classes(&self) -> SizeClasses {
        self.state.lock().classes
    }

    /// The current position of the bump frontier (relative to the arena).
    pub fn frontier(&self) -> usize {
        self.state.lock().frontier.position()
    }

    fn initialize_heap(&self, state: &mut State) {
        if state.heap_initialized {
            return;
        }
        let usable = self.buffer.usable();
        state.frontier.reset(usable.start);
        state.free_bytes = usable.len();
        state.heap_initialized = true;
        log::debug!("pool heap initialized with {} bytes", state.free_bytes);
    }

    fn ensure_pools(&self, state: &mut State) {
        self.initialize_heap(state);
        if !state.pools_initialized {
            if state.classes.is_empty() {
                state.classes = SizeClasses::new(&DEFAULT_SIZE_CLASSES);
            }
            state.build_pools();
        }
    }

    /// Obtain a block of the given pool, either from its free list or by
    /// carving a new one from the frontier.
    fn take_block(&self, state: &mut State, index: usize) -> Option<ValidatedOffset> {
        let pool = state.pools[index];
        if let Some(head) = pool.free {
            state.pools[index].free = self.buffer.next(head);
            return Some(head);
        }

        let limit = self.buffer.usable().end;
        let offset = state.frontier.carve(pool.block, limit)?;
        Some(self.buffer.place(offset, Entry::used(index)))
    }
}
impl<const N: usize> Default for PoolAllocator<N> {
    fn default() -> Self {
        Self::new()
    }
}
impl<const N: usize> RawAllocator for PoolAllocator<N> {
    type FreeBlocks<'a> = FreeBlocks<'a, N>;

    fn initialize(&self) {
        self.initialize_heap(&mut self.state.lock());
    }

    fn alloc(&self, n: usize) -> Option<NonNull<[u8]>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.ensure_pools(state);
        if n == 0 {
            return None;
        }

        let index = state.classes.class_of(n)?;
        let offset = self.take_block(state, index)?;
        self.buffer.write(offset, Entry::used(index));

        let Pool { size, block, .. } = state.pools[index];
        state.free_bytes -= block;
        log::trace!("allocated {n} bytes from class {size}");
        Some(self.buffer.memory_of(offset, size))
    }

    unsafe fn free(&self, ptr: *mut u8) -> Result<(), FreeError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let frontier = state.frontier.position();
        let offset = self
            .buffer
            .offset_of(ptr)
            .and_then(|payload| payload.checked_sub(HEADER_SIZE))
            .filter(|&offset| offset + MIN_BLOCK_SIZE <= frontier)
            .ok_or(FreeError::AllocationNotFound)?;
        // SAFETY: the offset lies in the carved part of the arena, so if `ptr`
        // was returned by `alloc()` (guaranteed by the caller), there is a
        // header in front of it.
        let offset = unsafe { self.buffer.assume_entry(offset) }
            .ok_or(FreeError::AllocationNotFound)?;

        let entry = self.buffer.read(offset);
        if !entry.is_used() {
            return Err(FreeError::DoubleFreeDetected);
        }
        let index = entry.tag();
        if index >= state.classes.len() {
            return Err(FreeError::AllocationNotFound);
        }

        let pool = &mut state.pools[index];
        self.buffer.write(offset, Entry::free(index, pool.free));
        pool.free = Some(offset);
        state.free_bytes += pool.block;
        log::trace!("freed block of class {}", pool.size);
        Ok(())
    }

    fn free_bytes(&self) -> usize {
        let state = self.state.lock();
        if state.heap_initialized {
            state.free_bytes
        } else {
            self.buffer.usable().len()
        }
    }

    fn free_blocks(&self) -> FreeBlocks<'_, N> {
        let state = self.state.lock();
        let cursor = if state.pools_initialized {
            state.pools[0].free
        } else {
            None
        };
        FreeBlocks {
            buffer: &self.buffer,
            state,
            index: 0,
            cursor,
        }
    }

    fn arena(&self) -> Range<*const u8> {
        self.buffer.as_ptr_range()
    }
}

/// An iterator over the free blocks of all pools, ordered by size class.
///
/// The allocator stays locked as long as the iterator is alive.
pub struct FreeBlocks<'a, const N: usize> {
    buffer: &'a Buffer<N>,
    state: MutexGuard<'a, State>,
    index: usize,
    cursor: Option<ValidatedOffset>,
}
impl<const N: usize> Iterator for FreeBlocks<'_, N> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(offset) = self.cursor {
                self.cursor = self.buffer.next(offset);
                return Some(FreeBlock {
                    offset: offset.get(),
                    size: self.state.pools[self.index].block,
                    class: Some(self.index),
                });
            }
            if !self.state.pools_initialized || self.index + 1 >= self.state.classes.len() {
                return None;
            }
            self.index += 1;
            self.cursor = self.state.pools[self.index].free;
        }
    }
}
