use super::buffer::{Buffer, ValidatedOffset};
use super::entry::Entry;
use super::{block_size, FreeBlock, FreeError, RawAllocator};
use super::{ALIGNMENT, HEADER_SIZE, MIN_BLOCK_SIZE};

use core::ops::Range;
use core::ptr::NonNull;
use spin::{Mutex, MutexGuard};

/// The bookkeeping of a [`CoalescingAllocator`], guarded by its lock.
struct State {
    /// The head of the size-ordered free list.
    free: Option<ValidatedOffset>,
    free_bytes: usize,
    initialized: bool,
}

/// A raw allocator with a single, size-ordered free list and coalescing.
///
/// # Algorithm
/// On initialization the whole arena becomes a single free block. Every block
/// carries its total size in the header, the free blocks are linked in a list
/// ordered by ascending size.
///
/// An allocation walks the list and takes the first (and therefore smallest)
/// block, that is large enough. If the rest of that block could hold another
/// block of at least [`MIN_BLOCK_SIZE`], the block is split and the rest is put
/// back into the list.
///
/// Freeing a block first merges it with every physically adjacent free block,
/// i.e. one ending where the block starts or one starting where the block
/// ends. Afterwards the (possibly merged) block is inserted in front of the
/// first entry, that is larger than itself.
///
/// ```text
/// hhhh 0000 0000 hhhh 0000 hhhh 0000 0000
/// ^--- ^-------- ^--- ^--- ^--- ^--------
/// FREE size = 12 USED = 8  FREE size = 12
/// ```
/// Freeing the used block above (sizes are drawn with 4-byte headers and
/// include the header) yields a single free block of 32 bytes: the block is
/// merged with its right neighbor and the result with its left neighbor.
pub struct CoalescingAllocator<const N: usize> {
    buffer: Buffer<N>,
    state: Mutex<State>,
}
impl<const N: usize> CoalescingAllocator<N> {
    /// Create a new [`CoalescingAllocator`] with an arena of `N` bytes.
    ///
    /// # Panics
    /// This function panics if the arena size is less than the
    /// [`MIN_BLOCK_SIZE`] or if it is not divisible by 8.
    pub const fn new() -> Self {
        assert!(N >= MIN_BLOCK_SIZE, "too small heap memory");
        assert!(N % 8 == 0, "memory size has to be divisible by 8");

        Self {
            buffer: Buffer::new(),
            state: Mutex::new(State {
                free: None,
                free_bytes: 0,
                initialized: false,
            }),
        }
    }

    fn lock(&self) -> Locked<'_, N> {
        Locked {
            buffer: &self.buffer,
            state: self.state.lock(),
        }
    }
}
impl<const N: usize> Default for CoalescingAllocator<N> {
    fn default() -> Self {
        Self::new()
    }
}
impl<const N: usize> RawAllocator for CoalescingAllocator<N> {
    type FreeBlocks<'a> = FreeList<'a, N>;

    fn initialize(&self) {
        self.lock().initialize();
    }

    fn alloc(&self, n: usize) -> Option<NonNull<[u8]>> {
        let mut heap = self.lock();
        heap.initialize();
        if n == 0 {
            return None;
        }

        let wanted = block_size(n)?;
        let block = heap.take_best_fit(wanted)?;
        let mut size = heap.size_of(block);
        if size - wanted >= MIN_BLOCK_SIZE {
            let rest = Entry::free(size - wanted, None);
            let rest = self.buffer.place(block.get() + wanted, rest);
            // the block was coalesced before, so the rest has no free neighbor
            heap.insert_by_size(rest);
            size = wanted;
        }

        self.buffer.write(block, Entry::used(size));
        heap.state.free_bytes -= size;
        log::trace!("allocated {n} bytes as block of {size}");
        Some(self.buffer.memory_of(block, size - HEADER_SIZE))
    }

    unsafe fn free(&self, ptr: *mut u8) -> Result<(), FreeError> {
        let mut heap = self.lock();
        if !heap.state.initialized {
            return Err(FreeError::AllocationNotFound);
        }
        let offset = self
            .buffer
            .offset_of(ptr)
            .and_then(|payload| payload.checked_sub(HEADER_SIZE))
            .ok_or(FreeError::AllocationNotFound)?;
        // SAFETY: the caller guarantees, that `ptr` was returned by `alloc()`,
        // so there is a header in front of it.
        let block = unsafe { self.buffer.assume_entry(offset) }
            .ok_or(FreeError::AllocationNotFound)?;

        let entry = self.buffer.read(block);
        if !entry.is_used() {
            return Err(FreeError::DoubleFreeDetected);
        }
        let size = entry.tag();
        let limit = self.buffer.usable().end;
        let plausible = size >= MIN_BLOCK_SIZE
            && size % ALIGNMENT == 0
            && offset.checked_add(size).is_some_and(|end| end <= limit);
        if !plausible {
            return Err(FreeError::AllocationNotFound);
        }

        self.buffer.write(block, Entry::free(size, None));
        heap.state.free_bytes += size;
        heap.insert(block);
        log::trace!("freed block of {size} at offset {offset}");
        Ok(())
    }

    fn free_bytes(&self) -> usize {
        let state = self.state.lock();
        if state.initialized {
            state.free_bytes
        } else {
            self.buffer.usable().len()
        }
    }

    fn free_blocks(&self) -> FreeList<'_, N> {
        let state = self.state.lock();
        FreeList {
            buffer: &self.buffer,
            cursor: state.free,
            _guard: state,
        }
    }

    fn arena(&self) -> Range<*const u8> {
        self.buffer.as_ptr_range()
    }
}

/// The free list of a locked [`CoalescingAllocator`].
struct Locked<'a, const N: usize> {
    buffer: &'a Buffer<N>,
    state: MutexGuard<'a, State>,
}
impl<const N: usize> Locked<'_, N> {
    fn initialize(&mut self) {
        if self.state.initialized {
            return;
        }
        let usable = self.buffer.usable();
        let size = usable.len();
        let block = self.buffer.place(usable.start, Entry::free(size, None));
        self.state.free = Some(block);
        self.state.free_bytes = size;
        self.state.initialized = true;
        log::debug!("coalescing heap initialized with {size} bytes");
    }

    fn size_of(&self, block: ValidatedOffset) -> usize {
        self.buffer.read(block).tag()
    }

    fn set_size(&self, block: ValidatedOffset, size: usize) {
        self.buffer.update(block, |entry| entry.set_tag(size));
    }

    fn set_next(&self, block: ValidatedOffset, next: Option<ValidatedOffset>) {
        self.buffer.update(block, |entry| entry.set_next(next));
    }

    /// Remove `current` from the free list, `previous` being its predecessor.
    fn unlink(&mut self, previous: Option<ValidatedOffset>, current: ValidatedOffset) {
        let next = self.buffer.next(current);
        match previous {
            Some(previous) => self.set_next(previous, next),
            None => self.state.free = next,
        }
    }

    /// Merge a free, unlinked `block` with one adjacent free block.
    ///
    /// Returns the offset of the merged block or `None`, if there is no free
    /// neighbor in the list.
    fn absorb_neighbor(&mut self, block: ValidatedOffset) -> Option<ValidatedOffset> {
        let start = block.get();
        let size = self.size_of(block);
        let end = start + size;

        let mut previous = None;
        let mut cursor = self.state.free;
        while let Some(current) = cursor {
            let current_size = self.size_of(current);
            if current.get() == end {
                self.unlink(previous, current);
                self.set_size(block, size + current_size);
                return Some(block);
            }
            if current.get() + current_size == start {
                self.unlink(previous, current);
                self.set_size(current, current_size + size);
                return Some(current);
            }
            previous = cursor;
            cursor = self.buffer.next(current);
        }
        None
    }

    /// Link a free `block` into the list, keeping the ascending size order.
    fn insert_by_size(&mut self, block: ValidatedOffset) {
        let size = self.size_of(block);

        let mut previous = None;
        let mut cursor = self.state.free;
        while let Some(current) = cursor {
            if self.size_of(current) > size {
                break;
            }
            previous = cursor;
            cursor = self.buffer.next(current);
        }

        self.set_next(block, cursor);
        match previous {
            Some(previous) => self.set_next(previous, Some(block)),
            None => self.state.free = Some(block),
        }
    }

    /// Put a free, unlinked block back into the list, merging it with its
    /// neighbors first.
    fn insert(&mut self, mut block: ValidatedOffset) {
        while let Some(merged) = self.absorb_neighbor(block) {
            block = merged;
        }
        self.insert_by_size(block);
    }

    /// Find and unlink the smallest free block of at least `size` bytes.
    fn take_best_fit(&mut self, size: usize) -> Option<ValidatedOffset> {
        let mut previous = None;
        let mut cursor = self.state.free;
        while let Some(current) = cursor {
            if self.size_of(current) >= size {
                self.unlink(previous, current);
                return Some(current);
            }
            previous = cursor;
            cursor = self.buffer.next(current);
        }
        None
    }
}

/// An iterator over the size-ordered free list.
///
/// The allocator stays locked as long as the iterator is alive.
pub struct FreeList<'a, const N: usize> {
    buffer: &'a Buffer<N>,
    cursor: Option<ValidatedOffset>,
    _guard: MutexGuard<'a, State>,
}
impl<const N: usize> Iterator for FreeList<'_, N> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.cursor?;
        self.cursor = self.buffer.next(offset);
        Some(FreeBlock {
            offset: offset.get(),
            size: self.buffer.read(offset).tag(),
            class: None,
        })
    }
}
