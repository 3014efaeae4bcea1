use super::entry::Entry;
use super::{ALIGNMENT, HEADER_SIZE};

use core::cell::UnsafeCell;
use core::mem::{self, MaybeUninit};
use core::ops::Range;
use core::ptr::NonNull;

/// An offset into the [`Buffer`], that is validated and known to be safe.
///
/// A validated offset always points to an initialized [`Entry`]: it is only
/// handed out after an entry was written to that location (or if the caller
/// promised that one was written earlier, see [`Buffer::assume_entry`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedOffset(usize);
impl ValidatedOffset {
    /// The offset of the entry relative to the start of the buffer.
    pub const fn get(self) -> usize {
        self.0
    }
}

/// The arena memory backing the heap.
///
/// The buffer starts out completely uninitialized. This is important for
/// large heaps placed in a `static`: only all-zero or uninitialized statics
/// end up in `.bss` instead of `.data` (and therefore in flash).
///
/// The memory is only accessed through raw pointers derived from the cell and
/// never through a reference spanning the whole buffer. Callers keep using the
/// pointers to their blocks while the allocator reads and writes the headers
/// of other blocks, so a reference to the whole buffer would invalidate them.
#[repr(C, align(8))]
pub struct Buffer<const N: usize>(UnsafeCell<[MaybeUninit<u8>; N]>);

// SAFETY: the headers are only accessed by the owning allocator while it holds
// its lock. The payloads belong to whoever allocated them.
unsafe impl<const N: usize> Sync for Buffer<N> {}

impl<const N: usize> Buffer<N> {
    /// Create a new, uninitialized buffer.
    pub const fn new() -> Self {
        Self(UnsafeCell::new([MaybeUninit::uninit(); N]))
    }

    /// The address of the first byte of the buffer.
    fn base(&self) -> *mut u8 {
        self.0.get().cast()
    }

    /// The part of the buffer usable for blocks.
    ///
    /// The buffer type is aligned to [`ALIGNMENT`], so the usable part starts
    /// at offset zero. Its length is rounded down to a multiple of the
    /// alignment.
    pub fn usable(&self) -> Range<usize> {
        0..(N & !(ALIGNMENT - 1))
    }

    /// Obtain a pointer to the [`Entry`] at `offset`.
    ///
    /// The pointer is in bounds and properly aligned, but the memory pointed to
    /// might not contain an entry at all: whoever reads it has to justify, that
    /// an entry was written there before.
    ///
    /// # Panics
    /// This function panics if the offset is not a multiple of the alignment or
    /// the offset plus the size of an entry would exceed the buffer.
    #[allow(clippy::cast_ptr_alignment)] // alignment is asserted
    fn entry(&self, offset: usize) -> *mut Entry {
        assert!(offset % ALIGNMENT == 0);
        assert!(offset + mem::size_of::<Entry>() <= N);

        // SAFETY: the offset plus the size of an `Entry` is inside the buffer
        // (checked by the assert above), so the pointer stays in bounds. The
        // offset is a multiple of `ALIGNMENT`, which is at least the alignment
        // of `Entry`, and the buffer itself is aligned to `ALIGNMENT` using
        // `#[repr(align(8))]`.
        unsafe { self.base().add(offset).cast::<Entry>() }
    }

    /// Read the entry at a [`ValidatedOffset`].
    pub fn read(&self, offset: ValidatedOffset) -> Entry {
        // SAFETY: the `ValidatedOffset` marks the read valid (safety invariant
        // of that type), the pointer is valid (see `entry()`).
        unsafe { self.entry(offset.0).read() }
    }

    /// Overwrite the entry at a [`ValidatedOffset`].
    pub fn write(&self, offset: ValidatedOffset, entry: Entry) {
        self.place(offset.0, entry);
    }

    /// Modify the entry at a [`ValidatedOffset`] in place.
    pub fn update(&self, offset: ValidatedOffset, f: impl FnOnce(&mut Entry)) {
        let mut entry = self.read(offset);
        f(&mut entry);
        self.write(offset, entry);
    }

    /// Write an entry at `offset` and obtain the now valid offset.
    ///
    /// # Panics
    /// This function panics under the same conditions as [`Self::entry()`].
    pub fn place(&self, offset: usize, entry: Entry) -> ValidatedOffset {
        // SAFETY: the pointer is in bounds and aligned (see `entry()`)
        unsafe { self.entry(offset).write(entry) };
        ValidatedOffset(offset)
    }

    /// Treat `offset` as the location of an existing entry.
    ///
    /// Returns `None` if the offset is misaligned or an entry at that position
    /// would not fit into the buffer.
    ///
    /// # Safety
    /// An [`Entry`] must have been written to `offset` before (via
    /// [`Self::place()`]), otherwise reading it is undefined behavior.
    pub unsafe fn assume_entry(&self, offset: usize) -> Option<ValidatedOffset> {
        let fits = offset
            .checked_add(mem::size_of::<Entry>())
            .is_some_and(|end| end <= N);
        (offset % ALIGNMENT == 0 && fits).then_some(ValidatedOffset(offset))
    }

    /// Follow the free-list link of the entry at `offset`.
    pub fn next(&self, offset: ValidatedOffset) -> Option<ValidatedOffset> {
        // links are only ever created from `ValidatedOffset`s (see
        // `Entry::free()`), so they point to written entries as well.
        self.read(offset).link().map(ValidatedOffset)
    }

    /// Obtain the payload memory of the block at a [`ValidatedOffset`].
    ///
    /// The payload starts [`HEADER_SIZE`] bytes after the entry and is `len`
    /// bytes long. The pointer stays valid until the block is handed back to
    /// the allocator, regardless of other blocks being allocated or freed.
    ///
    /// # Panics
    /// This function panics, if the payload would exceed the buffer.
    pub fn memory_of(&self, offset: ValidatedOffset, len: usize) -> NonNull<[u8]> {
        let start = offset.0 + HEADER_SIZE;
        assert!(start + len <= N);

        // SAFETY: the payload is inside of the buffer (see the assert above)
        let memory = unsafe { self.base().add(start) };
        // SAFETY: the pointer is derived from the address of the buffer
        let memory = unsafe { NonNull::new_unchecked(memory) };
        NonNull::slice_from_raw_parts(memory, len)
    }

    /// Translate a pointer into the buffer to the offset from its start.
    ///
    /// Pointers outside of the buffer yield `None`.
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let base = self.base() as usize;
        (ptr as usize)
            .checked_sub(base)
            .filter(|&offset| offset < N)
    }

    /// The address range spanned by the buffer.
    pub fn as_ptr_range(&self) -> Range<*const u8> {
        let start = self.base().cast_const();
        start..start.wrapping_add(N)
    }
}
