use super::buffer::ValidatedOffset;

/// Link value of a free block at the end of its list.
const NIL: usize = usize::MAX;
/// Link value of a block that is currently handed out to a caller.
const USED: usize = usize::MAX - 1;

/// The header in front of every block inside the arena.
///
/// An entry consists of two machine words:
/// - the `tag`, whose meaning depends on the allocator variant: the pool
///   allocator stores the index of the owning size class, the coalescing
///   allocator stores the total size of the block (header included).
/// - the `link`, which is the offset of the next free block while the block is
///   free or a marker while it is in use. The marker is what makes double frees
///   detectable.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    tag: usize,
    link: usize,
}
impl Entry {
    /// Create an entry for a block handed out to a caller.
    pub const fn used(tag: usize) -> Self {
        Self { tag, link: USED }
    }

    /// Create an entry for a free block, that is linked to `next`.
    pub const fn free(tag: usize, next: Option<ValidatedOffset>) -> Self {
        let link = match next {
            Some(next) => next.get(),
            None => NIL,
        };
        Self { tag, link }
    }

    /// The pool index or block size, depending on the allocator variant.
    pub const fn tag(&self) -> usize {
        self.tag
    }

    /// Replace the tag, e.g. after merging two blocks.
    pub fn set_tag(&mut self, tag: usize) {
        self.tag = tag;
    }

    /// Query, whether the block is currently owned by a caller.
    pub const fn is_used(&self) -> bool {
        self.link == USED
    }

    /// Link this (free) entry to another free block.
    pub fn set_next(&mut self, next: Option<ValidatedOffset>) {
        *self = Self::free(self.tag, next);
    }

    /// The raw offset of the next free block, if any.
    pub(super) const fn link(&self) -> Option<usize> {
        match self.link {
            NIL | USED => None,
            offset => Some(offset),
        }
    }
}
