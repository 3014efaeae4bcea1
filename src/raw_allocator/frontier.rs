/// The boundary between carved and pristine arena space.
///
/// The frontier only ever moves forward: blocks carved from it are recycled
/// through free lists, never given back to the frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frontier(usize);
impl Frontier {
    /// Create a frontier at the very start of the arena.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Move the frontier to `offset`, which is used during initialization.
    pub fn reset(&mut self, offset: usize) {
        self.0 = offset;
    }

    /// The current position, i.e. the offset of the next block to be carved.
    pub const fn position(&self) -> usize {
        self.0
    }

    /// Carve a block of `size` bytes, if it fits below `limit`.
    ///
    /// On success the start offset of the carved block is returned and the
    /// frontier advances past the block. On failure nothing is modified.
    pub fn carve(&mut self, size: usize, limit: usize) -> Option<usize> {
        let start = self.0;
        let end = start.checked_add(size).filter(|&end| end <= limit)?;
        self.0 = end;
        Some(start)
    }
}
