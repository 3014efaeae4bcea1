use super::block_size;

use thiserror::Error;

/// The maximum number of size classes a [`SizeClasses`]-table can hold.
pub const MAX_SIZE_CLASSES: usize = 16;

/// The table used, if no table is configured before the first allocation.
pub const DEFAULT_SIZE_CLASSES: [usize; 10] = [100, 150, 200, 250, 300, 350, 400, 450, 500, 1000];

/// An error occurred when configuring the size classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The size classes were already configured (explicitly or by the first
    /// allocation). The first configuration stays in effect.
    #[error("the size classes are already configured")]
    AlreadyConfigured,
    /// The table does not contain a single size class.
    #[error("the size-class table is empty")]
    Empty,
    /// The table contains more classes than supported.
    #[error("too many size classes: {count} (at most {max} are supported)")]
    TooManyClasses { count: usize, max: usize },
    /// A size class of zero bytes was requested.
    #[error("size class #{index} is zero")]
    ZeroSized { index: usize },
    /// The table is not strictly ascending, which would break the best-fit
    /// lookup.
    #[error("size class #{index} is not larger than its predecessor")]
    NotAscending { index: usize },
    /// The block of a size class (including its header) is not representable.
    #[error("size class #{index} is too large")]
    TooLarge { index: usize },
}

/// An ascending table of admissible block sizes.
///
/// A request is served by the smallest class, that is at least as large as the
/// request ("best-fit by class"). Requests larger than the largest class are
/// rejected. The table is validated on construction, so every instance is
/// non-empty and strictly ascending, except for [`SizeClasses::EMPTY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClasses {
    sizes: [usize; MAX_SIZE_CLASSES],
    len: usize,
}
impl SizeClasses {
    /// The placeholder for "not configured yet".
    pub const EMPTY: Self = Self {
        sizes: [0; MAX_SIZE_CLASSES],
        len: 0,
    };

    /// Create a size-class table usable in `const`-contexts.
    ///
    /// # Panics
    /// This function panics, if the table is invalid (see [`Self::try_new()`]).
    /// In a `const`/`static` initializer this is a compile-time error.
    pub const fn new(sizes: &[usize]) -> Self {
        match Self::try_new(sizes) {
            Ok(classes) => classes,
            Err(_) => panic!("invalid size-class table"),
        }
    }

    /// Validate and create a size-class table.
    ///
    /// The table must be non-empty, contain at most [`MAX_SIZE_CLASSES`]
    /// entries and be strictly ascending. Zero-sized classes are rejected.
    pub const fn try_new(sizes: &[usize]) -> Result<Self, ConfigError> {
        if sizes.is_empty() {
            return Err(ConfigError::Empty);
        }
        if sizes.len() > MAX_SIZE_CLASSES {
            return Err(ConfigError::TooManyClasses {
                count: sizes.len(),
                max: MAX_SIZE_CLASSES,
            });
        }

        let mut table = [0; MAX_SIZE_CLASSES];
        let mut index = 0;
        while index < sizes.len() {
            let size = sizes[index];
            if size == 0 {
                return Err(ConfigError::ZeroSized { index });
            }
            if index > 0 && size <= sizes[index - 1] {
                return Err(ConfigError::NotAscending { index });
            }
            if block_size(size).is_none() {
                return Err(ConfigError::TooLarge { index });
            }
            table[index] = size;
            index += 1;
        }

        Ok(Self {
            sizes: table,
            len: sizes.len(),
        })
    }

    /// The number of size classes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Query, whether this is the [`SizeClasses::EMPTY`] placeholder.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The class sizes in ascending order.
    pub fn as_slice(&self) -> &[usize] {
        &self.sizes[..self.len]
    }

    /// Look up the index of the smallest class fitting `size` bytes.
    pub fn class_of(&self, size: usize) -> Option<usize> {
        self.as_slice().iter().position(|&class| class >= size)
    }
}
impl Default for SizeClasses {
    fn default() -> Self {
        Self::new(&DEFAULT_SIZE_CLASSES)
    }
}
impl TryFrom<&[usize]> for SizeClasses {
    type Error = ConfigError;

    fn try_from(sizes: &[usize]) -> Result<Self, Self::Error> {
        Self::try_new(sizes)
    }
}
