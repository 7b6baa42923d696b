use bitflags::bitflags;
use log::warn;

/// Default size of a block, the unit of memory requested from the OS.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;
/// Largest block size accepted in a configuration.
pub const MAX_BLOCK_SIZE: usize = 256 * 1024 * 1024;
/// Default number of bytes tracked by one bitmap bit.
pub const DEFAULT_GRANULARITY: usize = 64;
pub const MIN_GRANULARITY: usize = 16;
pub const MAX_GRANULARITY: usize = 4096;
/// Pools used when `USE_MULTIPLE_POOLS` is set (64/128/256 B by default).
pub const DEFAULT_POOL_COUNT: usize = 3;
pub const MAX_POOL_COUNT: usize = 8;
/// A request moves to a coarser pool once it spans this many of its slots.
pub const DEFAULT_SIZE_CLASS_SLOTS: usize = 16;
/// Fully empty blocks kept per pool to absorb alloc/release churn.
pub const DEFAULT_RETAINED_EMPTY_BLOCKS: usize = 1;

/// `int3` on x86 so stray jumps into unused memory trap.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub const DEFAULT_FILL_PATTERN: u8 = 0xCC;
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub const DEFAULT_FILL_PATTERN: u8 = 0x00;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct JitAllocatorOptions: u32 {
        /// Map every block twice: a read+execute view and a read+write view
        /// of the same pages.
        const USE_DUAL_MAPPING = 0x0000_0001;
        /// Use several pools of increasing granularity instead of one.
        const USE_MULTIPLE_POOLS = 0x0000_0002;
        /// Fill new blocks and released spans with the fill pattern.
        const FILL_UNUSED_MEMORY = 0x0000_0004;
        /// Destroy a block as soon as it becomes empty, and keep no spare
        /// block on soft reset.
        const IMMEDIATE_RELEASE = 0x0000_0008;
        /// Use `JitAllocatorConfig::fill_pattern` instead of the default.
        const CUSTOM_FILL_PATTERN = 0x1000_0000;
    }
}

/// Parameters for `JitAllocator::new`. Zero means "use the default".
///
/// ```
/// use qen_jit::{JitAllocatorConfig, JitAllocatorOptions};
///
/// let config = JitAllocatorConfig::default()
///     .with_options(JitAllocatorOptions::USE_MULTIPLE_POOLS)
///     .with_block_size(1024 * 1024);
/// assert_eq!(config.block_size, 1024 * 1024);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JitAllocatorConfig {
    pub options: JitAllocatorOptions,
    /// Base block size. Must be a power of two between the page size and
    /// [`MAX_BLOCK_SIZE`]. Default: 64 KiB.
    pub block_size: usize,
    /// Bytes per bitmap bit, which is also the natural alignment of every
    /// allocation. Must be a power of two in
    /// `[MIN_GRANULARITY, MAX_GRANULARITY]`. Default: 64.
    pub granularity: usize,
    /// Byte written to unused memory. Only honoured with `CUSTOM_FILL_PATTERN`.
    pub fill_pattern: u8,
    /// Number of pools with `USE_MULTIPLE_POOLS`. Default: 3.
    pub pool_count: usize,
    /// Size-class threshold in slots. Default: 16.
    pub size_class_slots: usize,
    /// Empty blocks a pool keeps instead of releasing. Default: 1.
    /// Ignored with `IMMEDIATE_RELEASE`.
    pub retained_empty_blocks: Option<usize>,
}

impl JitAllocatorConfig {
    #[must_use]
    pub fn with_options(mut self, options: JitAllocatorOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    #[must_use]
    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    /// Set a custom fill pattern; also sets `CUSTOM_FILL_PATTERN`.
    #[must_use]
    pub fn with_fill_pattern(mut self, fill_pattern: u8) -> Self {
        self.fill_pattern = fill_pattern;
        self.options |= JitAllocatorOptions::CUSTOM_FILL_PATTERN;
        self
    }

    #[must_use]
    pub fn with_pool_count(mut self, pool_count: usize) -> Self {
        self.pool_count = pool_count;
        self
    }

    #[must_use]
    pub fn with_size_class_slots(mut self, size_class_slots: usize) -> Self {
        self.size_class_slots = size_class_slots;
        self
    }

    #[must_use]
    pub fn with_retained_empty_blocks(mut self, retained: usize) -> Self {
        self.retained_empty_blocks = Some(retained);
        self
    }

    /// Validate against `page_size`, substituting defaults for invalid values.
    pub fn resolve(&self, page_size: usize) -> ResolvedConfig {
        let block_size = match self.block_size {
            0 => DEFAULT_BLOCK_SIZE.max(page_size),
            size if size.is_power_of_two() && (page_size..=MAX_BLOCK_SIZE).contains(&size) => size,
            size => {
                warn!("jit allocator: invalid block size {size}, using default");
                DEFAULT_BLOCK_SIZE.max(page_size)
            }
        };

        let granularity = match self.granularity {
            0 => DEFAULT_GRANULARITY,
            g if g.is_power_of_two()
                && (MIN_GRANULARITY..=MAX_GRANULARITY).contains(&g)
                && g <= block_size =>
            {
                g
            }
            g => {
                warn!("jit allocator: invalid granularity {g}, using default");
                DEFAULT_GRANULARITY
            }
        };

        let pool_count = if self.options.contains(JitAllocatorOptions::USE_MULTIPLE_POOLS) {
            let requested = match self.pool_count {
                0 => DEFAULT_POOL_COUNT,
                n => n.min(MAX_POOL_COUNT),
            };
            // Coarsest granularity must still fit a block.
            let fitting = (block_size / granularity).ilog2() as usize + 1;
            requested.min(fitting)
        } else {
            1
        };

        let fill_pattern = if self.options.contains(JitAllocatorOptions::CUSTOM_FILL_PATTERN) {
            self.fill_pattern
        } else {
            DEFAULT_FILL_PATTERN
        };

        let retained_empty_blocks = if self.options.contains(JitAllocatorOptions::IMMEDIATE_RELEASE) {
            0
        } else {
            self.retained_empty_blocks.unwrap_or(DEFAULT_RETAINED_EMPTY_BLOCKS)
        };

        ResolvedConfig {
            options: self.options,
            block_size,
            granularity,
            fill_pattern,
            pool_count,
            size_class_slots: match self.size_class_slots {
                0 => DEFAULT_SIZE_CLASS_SLOTS,
                n => n,
            },
            retained_empty_blocks,
        }
    }
}

/// A validated configuration. Immutable for the lifetime of the allocator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub options: JitAllocatorOptions,
    pub block_size: usize,
    pub granularity: usize,
    pub fill_pattern: u8,
    pub pool_count: usize,
    pub size_class_slots: usize,
    pub retained_empty_blocks: usize,
}

impl ResolvedConfig {
    #[inline]
    #[must_use]
    pub fn has_option(&self, option: JitAllocatorOptions) -> bool {
        self.options.contains(option)
    }

    /// Granularity of pool `pool_id`.
    #[inline]
    #[must_use]
    pub fn pool_granularity(&self, pool_id: usize) -> usize {
        self.granularity << pool_id
    }

    /// Pick the pool for a request of `size` bytes: the coarsest pool whose
    /// threshold (`size_class_slots` of its slots) the request reaches.
    #[must_use]
    pub fn pool_for_size(&self, size: usize) -> usize {
        (1..self.pool_count)
            .rev()
            .find(|&id| {
                self.pool_granularity(id)
                    .checked_mul(self.size_class_slots)
                    .is_some_and(|threshold| size >= threshold)
            })
            .unwrap_or(0)
    }

    /// Pattern to write over unused memory, if filling is enabled.
    #[inline]
    #[must_use]
    pub fn fill(&self) -> Option<u8> {
        self.has_option(JitAllocatorOptions::FILL_UNUSED_MEMORY)
            .then_some(self.fill_pattern)
    }
}
