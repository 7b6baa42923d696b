use super::bitmap::BitmapPair;
use super::mapping::{DualMapping, ExecPtr, WritePtr};
use super::stats;
use super::vm::{VmError, VmOps};
use log::{debug, warn};
use std::marker::PhantomData;

/// One OS mapping carved into `granularity`-sized slots.
///
/// The block owns its mapping and gives it back to `V` on drop.
pub(crate) struct JitBlock<V: VmOps> {
    mapping: DualMapping,
    size: usize,
    granularity: usize,
    pool_id: usize,
    pub(crate) bitmaps: BitmapPair,
    _vm: PhantomData<fn() -> V>,
}

// Safety: the block exclusively owns its mapping; the raw views inside are
// only dereferenced by whoever holds the block (behind the allocator lock).
unsafe impl<V: VmOps> Send for JitBlock<V> {}

impl<V: VmOps> JitBlock<V> {
    /// Map a new block of `size` bytes for pool `pool_id`.
    ///
    /// `size` must be a multiple of both the page size and `granularity`.
    /// With `fill`, the whole block is overwritten with the pattern before it
    /// is handed out.
    pub fn new(
        pool_id: usize,
        size: usize,
        granularity: usize,
        dual_mapping: bool,
        fill: Option<u8>,
    ) -> Result<Self, VmError> {
        debug_assert!(granularity.is_power_of_two());
        debug_assert!(size.is_multiple_of(granularity));

        // Safety: callers pass a page-multiple size; the mapping is owned by
        // the block and released exactly once in Drop.
        let mapping = unsafe { V::map_executable(size, dual_mapping)? };

        if let Some(pattern) = fill {
            // Safety: the mapping is `size` bytes long and not yet shared.
            unsafe { mapping.rw().fill(0, size, pattern) };
        }

        stats::TOTAL_MAPPED.add(size);
        stats::TOTAL_BLOCKS.add(1);
        debug!(
            "jit block created: pool={pool_id} rx={:#x} rw={:#x} size={size} granularity={granularity}",
            mapping.rx().addr(),
            mapping.rw().addr(),
        );

        Ok(Self {
            mapping,
            size,
            granularity,
            pool_id,
            bitmaps: BitmapPair::new(size / granularity),
            _vm: PhantomData,
        })
    }

    #[inline]
    pub fn pool_id(&self) -> usize {
        self.pool_id
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Executable start address; the block's identity in the index.
    #[inline]
    pub fn start(&self) -> usize {
        self.mapping.rx().addr()
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    #[inline]
    pub fn contains_address(&self, addr: usize) -> bool {
        (self.start()..self.end()).contains(&addr)
    }

    /// Slot that starts at executable address `addr`, or `None` when `addr`
    /// lies outside the block or not on a slot boundary.
    pub fn slot_index_of(&self, addr: usize) -> Option<usize> {
        if !self.contains_address(addr) {
            return None;
        }
        let offset = addr - self.start();
        offset
            .is_multiple_of(self.granularity)
            .then(|| offset / self.granularity)
    }

    /// Both views of the first byte of `slot`.
    pub fn slot_views(&self, slot: usize) -> (ExecPtr, WritePtr) {
        debug_assert!(slot < self.bitmaps.slot_count());
        let offset = slot * self.granularity;
        // Safety: slot is within the block, so the offset stays in the mapping.
        unsafe { (self.mapping.rx().byte_add(offset), self.mapping.rw().byte_add(offset)) }
    }

    /// Overwrite `count` slots from `start` with `pattern`.
    pub fn fill_slots(&self, start: usize, count: usize, pattern: u8) {
        debug_assert!(start + count <= self.bitmaps.slot_count());
        // Safety: the range lies inside the mapping and is not handed out.
        unsafe {
            self.mapping
                .rw()
                .fill(start * self.granularity, count * self.granularity, pattern);
        }
    }

    /// Forget all spans, optionally refilling the whole block.
    pub fn wipe(&mut self, fill: Option<u8>) {
        self.bitmaps.clear();
        if let Some(pattern) = fill {
            self.fill_slots(0, self.bitmaps.slot_count(), pattern);
        }
    }

    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.bitmaps.used_slots() * self.granularity
    }

    #[inline]
    pub fn overhead_bytes(&self) -> usize {
        self.bitmaps.overhead_bytes()
    }
}

impl<V: VmOps> Drop for JitBlock<V> {
    fn drop(&mut self) {
        debug!(
            "jit block destroyed: pool={} rx={:#x} size={}",
            self.pool_id,
            self.start(),
            self.size
        );
        // Safety: the mapping came from map_executable with this size and no
        // span of it is live once the block is dropped.
        if let Err(e) = unsafe { V::unmap_executable(self.mapping, self.size) } {
            warn!("jit block at {:#x}: {e}", self.start());
        }
        stats::TOTAL_MAPPED.sub(self.size);
        stats::TOTAL_BLOCKS.sub(1);
    }
}
