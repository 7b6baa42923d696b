use super::bitmap::{SpanError, consistency_violation};
use super::block::JitBlock;
use super::stats::PoolStatistics;
use super::vm::VmOps;
use std::collections::BTreeMap;

/// A span placed by [`JitPool::try_allocate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Placement {
    pub block: usize,
    pub slot: usize,
    pub slots: usize,
}

/// Result of [`JitPool::release`].
pub(crate) struct Released<V: VmOps> {
    pub slots: usize,
    /// Block that became empty and exceeds the retention limit. The caller
    /// unregisters it from the index and drops it.
    pub evicted: Option<JitBlock<V>>,
}

/// Blocks sharing one granularity.
///
/// Blocks are keyed by executable start address. The cursor is an address
/// too: a scan visits blocks at or above it first and then wraps around, so
/// successive allocations rotate through the pool instead of hammering the
/// first block.
pub(crate) struct JitPool<V: VmOps> {
    id: usize,
    granularity: usize,
    blocks: BTreeMap<usize, JitBlock<V>>,
    cursor: usize,
    free_slots: usize,
    total_slots: usize,
    empty_blocks: usize,
    retained_limit: usize,
}

impl<V: VmOps> JitPool<V> {
    pub fn new(id: usize, granularity: usize, retained_limit: usize) -> Self {
        Self {
            id,
            granularity,
            blocks: BTreeMap::new(),
            cursor: 0,
            free_slots: 0,
            total_slots: 0,
            empty_blocks: 0,
            retained_limit,
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    #[cfg(test)]
    pub fn free_slots(&self) -> usize {
        self.free_slots
    }

    #[cfg(test)]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[cfg(test)]
    pub fn empty_blocks(&self) -> usize {
        self.empty_blocks
    }

    /// Slots needed for `size` bytes, or `None` on overflow.
    #[inline]
    pub fn slots_for(&self, size: usize) -> Option<usize> {
        size.checked_next_multiple_of(self.granularity)
            .map(|rounded| rounded / self.granularity)
    }

    /// Size of a new block able to hold `size` bytes: at least `block_size`,
    /// rounded up to a whole number of `block_size` units.
    pub fn new_block_size(block_size: usize, size: usize) -> Option<usize> {
        size.max(block_size).checked_next_multiple_of(block_size)
    }

    pub fn block(&self, start: usize) -> Option<&JitBlock<V>> {
        self.blocks.get(&start)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &JitBlock<V>> {
        self.blocks.values()
    }

    /// Find and occupy `slots` consecutive slots in an existing block.
    pub fn try_allocate(&mut self, slots: usize) -> Option<Placement> {
        if slots > self.free_slots {
            return None;
        }

        let cursor = self.cursor;
        let (block, slot) = self
            .blocks
            .range(cursor..)
            .chain(self.blocks.range(..cursor))
            .filter(|(_, block)| block.bitmaps.free_slots() >= slots)
            .find_map(|(&start, block)| {
                block.bitmaps.find_free_span(slots).map(|slot| (start, slot))
            })?;

        self.occupy(block, slot, slots);
        Some(Placement { block, slot, slots })
    }

    /// Add a freshly mapped block and place `slots` at its start.
    pub fn insert_and_allocate(&mut self, block: JitBlock<V>, slots: usize) -> Placement {
        debug_assert_eq!(block.pool_id(), self.id);
        debug_assert!(block.bitmaps.is_empty());
        let start = block.start();
        let slot_count = block.bitmaps.slot_count();
        self.total_slots += slot_count;
        self.free_slots += slot_count;
        self.empty_blocks += 1;
        self.blocks.insert(start, block);

        self.occupy(start, 0, slots);
        Placement {
            block: start,
            slot: 0,
            slots,
        }
    }

    fn occupy(&mut self, start: usize, slot: usize, slots: usize) {
        let Some(block) = self.blocks.get_mut(&start) else {
            consistency_violation(format_args!("pool {} has no block {start:#x}", self.id));
        };
        if block.bitmaps.is_empty() {
            self.empty_blocks -= 1;
        }
        block.bitmaps.mark_span(slot, slots);
        self.free_slots -= slots;
        self.cursor = block.end();
    }

    /// Free the span at `slot` of block `start`, filling it first when
    /// `fill` is set. Applies the retention policy if the block empties.
    pub fn release(
        &mut self,
        start: usize,
        slot: usize,
        fill: Option<u8>,
    ) -> Result<Released<V>, SpanError> {
        let block = self.blocks.get_mut(&start).ok_or(SpanError::NotAllocated)?;
        let len = block.bitmaps.span_len(slot)?;
        if let Some(pattern) = fill {
            block.fill_slots(slot, len, pattern);
        }
        block.bitmaps.release_span(slot)?;
        self.free_slots += len;

        let mut evicted = None;
        if block.bitmaps.is_empty() {
            if self.empty_blocks < self.retained_limit {
                self.empty_blocks += 1;
            } else {
                evicted = self.remove_block(start);
            }
        }
        Ok(Released {
            slots: len,
            evicted,
        })
    }

    /// Cut the span at `slot` of block `start` down to `new_slots`; returns
    /// the slots given back. Never grows or moves a span.
    pub fn shrink(
        &mut self,
        start: usize,
        slot: usize,
        new_slots: usize,
        fill: Option<u8>,
    ) -> Result<usize, SpanError> {
        let block = self.blocks.get_mut(&start).ok_or(SpanError::NotAllocated)?;
        let freed = block.bitmaps.shrink_span(slot, new_slots)?;
        if freed > 0 {
            if let Some(pattern) = fill {
                block.fill_slots(slot + new_slots, freed, pattern);
            }
        }
        self.free_slots += freed;
        Ok(freed)
    }

    fn remove_block(&mut self, start: usize) -> Option<JitBlock<V>> {
        let block = self.blocks.remove(&start)?;
        let slot_count = block.bitmaps.slot_count();
        self.total_slots -= slot_count;
        self.free_slots -= block.bitmaps.free_slots();
        Some(block)
    }

    /// Drop every block; with `keep_spare`, keep one block wiped clean.
    /// Returns the blocks that were removed so the caller can account for them.
    pub fn reset(&mut self, keep_spare: bool, fill: Option<u8>) -> Vec<JitBlock<V>> {
        let mut removed: Vec<JitBlock<V>> = std::mem::take(&mut self.blocks).into_values().collect();
        self.cursor = 0;
        self.free_slots = 0;
        self.total_slots = 0;
        self.empty_blocks = 0;

        if keep_spare {
            // Keep the smallest block; oversized ones go back to the OS.
            if let Some(pos) = removed
                .iter()
                .enumerate()
                .min_by_key(|(_, block)| block.size())
                .map(|(pos, _)| pos)
            {
                let mut spare = removed.swap_remove(pos);
                spare.wipe(fill);
                let slot_count = spare.bitmaps.slot_count();
                self.total_slots = slot_count;
                self.free_slots = slot_count;
                self.empty_blocks = 1;
                self.blocks.insert(spare.start(), spare);
            }
        }
        removed
    }

    pub fn statistics(&self) -> PoolStatistics {
        PoolStatistics {
            granularity: self.granularity,
            block_count: self.blocks.len(),
            used_size: (self.total_slots - self.free_slots) * self.granularity,
            reserved_size: self.blocks.values().map(JitBlock::size).sum(),
        }
    }

    /// Recount aggregates from block state and compare with the cached ones.
    #[cfg(any(test, debug_assertions))]
    pub fn check_invariants(&self) {
        let free: usize = self.blocks.values().map(|b| b.bitmaps.free_slots()).sum();
        let total: usize = self.blocks.values().map(|b| b.bitmaps.slot_count()).sum();
        let empty = self.blocks.values().filter(|b| b.bitmaps.is_empty()).count();
        assert_eq!(free, self.free_slots, "pool {} free slot aggregate", self.id);
        assert_eq!(total, self.total_slots, "pool {} total slot aggregate", self.id);
        assert_eq!(empty, self.empty_blocks, "pool {} empty block count", self.id);
    }
}
