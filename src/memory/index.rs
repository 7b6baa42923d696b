use super::bitmap::consistency_violation;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct IndexEntry {
    end: usize,
    pool_id: usize,
}

/// Maps executable addresses to the block that owns them, across all pools.
///
/// Keyed by block start; a lookup takes the closest start at or below the
/// address and checks it against that block's end. The index does not own
/// blocks, it only records where they are.
#[derive(Default)]
pub(crate) struct BlockIndex {
    ranges: BTreeMap<usize, IndexEntry>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(any(test, debug_assertions))]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Record `[start, end)` as owned by a block of `pool_id`. Blocks never
    /// overlap; an overlapping range means the bookkeeping is corrupt.
    pub fn insert(&mut self, start: usize, end: usize, pool_id: usize) {
        debug_assert!(start < end);
        let below = self.ranges.range(..=start).next_back();
        let above = self.ranges.range(start..).next();
        let overlaps_below = below.is_some_and(|(_, e)| e.end > start);
        let overlaps_above = above.is_some_and(|(&s, _)| s < end);
        if overlaps_below || overlaps_above {
            consistency_violation(format_args!(
                "block [{start:#x}, {end:#x}) overlaps an indexed block"
            ));
        }
        self.ranges.insert(start, IndexEntry { end, pool_id });
    }

    pub fn remove(&mut self, start: usize) {
        if self.ranges.remove(&start).is_none() {
            consistency_violation(format_args!("block {start:#x} missing from index"));
        }
    }

    /// `(block start, pool id)` of the block containing `addr`.
    pub fn lookup(&self, addr: usize) -> Option<(usize, usize)> {
        let (&start, entry) = self.ranges.range(..=addr).next_back()?;
        (addr < entry.end).then_some((start, entry.pool_id))
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}
