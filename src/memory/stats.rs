//! Allocator statistics.
//!
//! [`JitStatistics`] and [`PoolStatistics`] are snapshots of one allocator,
//! taken under its lock.
//!
//! The process-wide counters below are diagnostic only. All of them use
//! `Relaxed` ordering and are eventually consistent; a snapshot across
//! counters may be transiently inconsistent. Do NOT use these values for
//! allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Snapshot of one allocator's bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JitStatistics {
    /// Blocks currently mapped.
    pub block_count: usize,
    /// Bytes covered by live spans (slot-rounded).
    pub used_size: usize,
    /// Bytes mapped from the OS (sum of block sizes).
    pub reserved_size: usize,
    /// Bytes of bitmap bookkeeping for all blocks.
    pub overhead_size: usize,
}

impl JitStatistics {
    #[inline]
    #[must_use]
    pub fn unused_size(&self) -> usize {
        self.reserved_size - self.used_size
    }

    #[must_use]
    pub fn used_size_as_percent(&self) -> f64 {
        Self::percent(self.used_size, self.reserved_size)
    }

    #[must_use]
    pub fn unused_size_as_percent(&self) -> f64 {
        Self::percent(self.unused_size(), self.reserved_size)
    }

    #[must_use]
    pub fn overhead_size_as_percent(&self) -> f64 {
        Self::percent(self.overhead_size, self.reserved_size)
    }

    #[allow(clippy::cast_precision_loss)]
    fn percent(part: usize, whole: usize) -> f64 {
        part as f64 / (whole as f64 + 1e-16) * 100.0
    }
}

/// Per-pool slice of [`JitStatistics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStatistics {
    pub granularity: usize,
    pub block_count: usize,
    pub used_size: usize,
    pub reserved_size: usize,
}

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Bytes of executable memory mapped by all allocators in the process.
crate::sync::static_atomic! {
    pub static TOTAL_MAPPED: Counter = Counter::new();
}
// Blocks alive across all allocators in the process.
crate::sync::static_atomic! {
    pub static TOTAL_BLOCKS: Counter = Counter::new();
}

/// Bytes of executable memory currently mapped by every allocator in the process.
#[must_use]
pub fn total_mapped() -> usize {
    TOTAL_MAPPED.get()
}

/// Blocks currently alive across every allocator in the process.
#[must_use]
pub fn total_blocks() -> usize {
    TOTAL_BLOCKS.get()
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_negative() {
        let counter = Counter::new();
        counter.add(5);
        counter.sub(8);
        assert_eq!(counter.get(), 0);
        counter.add(10);
        assert_eq!(counter.get(), 7);
    }

    #[test]
    fn test_statistics_percentages() {
        let stats = JitStatistics {
            block_count: 1,
            used_size: 128,
            reserved_size: 1024,
            overhead_size: 32,
        };
        assert_eq!(stats.unused_size(), 896);
        assert!((stats.used_size_as_percent() - 12.5).abs() < 1e-9);
        assert!((stats.unused_size_as_percent() - 87.5).abs() < 1e-9);
        assert!((stats.overhead_size_as_percent() - 3.125).abs() < 1e-9);
        assert_eq!(JitStatistics::default().used_size_as_percent(), 0.0);
    }
}
