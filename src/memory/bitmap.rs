//! Occupancy tracking for one block.
//!
//! Two parallel bitsets cover the block's slots:
//!
//! ```text
//!   slot:  0 1 2 3 4 5 6 7
//!   used:  1 1 1 0 1 0 0 1
//!   stop:  0 0 1 0 1 0 0 1
//!          [ A ]   B     C
//! ```
//!
//! `used` marks occupied slots and `stop` marks the last slot of each span,
//! so the length of a span is recovered by walking forward from its first
//! slot. Nothing is ever stored inside the executable memory itself.

use fixedbitset::FixedBitSet;
use log::error;

/// Why a span operation was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SpanError {
    /// The slot does not start a live span (double release, interior or
    /// foreign pointer).
    NotAllocated,
    /// The requested length is zero or longer than the span.
    BadLength,
}

/// Abort the current operation: the bitmaps no longer describe the block.
/// Panicking while the allocator lock is held poisons it, so no caller can
/// keep using a corrupted map.
#[cold]
#[track_caller]
pub(crate) fn consistency_violation(msg: std::fmt::Arguments<'_>) -> ! {
    error!("jit allocator: internal consistency violation: {msg}");
    panic!("internal consistency violation: {msg}");
}

pub(crate) struct BitmapPair {
    used: FixedBitSet,
    stop: FixedBitSet,
    free_slots: usize,
}

impl BitmapPair {
    pub fn new(slot_count: usize) -> Self {
        Self {
            used: FixedBitSet::with_capacity(slot_count),
            stop: FixedBitSet::with_capacity(slot_count),
            free_slots: slot_count,
        }
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.used.len()
    }

    #[inline]
    pub fn free_slots(&self) -> usize {
        self.free_slots
    }

    #[inline]
    pub fn used_slots(&self) -> usize {
        self.slot_count() - self.free_slots
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.free_slots == self.slot_count()
    }

    /// Bytes of bookkeeping held by both bitsets.
    pub fn overhead_bytes(&self) -> usize {
        std::mem::size_of_val(self.used.as_slice()) + std::mem::size_of_val(self.stop.as_slice())
    }

    /// Occupy `[start, start + count)`. The range must be entirely free.
    pub fn mark_span(&mut self, start: usize, count: usize) {
        let end = start + count;
        if count == 0 || end > self.slot_count() || self.used.count_ones(start..end) != 0 {
            consistency_violation(format_args!(
                "mark_span({start}, {count}) over occupied or out-of-range slots (slot_count={})",
                self.slot_count()
            ));
        }
        self.used.insert_range(start..end);
        self.stop.insert(end - 1);
        self.free_slots -= count;
    }

    /// Length of the span starting at `start`, found by walking to its stop bit.
    pub fn span_len(&self, start: usize) -> Result<usize, SpanError> {
        if start >= self.slot_count() || !self.used.contains(start) {
            return Err(SpanError::NotAllocated);
        }
        // The previous slot belongs to another span only if it ends there.
        if start > 0 && self.used.contains(start - 1) && !self.stop.contains(start - 1) {
            return Err(SpanError::NotAllocated);
        }

        let mut slot = start;
        loop {
            if self.stop.contains(slot) {
                return Ok(slot - start + 1);
            }
            slot += 1;
            if slot >= self.slot_count() || !self.used.contains(slot) {
                consistency_violation(format_args!(
                    "span at slot {start} has no stop bit before slot {slot}"
                ));
            }
        }
    }

    /// Free the span starting at `start`; returns its length in slots.
    pub fn release_span(&mut self, start: usize) -> Result<usize, SpanError> {
        let len = self.span_len(start)?;
        self.used.remove_range(start..start + len);
        self.stop.set(start + len - 1, false);
        self.free_slots += len;
        Ok(len)
    }

    /// Cut the span starting at `start` down to `new_len` slots; returns the
    /// number of slots freed from its tail.
    pub fn shrink_span(&mut self, start: usize, new_len: usize) -> Result<usize, SpanError> {
        let len = self.span_len(start)?;
        if new_len == 0 || new_len > len {
            return Err(SpanError::BadLength);
        }
        if new_len == len {
            return Ok(0);
        }
        self.stop.set(start + len - 1, false);
        self.stop.insert(start + new_len - 1);
        self.used.remove_range(start + new_len..start + len);
        let freed = len - new_len;
        self.free_slots += freed;
        Ok(freed)
    }

    /// First-fit search for `count` consecutive free slots.
    ///
    /// Works a word at a time: fully occupied words are skipped and fully
    /// free words extend the current run in one step. Only mixed words are
    /// inspected bit by bit.
    pub fn find_free_span(&self, count: usize) -> Option<usize> {
        if count == 0 || count > self.free_slots {
            return None;
        }

        let len = self.slot_count();
        let words = self.used.as_slice();
        let Some(first) = words.first() else {
            return None;
        };
        let word_bits = std::mem::size_of_val(first) * 8;

        let mut run_start = 0;
        let mut run_len = 0;
        for (index, &word) in words.iter().enumerate() {
            let base = index * word_bits;
            if base >= len {
                break;
            }
            if word == !0 {
                run_len = 0;
                continue;
            }
            if word == 0 && base + word_bits <= len {
                if run_len == 0 {
                    run_start = base;
                }
                run_len += word_bits;
                if run_len >= count {
                    return Some(run_start);
                }
                continue;
            }

            let end = (base + word_bits).min(len);
            for slot in base..end {
                if (word >> (slot - base)) & 1 == 0 {
                    if run_len == 0 {
                        run_start = slot;
                    }
                    run_len += 1;
                    if run_len >= count {
                        return Some(run_start);
                    }
                } else {
                    run_len = 0;
                }
            }
        }
        None
    }

    /// Forget every span.
    pub fn clear(&mut self) {
        self.used.clear();
        self.stop.clear();
        self.free_slots = self.slot_count();
    }
}
