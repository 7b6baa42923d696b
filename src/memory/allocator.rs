//! The public allocator.
//!
//! [`JitAllocator`] owns a fixed set of pools, one per granularity, plus an
//! address index over every block of every pool. All mutable state lives
//! behind one lock; every public operation takes it once, so operations are
//! linearizable. The only other thing an operation may wait on is the OS
//! mapping call issued by [`VmOps`].
//!
//! Statistics are maintained incrementally on every mutation. Debug builds
//! recompute them from block state after each operation and compare.

use super::bitmap::{SpanError, consistency_violation};
use super::block::JitBlock;
use super::config::{JitAllocatorConfig, JitAllocatorOptions, ResolvedConfig};
use super::error::JitError;
use super::index::BlockIndex;
use super::mapping::{ExecPtr, JitSpan};
use super::pool::JitPool;
use super::stats::{JitStatistics, PoolStatistics};
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::{Mutex, MutexGuard};
use log::{debug, trace};

/// What [`JitAllocator::reset`] leaves behind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Release every allocation. Each pool may keep one wiped block unless
    /// `IMMEDIATE_RELEASE` is set (or retention is disabled).
    #[default]
    Soft,
    /// Release every allocation and every block, then refuse further
    /// requests with [`JitError::Shutdown`].
    Hard,
}

struct AllocatorState<V: VmOps> {
    /// Pools are created on first use.
    pools: Vec<Option<JitPool<V>>>,
    index: BlockIndex,
    stats: JitStatistics,
    shut_down: bool,
}

/// Executable memory allocator.
///
/// ```no_run
/// use qen_jit::{JitAllocator, JitAllocatorConfig};
///
/// let jit = JitAllocator::new(&JitAllocatorConfig::default());
/// let span = jit.allocate(3).unwrap();
/// // Safety: the span is live until it is released below.
/// unsafe { span.write(&[0xB8, 0x2A, 0x00]) };
/// jit.release(span.rx()).unwrap();
/// ```
pub struct JitAllocator<V: VmOps = PlatformVmOps> {
    config: ResolvedConfig,
    state: Mutex<AllocatorState<V>>,
}

impl JitAllocator<PlatformVmOps> {
    /// Create an allocator backed by the platform's virtual memory.
    ///
    /// Invalid configuration values fall back to their defaults (with a
    /// warning); see [`JitAllocatorConfig::resolve`].
    pub fn new(config: &JitAllocatorConfig) -> Self {
        Self::with_config(config)
    }
}

impl Default for JitAllocator<PlatformVmOps> {
    fn default() -> Self {
        Self::new(&JitAllocatorConfig::default())
    }
}

impl<V: VmOps> JitAllocator<V> {
    /// Create an allocator backed by `V`.
    pub fn with_config(config: &JitAllocatorConfig) -> Self {
        let config = config.resolve(V::page_size());
        debug!(
            "jit allocator created: options={:?} block_size={} granularity={} pools={}",
            config.options, config.block_size, config.granularity, config.pool_count
        );
        let pools = (0..config.pool_count).map(|_| None).collect();
        Self {
            config,
            state: Mutex::new(AllocatorState {
                pools,
                index: BlockIndex::new(),
                stats: JitStatistics::default(),
                shut_down: false,
            }),
        }
    }

    #[inline]
    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    #[inline]
    pub fn options(&self) -> JitAllocatorOptions {
        self.config.options
    }

    #[inline]
    pub fn has_option(&self, option: JitAllocatorOptions) -> bool {
        self.config.has_option(option)
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    #[inline]
    pub fn granularity(&self) -> usize {
        self.config.granularity
    }

    #[inline]
    pub fn fill_pattern(&self) -> u8 {
        self.config.fill_pattern
    }

    #[inline]
    pub fn pool_count(&self) -> usize {
        self.config.pool_count
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState<V>> {
        self.state
            .lock()
            .expect("jit allocator state poisoned by an internal consistency violation")
    }

    /// Allocate at least `size` bytes of executable memory.
    ///
    /// The span is aligned to its pool's granularity and its size is
    /// `size` rounded up to whole slots. When no existing block has room a
    /// new block is mapped; if that fails nothing changes and the OS error
    /// is returned inside [`JitError::OutOfMemory`].
    pub fn allocate(&self, size: usize) -> Result<JitSpan, JitError> {
        if size == 0 {
            return Err(JitError::InvalidArgument("allocation size must be non-zero"));
        }

        let pool_id = self.config.pool_for_size(size);
        let granularity = self.config.pool_granularity(pool_id);
        let rounded = size
            .checked_next_multiple_of(granularity)
            .ok_or(JitError::InvalidArgument("allocation size overflows"))?;
        let slots = rounded / granularity;

        let mut guard = self.lock();
        let state = &mut *guard;
        if state.shut_down {
            return Err(JitError::Shutdown);
        }

        let retained = self.config.retained_empty_blocks;
        let pool = state.pools[pool_id]
            .get_or_insert_with(|| JitPool::new(pool_id, granularity, retained));

        let placement = match pool.try_allocate(slots) {
            Some(placement) => placement,
            None => {
                let block_size = JitPool::<V>::new_block_size(self.config.block_size, rounded)
                    .ok_or(JitError::InvalidArgument("allocation size overflows"))?;
                let block = JitBlock::<V>::new(
                    pool_id,
                    block_size,
                    granularity,
                    self.has_option(JitAllocatorOptions::USE_DUAL_MAPPING),
                    self.config.fill(),
                )
                .map_err(|source| JitError::OutOfMemory { size, source })?;

                state.index.insert(block.start(), block.end(), pool_id);
                state.stats.block_count += 1;
                state.stats.reserved_size += block.size();
                state.stats.overhead_size += block.overhead_bytes();
                pool.insert_and_allocate(block, slots)
            }
        };
        state.stats.used_size += rounded;

        let Some(block) = pool.block(placement.block) else {
            consistency_violation(format_args!(
                "placed span in unknown block {:#x}",
                placement.block
            ));
        };
        let (rx, rw) = block.slot_views(placement.slot);
        trace!("jit allocate: size={size} pool={pool_id} rx={:#x} len={rounded}", rx.addr());

        #[cfg(debug_assertions)]
        state.check();
        Ok(JitSpan::new(rx, rw, rounded))
    }

    /// Release the allocation starting at `rx`.
    ///
    /// Freed memory is overwritten with the fill pattern when
    /// `FILL_UNUSED_MEMORY` is set. A block that becomes empty is returned
    /// to the OS unless its pool keeps it as a spare.
    pub fn release(&self, rx: ExecPtr) -> Result<(), JitError> {
        let addr = rx.addr();
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.shut_down {
            return Err(JitError::Shutdown);
        }

        let (start, pool_id) = state.index.lookup(addr).ok_or(JitError::InvalidPointer(addr))?;
        let pool = pool_mut(&mut state.pools, pool_id);
        let slot = pool
            .block(start)
            .and_then(|block| block.slot_index_of(addr))
            .ok_or(JitError::InvalidPointer(addr))?;

        let released = pool
            .release(start, slot, self.config.fill())
            .map_err(|_| JitError::InvalidPointer(addr))?;
        let freed = released.slots * pool.granularity();
        state.stats.used_size -= freed;
        trace!("jit release: rx={addr:#x} pool={pool_id} len={freed}");

        if let Some(block) = &released.evicted {
            state.index.remove(block.start());
            state.stats.block_count -= 1;
            state.stats.reserved_size -= block.size();
            state.stats.overhead_size -= block.overhead_bytes();
        }

        #[cfg(debug_assertions)]
        state.check();

        // Unmap outside the lock.
        drop(guard);
        drop(released);
        Ok(())
    }

    /// Shrink the allocation starting at `rx` to `new_size` bytes.
    ///
    /// The span keeps its address; the tail beyond the rounded new size is
    /// given back. A `new_size` equal to the current size is a no-op.
    pub fn shrink(&self, rx: ExecPtr, new_size: usize) -> Result<JitSpan, JitError> {
        if new_size == 0 {
            return Err(JitError::InvalidArgument("shrink size must be non-zero"));
        }

        let addr = rx.addr();
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.shut_down {
            return Err(JitError::Shutdown);
        }

        let (start, pool_id) = state.index.lookup(addr).ok_or(JitError::InvalidPointer(addr))?;
        let pool = pool_mut(&mut state.pools, pool_id);
        let slot = pool
            .block(start)
            .and_then(|block| block.slot_index_of(addr))
            .ok_or(JitError::InvalidPointer(addr))?;
        let new_slots = pool
            .slots_for(new_size)
            .ok_or(JitError::InvalidArgument("shrink size overflows"))?;

        let freed = pool
            .shrink(start, slot, new_slots, self.config.fill())
            .map_err(|e| match e {
                SpanError::NotAllocated => JitError::InvalidPointer(addr),
                SpanError::BadLength => {
                    JitError::InvalidArgument("shrink size exceeds the allocation")
                }
            })?;
        let granularity = pool.granularity();
        state.stats.used_size -= freed * granularity;

        let Some(block) = pool.block(start) else {
            consistency_violation(format_args!("block {start:#x} vanished during shrink"));
        };
        let (rx, rw) = block.slot_views(slot);
        trace!(
            "jit shrink: rx={addr:#x} pool={pool_id} len={} freed={}",
            new_slots * granularity,
            freed * granularity
        );

        #[cfg(debug_assertions)]
        state.check();
        Ok(JitSpan::new(rx, rw, new_slots * granularity))
    }

    /// Describe the live allocation starting at `rx`.
    pub fn query(&self, rx: ExecPtr) -> Result<JitSpan, JitError> {
        let addr = rx.addr();
        let guard = self.lock();
        if guard.shut_down {
            return Err(JitError::Shutdown);
        }

        let (start, pool_id) = guard.index.lookup(addr).ok_or(JitError::InvalidPointer(addr))?;
        let Some(pool) = guard.pools.get(pool_id).and_then(Option::as_ref) else {
            consistency_violation(format_args!("indexed pool {pool_id} does not exist"));
        };
        let block = pool.block(start).ok_or(JitError::InvalidPointer(addr))?;
        let slot = block.slot_index_of(addr).ok_or(JitError::InvalidPointer(addr))?;
        let slots = block
            .bitmaps
            .span_len(slot)
            .map_err(|_| JitError::InvalidPointer(addr))?;
        let (rx, rw) = block.slot_views(slot);
        Ok(JitSpan::new(rx, rw, slots * pool.granularity()))
    }

    /// Snapshot of the allocator-wide counters.
    pub fn statistics(&self) -> JitStatistics {
        let guard = self.lock();
        #[cfg(debug_assertions)]
        guard.check();
        guard.stats
    }

    /// Per-pool breakdown, one entry per configured pool (finest first).
    pub fn pool_statistics(&self) -> Vec<PoolStatistics> {
        let guard = self.lock();
        guard
            .pools
            .iter()
            .enumerate()
            .map(|(id, pool)| match pool {
                Some(pool) => pool.statistics(),
                None => PoolStatistics {
                    granularity: self.config.pool_granularity(id),
                    ..PoolStatistics::default()
                },
            })
            .collect()
    }

    /// Release every allocation at once.
    ///
    /// All outstanding spans become invalid. With [`ResetPolicy::Soft`] the
    /// allocator stays usable; with [`ResetPolicy::Hard`] it is shut down.
    pub fn reset(&mut self, policy: ResetPolicy) {
        let keep_spare = policy == ResetPolicy::Soft && self.config.retained_empty_blocks > 0;
        let fill = self.config.fill();

        let mut guard = self.lock();
        let state = &mut *guard;
        let mut removed = Vec::new();
        for pool in state.pools.iter_mut().flatten() {
            removed.extend(pool.reset(keep_spare, fill));
        }

        state.index.clear();
        state.stats = JitStatistics::default();
        for pool in state.pools.iter().flatten() {
            for block in pool.blocks() {
                state.index.insert(block.start(), block.end(), pool.id());
                state.stats.block_count += 1;
                state.stats.reserved_size += block.size();
                state.stats.overhead_size += block.overhead_bytes();
            }
        }
        if policy == ResetPolicy::Hard {
            state.shut_down = true;
        }

        #[cfg(debug_assertions)]
        state.check();

        debug!(
            "jit allocator reset ({policy:?}): released {} blocks, kept {}",
            removed.len(),
            state.stats.block_count
        );
        drop(guard);
        drop(removed);
    }
}

fn pool_mut<V: VmOps>(pools: &mut [Option<JitPool<V>>], pool_id: usize) -> &mut JitPool<V> {
    match pools.get_mut(pool_id).and_then(Option::as_mut) {
        Some(pool) => pool,
        None => consistency_violation(format_args!("indexed pool {pool_id} does not exist")),
    }
}

impl<V: VmOps> AllocatorState<V> {
    /// Recompute everything from block state and compare with the cached
    /// aggregates.
    #[cfg(debug_assertions)]
    fn check(&self) {
        let mut actual = JitStatistics::default();
        let mut indexed = 0;
        for pool in self.pools.iter().flatten() {
            pool.check_invariants();
            for block in pool.blocks() {
                if self.index.lookup(block.start()) != Some((block.start(), pool.id())) {
                    consistency_violation(format_args!(
                        "block {:#x} of pool {} not indexed",
                        block.start(),
                        pool.id()
                    ));
                }
                indexed += 1;
                actual.block_count += 1;
                actual.used_size += block.used_bytes();
                actual.reserved_size += block.size();
                actual.overhead_size += block.overhead_bytes();
            }
        }
        if indexed != self.index.len() {
            consistency_violation(format_args!(
                "index holds {} blocks, pools hold {indexed}",
                self.index.len()
            ));
        }
        if actual != self.stats {
            consistency_violation(format_args!(
                "cached statistics {:?} differ from block state {actual:?}",
                self.stats
            ));
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::TEST_MUTEX;
    use crate::memory::mapping::DualMapping;
    use crate::memory::vm::VmError;
    use crate::sync::{Arc, thread};
    use std::collections::HashSet;

    fn page() -> usize {
        PlatformVmOps::page_size()
    }

    fn read(span: &JitSpan) -> &[u8] {
        // Safety: Test code; the span covers `size` readable bytes.
        unsafe { std::slice::from_raw_parts(span.rx().as_ptr(), span.size()) }
    }

    #[test]
    fn test_default_accessors() {
        let jit: JitAllocator = JitAllocator::default();
        assert_eq!(jit.block_size(), crate::memory::config::DEFAULT_BLOCK_SIZE.max(page()));
        assert_eq!(jit.granularity(), 64);
        assert_eq!(jit.pool_count(), 1);
        assert_eq!(jit.options(), JitAllocatorOptions::empty());
        assert_eq!(jit.config().retained_empty_blocks, 1);
        assert_eq!(jit.pool_statistics(), vec![PoolStatistics { granularity: 64, ..Default::default() }]);
    }

    #[test]
    fn test_single_allocation_accounting() {
        let _guard = TEST_MUTEX.read().unwrap();
        let jit = JitAllocator::new(&JitAllocatorConfig::default());
        let span = jit.allocate(100).unwrap();
        assert_eq!(span.size(), 128);
        assert!(span.rx().addr().is_multiple_of(64));

        let stats = jit.statistics();
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.used_size, 128);
        assert_eq!(stats.reserved_size, jit.block_size());
        // Two bitmaps of 1024 bits each for a 64 KiB block of 64-byte slots.
        assert_eq!(stats.overhead_size, 2 * (jit.block_size() / 64) / 8);

        jit.release(span.rx()).unwrap();
        let stats = jit.statistics();
        assert_eq!(stats.used_size, 0);
        // The empty block is kept as a spare.
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.reserved_size, jit.block_size());
    }

    #[test]
    fn test_immediate_release_unmaps_empty_block() {
        let _guard = TEST_MUTEX.read().unwrap();
        let jit = JitAllocator::new(
            &JitAllocatorConfig::default().with_options(JitAllocatorOptions::IMMEDIATE_RELEASE),
        );
        let span = jit.allocate(100).unwrap();
        jit.release(span.rx()).unwrap();
        assert_eq!(jit.statistics(), JitStatistics::default());
    }

    #[test]
    fn test_allocations_do_not_overlap() {
        let _guard = TEST_MUTEX.read().unwrap();
        let jit = JitAllocator::new(&JitAllocatorConfig::default());
        let mut spans: Vec<JitSpan> = (1..200).map(|i| jit.allocate(i * 7).unwrap()).collect();
        spans.sort_by_key(|s| s.rx().addr());
        for pair in spans.windows(2) {
            assert!(pair[0].rx().addr() + pair[0].size() <= pair[1].rx().addr());
        }
        for span in &spans {
            jit.release(span.rx()).unwrap();
        }
        assert_eq!(jit.statistics().used_size, 0);
    }

    #[test]
    fn test_multiple_pools_by_size() {
        let _guard = TEST_MUTEX.read().unwrap();
        let jit = JitAllocator::new(
            &JitAllocatorConfig::default().with_options(JitAllocatorOptions::USE_MULTIPLE_POOLS),
        );
        assert_eq!(jit.pool_count(), 3);

        let small = jit.allocate(50).unwrap();
        let large = jit.allocate(5000).unwrap();
        assert_eq!(small.size(), 64);
        assert_eq!(large.size(), 5120);
        assert!(large.rx().addr().is_multiple_of(256));

        let pools = jit.pool_statistics();
        assert_eq!(pools.len(), 3);
        assert_eq!(pools[0].granularity, 64);
        assert_eq!(pools[0].block_count, 1);
        assert_eq!(pools[0].used_size, 64);
        assert_eq!(pools[1].block_count, 0);
        assert_eq!(pools[2].granularity, 256);
        assert_eq!(pools[2].used_size, 5120);
        assert_eq!(jit.statistics().block_count, 2);

        jit.release(small.rx()).unwrap();
        jit.release(large.rx()).unwrap();
    }

    #[test]
    fn test_oversized_request_gets_dedicated_block() {
        let _guard = TEST_MUTEX.read().unwrap();
        let jit = JitAllocator::new(&JitAllocatorConfig::default());
        let size = jit.block_size() * 2 + 1;
        let span = jit.allocate(size).unwrap();
        assert_eq!(span.size(), size.next_multiple_of(64));
        assert_eq!(jit.statistics().reserved_size, jit.block_size() * 3);
        jit.release(span.rx()).unwrap();
    }

    #[test]
    fn test_invalid_arguments() {
        let _guard = TEST_MUTEX.read().unwrap();
        let jit = JitAllocator::new(&JitAllocatorConfig::default());
        assert!(matches!(jit.allocate(0), Err(JitError::InvalidArgument(_))));
        assert!(matches!(jit.allocate(usize::MAX), Err(JitError::InvalidArgument(_))));

        let span = jit.allocate(256).unwrap();
        assert!(matches!(jit.shrink(span.rx(), 0), Err(JitError::InvalidArgument(_))));
        assert!(matches!(jit.shrink(span.rx(), 257), Err(JitError::InvalidArgument(_))));
        assert_eq!(jit.statistics().used_size, 256);
        jit.release(span.rx()).unwrap();
        assert_eq!(jit.statistics().block_count, 1);
    }

    #[test]
    fn test_invalid_pointers() {
        let _guard = TEST_MUTEX.read().unwrap();
        let jit = JitAllocator::new(&JitAllocatorConfig::default());
        let span = jit.allocate(256).unwrap();
        let before = jit.statistics();

        let local = 0u64;
        let foreign = ExecPtr::from_addr(std::ptr::addr_of!(local) as usize).unwrap();
        assert!(matches!(jit.release(foreign), Err(JitError::InvalidPointer(_))));

        // Interior of a live span, both on and off a slot boundary.
        // Safety: Test code; offsets stay within the span.
        let interior = unsafe { span.rx().byte_add(64) };
        assert!(matches!(jit.release(interior), Err(JitError::InvalidPointer(_))));
        // Safety: as above.
        let unaligned = unsafe { span.rx().byte_add(1) };
        assert!(matches!(jit.release(unaligned), Err(JitError::InvalidPointer(_))));
        assert!(matches!(jit.shrink(interior, 64), Err(JitError::InvalidPointer(_))));
        assert!(matches!(jit.query(interior), Err(JitError::InvalidPointer(_))));
        assert_eq!(jit.statistics(), before);

        jit.release(span.rx()).unwrap();
        assert!(matches!(jit.release(span.rx()), Err(JitError::InvalidPointer(_))));
        assert!(matches!(jit.query(span.rx()), Err(JitError::InvalidPointer(_))));
    }

    #[test]
    fn test_shrink_keeps_address() {
        let _guard = TEST_MUTEX.read().unwrap();
        let jit = JitAllocator::new(&JitAllocatorConfig::default());
        let span = jit.allocate(1000).unwrap();
        assert_eq!(span.size(), 1024);

        let shrunk = jit.shrink(span.rx(), 100).unwrap();
        assert_eq!(shrunk.rx(), span.rx());
        assert_eq!(shrunk.rw(), span.rw());
        assert_eq!(shrunk.size(), 128);
        assert_eq!(jit.statistics().used_size, 128);
        assert_eq!(jit.query(span.rx()).unwrap(), shrunk);

        // Same size again is a no-op.
        assert_eq!(jit.shrink(span.rx(), 128).unwrap(), shrunk);
        assert_eq!(jit.statistics().used_size, 128);

        // The freed tail is handed out next.
        let next = jit.allocate(64).unwrap();
        assert_eq!(next.rx().addr(), span.rx().addr() + 128);

        jit.release(span.rx()).unwrap();
        jit.release(next.rx()).unwrap();
        assert_eq!(jit.statistics().used_size, 0);
    }

    #[test]
    fn test_fill_unused_memory() {
        let _guard = TEST_MUTEX.read().unwrap();
        let jit = JitAllocator::new(
            &JitAllocatorConfig::default()
                .with_options(JitAllocatorOptions::FILL_UNUSED_MEMORY)
                .with_fill_pattern(0xAB),
        );
        assert_eq!(jit.fill_pattern(), 0xAB);

        let span = jit.allocate(256).unwrap();
        assert!(read(&span).iter().all(|&b| b == 0xAB));

        // Safety: Test code; the span is live.
        unsafe { span.write(&[0x11; 256]) };
        let shrunk = jit.shrink(span.rx(), 64).unwrap();
        let tail = JitSpan::new(
            // Safety: Test code; the freed tail lies within the old span.
            unsafe { span.rx().byte_add(64) },
            // Safety: as above.
            unsafe { span.rw().byte_add(64) },
            192,
        );
        assert!(read(&tail).iter().all(|&b| b == 0xAB));
        assert!(read(&shrunk).iter().all(|&b| b == 0x11));

        jit.release(span.rx()).unwrap();
        // The block is still mapped as a spare.
        assert!(read(&shrunk).iter().all(|&b| b == 0xAB));
    }

    #[cfg(all(target_os = "linux", not(miri)))]
    #[test]
    fn test_dual_mapping_views_alias() {
        let _guard = TEST_MUTEX.read().unwrap();
        let jit = JitAllocator::new(
            &JitAllocatorConfig::default().with_options(JitAllocatorOptions::USE_DUAL_MAPPING),
        );
        let span = jit.allocate(64).unwrap();
        assert_ne!(span.rx().addr(), span.rw().addr());
        // Safety: Test code; the span is live.
        unsafe { span.write(&[1, 2, 3, 4]) };
        assert_eq!(&read(&span)[..4], &[1, 2, 3, 4]);

        // Pointers are identified by their executable view.
        let rw_as_rx = ExecPtr::from_addr(span.rw().addr()).unwrap();
        assert!(matches!(jit.release(rw_as_rx), Err(JitError::InvalidPointer(_))));
        jit.release(span.rx()).unwrap();
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64", not(miri)))]
    #[test]
    fn test_execute_allocated_code() {
        let _guard = TEST_MUTEX.read().unwrap();
        let jit = JitAllocator::new(&JitAllocatorConfig::default());
        // mov eax, 42; ret
        let code = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];
        let span = jit.allocate(code.len()).unwrap();
        // Safety: Test code; the span is live.
        unsafe { span.write(&code) };
        // Safety: Test code; the span holds a complete SysV function.
        let f: extern "C" fn() -> u32 = unsafe { span.rx().cast_fn() };
        assert_eq!(f(), 42);
        jit.release(span.rx()).unwrap();
    }

    struct FailingVm;

    impl VmOps for FailingVm {
        unsafe fn map_executable(_size: usize, _dual: bool) -> Result<DualMapping, VmError> {
            Err(VmError::MapFailed(std::io::Error::from(std::io::ErrorKind::OutOfMemory)))
        }

        unsafe fn unmap_executable(_mapping: DualMapping, _size: usize) -> Result<(), VmError> {
            Ok(())
        }

        fn page_size() -> usize {
            4096
        }
    }

    #[test]
    fn test_out_of_memory_has_no_side_effects() {
        let jit = JitAllocator::<FailingVm>::with_config(&JitAllocatorConfig::default());
        let err = jit.allocate(100).unwrap_err();
        assert!(matches!(err, JitError::OutOfMemory { size: 100, .. }));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(jit.statistics(), JitStatistics::default());
        assert_eq!(jit.pool_statistics()[0].block_count, 0);
    }

    #[test]
    fn test_statistics_are_idempotent() {
        let _guard = TEST_MUTEX.read().unwrap();
        let jit = JitAllocator::new(&JitAllocatorConfig::default());
        let span = jit.allocate(300).unwrap();
        let first = jit.statistics();
        assert_eq!(jit.statistics(), first);
        assert!(first.used_size_as_percent() > 0.0);
        jit.release(span.rx()).unwrap();
    }

    #[test]
    fn test_soft_reset_keeps_spare() {
        let _guard = TEST_MUTEX.read().unwrap();
        let mut jit = JitAllocator::new(&JitAllocatorConfig::default());
        let spans: Vec<JitSpan> = (0..3)
            .map(|_| jit.allocate(jit.block_size()).unwrap())
            .collect();
        assert_eq!(jit.statistics().block_count, 3);

        jit.reset(ResetPolicy::Soft);
        let stats = jit.statistics();
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.used_size, 0);
        assert_eq!(stats.reserved_size, jit.block_size());
        assert!(matches!(jit.release(spans[1].rx()), Err(JitError::InvalidPointer(_))));

        // Still usable, and the spare is reused.
        let span = jit.allocate(64).unwrap();
        assert_eq!(jit.statistics().block_count, 1);
        jit.release(span.rx()).unwrap();
    }

    #[test]
    fn test_soft_reset_with_immediate_release_keeps_nothing() {
        let _guard = TEST_MUTEX.read().unwrap();
        let mut jit = JitAllocator::new(
            &JitAllocatorConfig::default().with_options(JitAllocatorOptions::IMMEDIATE_RELEASE),
        );
        jit.allocate(64).unwrap();
        jit.reset(ResetPolicy::Soft);
        assert_eq!(jit.statistics(), JitStatistics::default());
        assert!(jit.allocate(64).is_ok());
    }

    #[test]
    fn test_hard_reset_shuts_down() {
        let _guard = TEST_MUTEX.read().unwrap();
        let mut jit = JitAllocator::new(&JitAllocatorConfig::default());
        let span = jit.allocate(64).unwrap();
        jit.reset(ResetPolicy::Hard);
        assert_eq!(jit.statistics(), JitStatistics::default());
        assert!(matches!(jit.allocate(64), Err(JitError::Shutdown)));
        assert!(matches!(jit.release(span.rx()), Err(JitError::Shutdown)));
        assert!(matches!(jit.shrink(span.rx(), 64), Err(JitError::Shutdown)));
        assert!(matches!(jit.query(span.rx()), Err(JitError::Shutdown)));
    }

    #[test]
    fn test_concurrent_allocate_release() {
        let _guard = TEST_MUTEX.read().unwrap();
        let jit = Arc::new(JitAllocator::new(
            &JitAllocatorConfig::default().with_options(JitAllocatorOptions::USE_MULTIPLE_POOLS),
        ));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let jit = Arc::clone(&jit);
                thread::spawn(move || {
                    let mut live = Vec::new();
                    for i in 0..200usize {
                        let span = jit.allocate(1 + (i * 37 + t * 101) % 6000).unwrap();
                        // Safety: Test code; the span is live.
                        unsafe { span.write(&[t as u8]) };
                        live.push(span);
                        if i % 3 == 0 {
                            let span = live.swap_remove(i % live.len());
                            jit.release(span.rx()).unwrap();
                        }
                    }
                    live
                })
            })
            .collect();

        let spans: Vec<JitSpan> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let starts: HashSet<usize> = spans.iter().map(|s| s.rx().addr()).collect();
        assert_eq!(starts.len(), spans.len());
        let used: usize = spans.iter().map(JitSpan::size).sum();
        assert_eq!(jit.statistics().used_size, used);

        for span in spans {
            jit.release(span.rx()).unwrap();
        }
        assert_eq!(jit.statistics().used_size, 0);
    }
}
