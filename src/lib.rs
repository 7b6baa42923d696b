#[cfg(not(target_pointer_width = "64"))]
compile_error!("qen-jit supports only 64-bit targets.");

#[cfg(not(any(unix, loom, miri)))]
compile_error!("qen-jit supports only unix targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and the process-wide counters in `memory::stats`
pub mod memory;

// allocator
pub use memory::allocator::{JitAllocator, ResetPolicy};
pub use memory::config::{JitAllocatorConfig, JitAllocatorOptions, ResolvedConfig};
pub use memory::mapping::{DualMapping, ExecPtr, JitSpan, WritePtr};

// platform
pub use memory::vm::{PlatformVmOps, VmOps};

// stats
pub use memory::stats::{JitStatistics, PoolStatistics};

// errors
pub use memory::error::JitError;
pub use memory::vm::VmError;
