use super::vm::VmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JitError {
    /// Zero size, a shrink target larger than the span, or a size that
    /// overflows once rounded.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The OS could not map a block for the request.
    #[error("out of memory: cannot map a block for {size} bytes")]
    OutOfMemory {
        size: usize,
        #[source]
        source: VmError,
    },
    /// The address does not start a live allocation (foreign pointer,
    /// interior pointer or double release).
    #[error("invalid pointer {0:#x}: not the start of a live allocation")]
    InvalidPointer(usize),
    /// The allocator was shut down by a hard reset.
    #[error("allocator has been shut down")]
    Shutdown,
}
