use super::mapping::{DualMapping, ExecPtr, WritePtr};
use std::io;
use std::ptr::NonNull;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM mapping failed: {0}")]
    MapFailed(#[source] io::Error),
    #[error("VM dual mapping failed: {0}")]
    DualMapFailed(#[source] io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] io::Error),
    #[error("dual mapping is not supported on this platform")]
    DualMappingUnsupported,
    #[error("mapping size {0} is not a non-zero multiple of the page size")]
    InvalidSize(usize),
}

/// Narrow interface to the operating system's virtual memory for executable
/// code.
///
/// Every call either fully succeeds or fails without leaving a partial
/// mapping behind.
pub trait VmOps {
    /// Map `size` bytes that can be executed.
    ///
    /// Without `dual_mapping` both views of the returned [`DualMapping`] are
    /// the same address and the pages are readable, writable and executable.
    /// With `dual_mapping` the same physical pages are mapped twice: once
    /// read+execute and once read+write.
    ///
    /// # Safety
    /// `size` must be a non-zero multiple of [`VmOps::page_size`]. The returned
    /// mapping must be released with [`VmOps::unmap_executable`] using the same
    /// `size`.
    unsafe fn map_executable(size: usize, dual_mapping: bool) -> Result<DualMapping, VmError>;

    /// Unmap both views of `mapping`.
    ///
    /// # Safety
    /// `mapping` and `size` must come from one successful `map_executable`
    /// call, and no pointer into either view may be used afterwards.
    unsafe fn unmap_executable(mapping: DualMapping, size: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{DualMapping, ExecPtr, NonNull, PlatformVmOps, VmError, VmOps, WritePtr};
    use std::io;

    const PROT_RX: libc::c_int = libc::PROT_READ | libc::PROT_EXEC;
    const PROT_RW: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;
    const PROT_RWX: libc::c_int = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;

    /// Thin wrapper over `mmap` that maps `MAP_FAILED` to the current OS error.
    unsafe fn mmap(
        size: usize,
        prot: libc::c_int,
        flags: libc::c_int,
        fd: libc::c_int,
    ) -> io::Result<NonNull<u8>> {
        // Safety: FFI call to mmap.
        let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, fd, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
    }

    unsafe fn munmap(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        // Safety: FFI call to munmap.
        if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Linux: an anonymous memfd mapped twice with different permissions.
    /// The descriptor is closed once both views exist; the mappings keep the
    /// pages alive.
    #[cfg(target_os = "linux")]
    unsafe fn map_dual(size: usize) -> Result<DualMapping, VmError> {
        // Safety: FFI call to memfd_create with a NUL-terminated name.
        let fd = unsafe { libc::memfd_create(c"qen-jit".as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(VmError::DualMapFailed(io::Error::last_os_error()));
        }

        let result = (|| -> io::Result<DualMapping> {
            let len = libc::off_t::try_from(size)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "mapping too large"))?;
            // Safety: FFI call to ftruncate on a descriptor we own.
            if unsafe { libc::ftruncate(fd, len) } != 0 {
                return Err(io::Error::last_os_error());
            }
            // Safety: fd is a valid memfd of `size` bytes.
            let rx = unsafe { mmap(size, PROT_RX, libc::MAP_SHARED, fd)? };
            // Safety: as above.
            let rw = match unsafe { mmap(size, PROT_RW, libc::MAP_SHARED, fd) } {
                Ok(rw) => rw,
                Err(e) => {
                    // Safety: rx was mapped above with the same size.
                    drop(unsafe { munmap(rx, size) });
                    return Err(e);
                }
            };
            Ok(DualMapping::new(ExecPtr::new(rx), WritePtr::new(rw)))
        })();

        // Safety: FFI call to close a descriptor we own.
        unsafe { libc::close(fd) };
        result.map_err(VmError::DualMapFailed)
    }

    #[cfg(not(target_os = "linux"))]
    unsafe fn map_dual(_size: usize) -> Result<DualMapping, VmError> {
        Err(VmError::DualMappingUnsupported)
    }

    impl VmOps for PlatformVmOps {
        unsafe fn map_executable(size: usize, dual_mapping: bool) -> Result<DualMapping, VmError> {
            if size == 0 || !size.is_multiple_of(Self::page_size()) {
                return Err(VmError::InvalidSize(size));
            }
            if dual_mapping {
                // Safety: size validated above.
                return unsafe { map_dual(size) };
            }
            // Safety: size validated above.
            let ptr = unsafe { mmap(size, PROT_RWX, libc::MAP_PRIVATE | libc::MAP_ANON, -1) }
                .map_err(VmError::MapFailed)?;
            Ok(DualMapping::new(ExecPtr::new(ptr), WritePtr::new(ptr)))
        }

        unsafe fn unmap_executable(mapping: DualMapping, size: usize) -> Result<(), VmError> {
            // Both views are unmapped even if the first one fails.
            let rw = if mapping.is_dual() {
                // Safety: caller guarantees mapping/size came from map_executable.
                unsafe { munmap(mapping.rw().as_non_null(), size) }
            } else {
                Ok(())
            };
            // Safety: as above.
            let rx = unsafe { munmap(mapping.rx().as_non_null(), size) };
            rw.and(rx).map_err(VmError::ReleaseFailed)
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; page size fits in
                // usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls; loom runs inside a
// single OS process with its own scheduler. Every "mapping" is a plain heap
// allocation and both views alias it. The memory is NOT executable; this is
// only good enough to test the allocator's bookkeeping and synchronization.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
const MOCK_PAGE_SIZE: usize = 4096;

#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn map_executable(size: usize, _dual_mapping: bool) -> Result<DualMapping, VmError> {
        if size == 0 || !size.is_multiple_of(MOCK_PAGE_SIZE) {
            return Err(VmError::InvalidSize(size));
        }
        let layout = std::alloc::Layout::from_size_align(size, MOCK_PAGE_SIZE)
            .map_err(|e| VmError::MapFailed(io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            VmError::MapFailed(io::Error::new(io::ErrorKind::OutOfMemory, "alloc returned null"))
        })?;
        Ok(DualMapping::new(ExecPtr::new(ptr), WritePtr::new(ptr)))
    }

    unsafe fn unmap_executable(mapping: DualMapping, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, MOCK_PAGE_SIZE)
            .map_err(|e| VmError::ReleaseFailed(io::Error::other(e)))?;
        // Safety: the pointer was allocated with the same layout in map_executable.
        unsafe { std::alloc::dealloc(mapping.rw().as_mut_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        MOCK_PAGE_SIZE
    }
}
