//! Typed views of executable memory.
//!
//! A region handed out by the allocator is reachable through two views that
//! may or may not share an address:
//!
//! - [`ExecPtr`] is the read+execute view. It only hands out `*const u8` and
//!   function pointers, so there is no way to write through it without an
//!   explicit cast.
//! - [`WritePtr`] is the read+write view used to emit code.
//!
//! Without dual mapping both views hold the same address. With dual mapping
//! they alias the same physical pages at unrelated addresses.

use std::fmt;
use std::ptr::NonNull;

/// Read+execute view of JIT memory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ExecPtr(NonNull<u8>);

/// Read+write view of JIT memory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct WritePtr(NonNull<u8>);

// Safety: both views are plain addresses; they grant no access by themselves.
unsafe impl Send for ExecPtr {}
// Safety: see above.
unsafe impl Sync for ExecPtr {}
// Safety: see above.
unsafe impl Send for WritePtr {}
// Safety: see above.
unsafe impl Sync for WritePtr {}

impl ExecPtr {
    #[inline]
    pub const fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Rebuild an executable view from a raw address, e.g. one stored by the
    /// caller in a code cache. Returns `None` for null.
    #[inline]
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut u8).map(Self)
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(self) -> *const u8 {
        self.0.as_ptr().cast_const()
    }

    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn as_non_null(self) -> NonNull<u8> {
        self.0
    }

    /// Offset the view by `offset` bytes.
    ///
    /// # Safety
    /// The result must stay within the mapping this view points into.
    #[inline]
    #[must_use]
    pub unsafe fn byte_add(self, offset: usize) -> Self {
        // Safety: upheld by caller.
        Self(unsafe { self.0.add(offset) })
    }

    /// Reinterpret the view as a function pointer of type `F`.
    ///
    /// # Safety
    /// `F` must be a function pointer type and the memory must hold a complete
    /// function with a matching ABI, written through the [`WritePtr`] view.
    ///
    /// Types that are not pointer-sized are rejected at compile time:
    ///
    /// ```compile_fail,E0080
    /// use qen_jit::ExecPtr;
    /// use std::ptr::NonNull;
    ///
    /// let rx = ExecPtr::new(NonNull::dangling());
    /// let _ = unsafe { rx.cast_fn::<u128>() };
    /// ```
    #[inline]
    pub unsafe fn cast_fn<F: Copy>(self) -> F {
        const {
            assert!(
                std::mem::size_of::<F>() == std::mem::size_of::<*const u8>(),
                "cast_fn target must be pointer-sized"
            );
        }
        let ptr = self.as_ptr();
        // Safety: upheld by caller; sizes match for function pointers.
        unsafe { std::mem::transmute_copy::<*const u8, F>(&ptr) }
    }
}

impl WritePtr {
    #[inline]
    pub const fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    #[inline]
    #[must_use]
    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn as_non_null(self) -> NonNull<u8> {
        self.0
    }

    /// Offset the view by `offset` bytes.
    ///
    /// # Safety
    /// The result must stay within the mapping this view points into.
    #[inline]
    #[must_use]
    pub unsafe fn byte_add(self, offset: usize) -> Self {
        // Safety: upheld by caller.
        Self(unsafe { self.0.add(offset) })
    }

    /// Copy `bytes` to `offset` bytes past this view.
    ///
    /// # Safety
    /// `offset + bytes.len()` must stay within memory the caller owns.
    #[inline]
    pub unsafe fn copy_from_slice(self, offset: usize, bytes: &[u8]) {
        // Safety: upheld by caller; JIT memory never overlaps a Rust slice.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.0.as_ptr().add(offset), bytes.len());
        }
    }

    /// Set `len` bytes starting `offset` bytes past this view to `byte`.
    ///
    /// # Safety
    /// `offset + len` must stay within memory the caller owns.
    #[inline]
    pub unsafe fn fill(self, offset: usize, len: usize, byte: u8) {
        // Safety: upheld by caller.
        unsafe { std::ptr::write_bytes(self.0.as_ptr().add(offset), byte, len) };
    }
}

impl fmt::Debug for ExecPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecPtr({:p})", self.0)
    }
}

impl fmt::Debug for WritePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WritePtr({:p})", self.0)
    }
}

/// Both views of one OS mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DualMapping {
    rx: ExecPtr,
    rw: WritePtr,
}

impl DualMapping {
    #[inline]
    pub fn new(rx: ExecPtr, rw: WritePtr) -> Self {
        Self { rx, rw }
    }

    #[inline]
    #[must_use]
    pub fn rx(&self) -> ExecPtr {
        self.rx
    }

    #[inline]
    #[must_use]
    pub fn rw(&self) -> WritePtr {
        self.rw
    }

    /// True when the executable and writable views live at different addresses.
    #[inline]
    #[must_use]
    pub fn is_dual(&self) -> bool {
        self.rx.addr() != self.rw.addr()
    }
}

/// A live allocation: both views of its first byte and its usable size
/// (the request rounded up to whole slots).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JitSpan {
    rx: ExecPtr,
    rw: WritePtr,
    size: usize,
}

impl JitSpan {
    #[inline]
    pub(crate) fn new(rx: ExecPtr, rw: WritePtr, size: usize) -> Self {
        Self { rx, rw, size }
    }

    /// Executable view. Pass this to `release`/`shrink`/`query`.
    #[inline]
    #[must_use]
    pub fn rx(&self) -> ExecPtr {
        self.rx
    }

    /// Writable view. Emit code through this one.
    #[inline]
    #[must_use]
    pub fn rw(&self) -> WritePtr {
        self.rw
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy `code` to the start of the span through the writable view.
    ///
    /// A `JitSpan` is a plain description of memory; the allocator may hand
    /// the same range out again once the span is released or the allocator
    /// is reset or dropped, so writing is `unsafe`:
    ///
    /// ```no_run
    /// use qen_jit::{JitAllocator, JitAllocatorConfig};
    ///
    /// let jit = JitAllocator::new(&JitAllocatorConfig::default());
    /// let span = jit.allocate(6).unwrap();
    /// // Safety: `span` is live until the release below.
    /// unsafe { span.write(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]) };
    /// jit.release(span.rx()).unwrap();
    /// ```
    ///
    /// ```compile_fail,E0133
    /// use qen_jit::{JitAllocator, JitAllocatorConfig};
    ///
    /// let jit = JitAllocator::new(&JitAllocatorConfig::default());
    /// let span = jit.allocate(1).unwrap();
    /// span.write(&[0xC3]);
    /// ```
    ///
    /// # Safety
    ///
    /// The span must still be live: not released, not cut off by `shrink`,
    /// and its allocator not reset or dropped since it was returned.
    ///
    /// # Panics
    ///
    /// Panics if `code` is longer than the span.
    pub unsafe fn write(&self, code: &[u8]) {
        assert!(
            code.len() <= self.size,
            "code of {} bytes does not fit a span of {} bytes",
            code.len(),
            self.size
        );
        // Safety: a live span owns `size` writable bytes; liveness is upheld
        // by the caller.
        unsafe { self.rw.copy_from_slice(0, code) };
    }
}
