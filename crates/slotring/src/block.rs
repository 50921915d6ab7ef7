use crate::QueueError;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Cache line size used for record alignment and header isolation.
pub(crate) const CACHE_LINE: usize = 64;

/// Page size used for ring storage alignment.
pub(crate) const PAGE_SIZE: usize = 4096;

/// One zeroed heap block with a caller-chosen alignment.
///
/// This is the only place the crate talks to the global allocator. The block
/// is freed on drop; ownership is exclusive, so the owning queue frees its
/// storage exactly once.
pub(crate) struct RawBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: RawBlock is plain owned memory. Synchronizing access to its bytes is
// the job of the queue protocols built on top of it.
unsafe impl Send for RawBlock {}
unsafe impl Sync for RawBlock {}

impl RawBlock {
    /// Allocates `size` zeroed bytes aligned to `align` (a power of two).
    pub(crate) fn zeroed(size: usize, align: usize) -> Result<Self, QueueError> {
        if size == 0 {
            return Err(QueueError::InvalidArgument {
                reason: "allocation size must be > 0",
            });
        }
        let layout = Layout::from_size_align(size, align).map_err(|_| QueueError::Overflow)?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(QueueError::OutOfMemory { bytes: size })?;

        Ok(Self { ptr, layout })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for RawBlock {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Rounds `n` up to a multiple of `align` (a power of two), `None` on overflow.
#[inline]
pub(crate) fn align_up(n: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(n.checked_add(align - 1)? & !(align - 1))
}
