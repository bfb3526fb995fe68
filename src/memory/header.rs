//! Allocation header embedded immediately below every pointer handed out by
//! [`VirtualMemory`](super::VirtualMemory).
//!
//! Layout of a reservation, from its base address:
//!
//! ```text
//! base                      data (aligned)
//! |<------- overhead ------->|
//! | padding | VmHeader       | caller bytes ...              |
//! ```
//!
//! `overhead` is `size_of::<VmHeader>()` rounded up to the allocation's
//! alignment, so the header always sits at a fixed negative offset from the
//! data pointer and the base is recovered from the alignment stored in it.

use crate::align::align_up;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

/// Guard value checked when a pointer comes back to the allocator.
pub(crate) const HEADER_MARKER: u64 = 0x564D_4845_4144_4552;

const STATE_LIVE: u32 = 0x4C49_5645;
const STATE_RELEASED: u32 = 0x4652_4545;

#[repr(C)]
pub(crate) struct VmHeader {
    /// Next released header. Always `None` while the allocation is live.
    next: Option<NonNull<VmHeader>>,
    /// Byte size of the whole OS reservation.
    size: usize,
    /// Alignment the allocation was made with.
    alignment: usize,
    state: u32,
    marker: u64,
}

impl VmHeader {
    /// Alignment actually used for an allocation requested with `alignment`.
    #[inline]
    pub(crate) fn effective_alignment(alignment: usize) -> usize {
        alignment.max(align_of::<VmHeader>())
    }

    /// Bytes between the reservation base and the data pointer.
    #[inline]
    pub(crate) fn overhead(alignment: usize) -> usize {
        align_up(size_of::<VmHeader>(), alignment)
    }
}

/// Handle to a header living inside a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeaderRef(NonNull<VmHeader>);

impl HeaderRef {
    /// Recovers the header sitting immediately below `data`.
    ///
    /// # Safety
    ///
    /// `data` must have been returned by `VirtualMemory::allocate` and the
    /// page holding its header must still be committed.
    #[inline]
    pub(crate) unsafe fn from_data_ptr(data: NonNull<u8>) -> Self {
        let header = data.as_ptr().cast::<VmHeader>().sub(1);
        HeaderRef(NonNull::new_unchecked(header))
    }

    /// Writes a fresh live header into the reservation at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be a reservation of at least `size` bytes whose first
    /// `VmHeader::overhead(alignment)` bytes are committed. `alignment` must
    /// already be an effective alignment.
    pub(crate) unsafe fn write(base: NonNull<u8>, alignment: usize, size: usize) -> Self {
        let data = base.as_ptr().add(VmHeader::overhead(alignment));
        let header = HeaderRef::from_data_ptr(NonNull::new_unchecked(data));
        header.0.as_ptr().write(VmHeader {
            next: None,
            size,
            alignment,
            state: STATE_LIVE,
            marker: HEADER_MARKER,
        });
        header
    }

    #[inline]
    pub(crate) fn data_ptr(self) -> NonNull<u8> {
        // SAFETY: one header past a valid header pointer is the data pointer.
        unsafe { NonNull::new_unchecked(self.0.as_ptr().add(1).cast::<u8>()) }
    }

    /// Base address of the reservation holding this header.
    ///
    /// # Safety
    ///
    /// The header must be readable.
    #[inline]
    pub(crate) unsafe fn base_ptr(self) -> NonNull<u8> {
        let overhead = VmHeader::overhead(self.alignment());
        NonNull::new_unchecked(self.data_ptr().as_ptr().sub(overhead))
    }

    #[inline]
    pub(crate) unsafe fn size(self) -> usize {
        (*self.0.as_ptr()).size
    }

    #[inline]
    pub(crate) unsafe fn alignment(self) -> usize {
        (*self.0.as_ptr()).alignment
    }

    #[inline]
    pub(crate) unsafe fn next(self) -> Option<HeaderRef> {
        (*self.0.as_ptr()).next.map(HeaderRef)
    }

    #[inline]
    pub(crate) unsafe fn set_next(self, next: Option<HeaderRef>) {
        (*self.0.as_ptr()).next = next.map(|h| h.0);
    }

    #[inline]
    pub(crate) unsafe fn has_marker(self) -> bool {
        (*self.0.as_ptr()).marker == HEADER_MARKER
    }

    #[inline]
    pub(crate) unsafe fn is_live(self) -> bool {
        (*self.0.as_ptr()).state == STATE_LIVE
    }

    #[inline]
    pub(crate) unsafe fn is_released(self) -> bool {
        (*self.0.as_ptr()).state == STATE_RELEASED
    }

    #[inline]
    pub(crate) unsafe fn mark_released(self) {
        (*self.0.as_ptr()).state = STATE_RELEASED;
    }

    /// Overwrites the guard value; used to simulate corruption in tests.
    #[cfg(test)]
    pub(crate) unsafe fn clobber_marker(self) {
        (*self.0.as_ptr()).marker = 0;
    }
}
