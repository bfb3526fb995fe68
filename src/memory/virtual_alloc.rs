//! Virtual memory allocator with reservation reuse.
//!
//! Every allocation is its own OS reservation. Releasing an allocation does
//! not give the address range back to the OS: the reservation is decommitted
//! down to the page holding its header and appended to an intrusive free
//! list, where a later request of equal or smaller size picks it up again
//! (first fit, scanned from the head).
//!
//! A single mutex serializes every operation, including the OS calls.

use super::header::{HeaderRef, VmHeader};
use super::os::{self, SystemInfo};
use crate::align::{align_down, align_up};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::telemetry::{Metrics, MetricsSnapshot};
use parking_lot::Mutex;
use std::fmt;
use std::ptr::NonNull;

/// Released reservations, linked through their headers.
struct FreeList {
    head: Option<HeaderRef>,
    tail: Option<HeaderRef>,
    len: usize,
}

// SAFETY: the headers are only touched while the owning mutex is held.
unsafe impl Send for FreeList {}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    unsafe fn push_back(&mut self, header: HeaderRef) {
        header.set_next(None);
        match self.tail {
            Some(tail) => tail.set_next(Some(header)),
            None => self.head = Some(header),
        }
        self.tail = Some(header);
        self.len += 1;
    }

    /// Unlinks and returns the first header whose reservation holds `size`
    /// bytes.
    unsafe fn take_first_fit(&mut self, size: usize) -> Option<HeaderRef> {
        let mut previous: Option<HeaderRef> = None;
        let mut current = self.head;

        while let Some(header) = current {
            let next = header.next();

            if header.size() >= size {
                match previous {
                    Some(previous) => previous.set_next(next),
                    None => self.head = next,
                }
                if self.tail == Some(header) {
                    self.tail = previous;
                }
                header.set_next(None);
                self.len -= 1;
                return Some(header);
            }

            previous = current;
            current = next;
        }

        None
    }

    unsafe fn pop_front(&mut self) -> Option<HeaderRef> {
        let header = self.head?;
        self.head = header.next();
        if self.head.is_none() {
            self.tail = None;
        }
        header.set_next(None);
        self.len -= 1;
        Some(header)
    }

    unsafe fn total_bytes(&self) -> usize {
        let mut total = 0;
        let mut current = self.head;
        while let Some(header) = current {
            total += header.size();
            current = header.next();
        }
        total
    }
}

/// Process-wide arena of reusable OS reservations.
///
/// Construct one per process at the application entry point (or through
/// [`crate::runtime::init`]) and hand an `Arc` of it to the consumers that
/// need backing memory.
///
/// ```no_run
/// use vmem::memory::VirtualMemory;
///
/// let vm = VirtualMemory::new(Default::default()).unwrap();
/// let ptr = vm.allocate(1 << 20, 64 * 1024, 16).unwrap();
/// assert_eq!(ptr.as_ptr() as usize % 16, 0);
/// unsafe { vm.release(ptr).unwrap() };
/// ```
pub struct VirtualMemory {
    free_list: Mutex<FreeList>,
    info: SystemInfo,
    config: Config,
    metrics: Metrics,
}

impl VirtualMemory {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let info = *os::system_info();
        tracing::debug!(
            page_size = info.page_size,
            granularity = info.allocation_granularity,
            "virtual memory allocator created"
        );

        Ok(Self {
            free_list: Mutex::new(FreeList::new()),
            info,
            config,
            metrics: Metrics::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.info.page_size
    }

    pub fn allocation_granularity(&self) -> usize {
        self.info.allocation_granularity
    }

    pub fn system_info(&self) -> &SystemInfo {
        &self.info
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Routes `err` through the configured failure policy.
    pub(crate) fn fail<T>(&self, err: Error) -> Result<T> {
        self.metrics.record_failure();
        self.config.failure_policy.fail(err)
    }

    /// Allocates `byte_size` bytes aligned to `alignment`, of which the first
    /// `commit_byte_size` are committed.
    ///
    /// The returned memory is reused from a released reservation when one is
    /// large enough; otherwise a new range is reserved from the OS.
    pub fn allocate(
        &self,
        byte_size: usize,
        commit_byte_size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>> {
        if !alignment.is_power_of_two() {
            return self.fail(Error::invalid_argument(format!(
                "alignment {} is not a power of two",
                alignment
            )));
        }
        if alignment > self.info.allocation_granularity {
            return self.fail(Error::AlignmentTooLarge {
                alignment,
                granularity: self.info.allocation_granularity,
            });
        }
        if commit_byte_size > byte_size {
            return self.fail(Error::invalid_argument(format!(
                "commit size {} exceeds allocation size {}",
                commit_byte_size, byte_size
            )));
        }

        let alignment = VmHeader::effective_alignment(alignment);
        let overhead = VmHeader::overhead(alignment);
        let page_size = self.info.page_size;

        let aligned_byte_size = match byte_size.checked_add(overhead + page_size) {
            Some(_) => align_up(byte_size + overhead, page_size),
            None => return self.fail(Error::OutOfMemory { requested: byte_size }),
        };
        let aligned_commit_byte_size = align_up(commit_byte_size + overhead, page_size);

        let mut free_list = self.free_list.lock();

        // SAFETY: headers on the free list keep their page committed.
        let reused = unsafe { free_list.take_first_fit(aligned_byte_size) };

        let (base, reservation_size) = match reused {
            Some(header) => {
                // SAFETY: the header was validated when it was released.
                let (base, size) = unsafe { (header.base_ptr(), header.size()) };
                self.metrics.record_reuse();
                tracing::debug!(
                    base = ?base,
                    size,
                    requested = aligned_byte_size,
                    "reusing released reservation"
                );
                (base, size)
            }
            None => match os::reserve(aligned_byte_size) {
                Ok(base) => {
                    self.metrics.record_reservation(aligned_byte_size);
                    tracing::debug!(base = ?base, size = aligned_byte_size, "reserved address range");
                    (base, aligned_byte_size)
                }
                Err(err) => {
                    tracing::warn!(error = %err, size = aligned_byte_size, "address space reservation failed");
                    return self.fail(Error::OutOfMemory {
                        requested: aligned_byte_size,
                    });
                }
            },
        };

        // SAFETY: base..base + reservation_size is a reservation we own and
        // aligned_commit_byte_size <= aligned_byte_size <= reservation_size.
        if let Err(err) = unsafe { os::commit(base, aligned_commit_byte_size) } {
            tracing::warn!(error = %err, size = aligned_commit_byte_size, "commit failed");
            unsafe {
                match reused {
                    Some(header) => free_list.push_back(header),
                    None => {
                        if let Err(err) = os::release(base, reservation_size) {
                            tracing::warn!(error = %err, "failed to return reservation to the OS");
                        }
                    }
                }
            }
            return self.fail(Error::OutOfMemory {
                requested: aligned_commit_byte_size,
            });
        }
        self.metrics.record_commit(aligned_commit_byte_size);

        // SAFETY: the header page is covered by the commit above.
        let header = unsafe { HeaderRef::write(base, alignment, reservation_size) };
        Ok(header.data_ptr())
    }

    /// Returns an allocation to the free list.
    ///
    /// Everything but the page(s) holding the header is decommitted; the
    /// address range stays reserved for reuse.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// allocator, and must not be used after this call. A pointer that was
    /// already released is detected and reported as
    /// [`Error::InvalidHandle`] as long as its reservation has not been reused.
    pub unsafe fn release(&self, ptr: NonNull<u8>) -> Result<()> {
        let mut free_list = self.free_list.lock();

        let header = HeaderRef::from_data_ptr(ptr);
        if let Err(err) = self.check_header(header, "release") {
            return self.fail(err);
        }

        header.mark_released();
        free_list.push_back(header);
        self.metrics.record_release();

        let base = header.base_ptr();
        let size = header.size();
        let decommit_start = align_up(ptr.as_ptr() as usize, self.info.page_size);
        let pinned = decommit_start - base.as_ptr() as usize;

        tracing::debug!(base = ?base, size, pinned, "released reservation to free list");

        if size > pinned {
            let start = NonNull::new_unchecked(decommit_start as *mut u8);
            if let Err(err) = os::decommit(start, size - pinned) {
                return self.fail(Error::Io(err));
            }
            self.metrics.record_decommit(size - pinned);
        }

        Ok(())
    }

    /// Returns a live allocation's whole reservation to the OS.
    ///
    /// # Safety
    ///
    /// Same as [`release`](Self::release). The pointer must be live: handing
    /// in a pointer that sits on the free list is reported as
    /// [`Error::InvalidHandle`].
    pub unsafe fn force_release_to_os(&self, ptr: NonNull<u8>) -> Result<()> {
        let _free_list = self.free_list.lock();

        let header = HeaderRef::from_data_ptr(ptr);
        if let Err(err) = self.check_header(header, "force release") {
            return self.fail(err);
        }

        let base = header.base_ptr();
        let size = header.size();
        if let Err(err) = os::release(base, size) {
            return self.fail(Error::Io(err));
        }

        self.metrics.record_force_release();
        tracing::debug!(base = ?base, size, "returned reservation to the OS");
        Ok(())
    }

    /// Commits `size` bytes starting at `ptr`.
    ///
    /// The range is widened to whole pages.
    ///
    /// # Safety
    ///
    /// The range must lie inside a live allocation from this allocator.
    pub unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        let _guard = self.free_list.lock();

        let (start, len) = self.page_span(ptr, size);
        tracing::trace!(start = ?start, len, "commit");

        if let Err(err) = os::commit(start, len) {
            return self.fail(Error::Io(err));
        }
        self.metrics.record_commit(len);
        Ok(())
    }

    /// Decommits `size` bytes starting at `ptr`.
    ///
    /// The range is widened to whole pages.
    ///
    /// # Safety
    ///
    /// The range must lie inside a live allocation from this allocator and
    /// must not cover the page holding the allocation's header.
    pub unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        let _guard = self.free_list.lock();

        let (start, len) = self.page_span(ptr, size);
        tracing::trace!(start = ?start, len, "decommit");

        if let Err(err) = os::decommit(start, len) {
            return self.fail(Error::Io(err));
        }
        self.metrics.record_decommit(len);
        Ok(())
    }

    /// Size of the reservation backing a live allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// allocator.
    pub unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        let _guard = self.free_list.lock();

        let header = HeaderRef::from_data_ptr(ptr);
        match self.check_header(header, "allocation_size") {
            Ok(()) => Ok(header.size()),
            Err(err) => self.fail(err),
        }
    }

    /// Number of released reservations waiting for reuse.
    pub fn free_list_len(&self) -> usize {
        self.free_list.lock().len
    }

    /// Total reserved bytes sitting on the free list.
    pub fn free_list_bytes(&self) -> usize {
        let free_list = self.free_list.lock();
        // SAFETY: free list headers stay committed.
        unsafe { free_list.total_bytes() }
    }

    /// Returns every released reservation to the OS.
    ///
    /// Returns the number of reservations freed.
    pub fn trim(&self) -> Result<usize> {
        let mut free_list = self.free_list.lock();
        let mut freed = 0;

        // SAFETY: free list entries are owned by the allocator alone.
        unsafe {
            while let Some(header) = free_list.pop_front() {
                if self.config.validate_headers && !header.has_marker() {
                    tracing::warn!(header = ?header, "corrupt header on free list, leaking reservation");
                    continue;
                }

                let base = header.base_ptr();
                let size = header.size();
                if let Err(err) = os::release(base, size) {
                    return self.fail(Error::Io(err));
                }
                self.metrics.record_force_release();
                freed += 1;
            }
        }

        if freed > 0 {
            tracing::debug!(freed, "trimmed free list");
        }
        Ok(freed)
    }

    unsafe fn check_header(&self, header: HeaderRef, operation: &str) -> Result<()> {
        if self.config.validate_headers && !header.has_marker() {
            tracing::warn!(header = ?header, operation, "invalid allocation header");
            return Err(Error::invalid_handle(format!(
                "{}: pointer was not returned by this allocator",
                operation
            )));
        }

        if header.is_released() {
            tracing::warn!(header = ?header, operation, "allocation already released");
            return Err(Error::invalid_handle(format!(
                "{}: allocation was already released",
                operation
            )));
        }

        if !header.is_live() {
            return Err(Error::invalid_handle(format!(
                "{}: corrupt allocation header",
                operation
            )));
        }

        Ok(())
    }

    fn page_span(&self, ptr: NonNull<u8>, size: usize) -> (NonNull<u8>, usize) {
        let page_size = self.info.page_size;
        let start = align_down(ptr.as_ptr() as usize, page_size);
        let end = align_up(ptr.as_ptr() as usize + size, page_size);
        // SAFETY: rounding a non-null address down to a page stays non-null
        // for any address inside a reservation.
        (unsafe { NonNull::new_unchecked(start as *mut u8) }, end - start)
    }
}

impl fmt::Debug for VirtualMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMemory")
            .field("page_size", &self.info.page_size)
            .field("allocation_granularity", &self.info.allocation_granularity)
            .field("free_list_len", &self.free_list_len())
            .finish()
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        if let Err(err) = self.trim() {
            tracing::warn!(error = %err, "failed to release free list on teardown");
        }
    }
}
