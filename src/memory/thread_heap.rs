//! Per-thread bump heap carved out of one large virtual-memory block.
//!
//! A `ThreadHeap` reserves a big block up front and commits it lazily in
//! steps as allocations advance. Memory is never freed piecemeal; callers
//! take a [`Bookmark`] and roll back to it, or [`reset`](ThreadHeap::reset)
//! the whole heap, which also hands committed pages above the initial
//! commit back to the OS.

use super::virtual_alloc::VirtualMemory;
use crate::align::align_up;
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Position in a [`ThreadHeap`] to roll back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bookmark(usize);

pub struct ThreadHeap {
    vm: Arc<VirtualMemory>,
    base: NonNull<u8>,
    capacity: usize,
    initial_commit: usize,
    committed: usize,
    used: usize,
}

impl ThreadHeap {
    /// Reserves `reserve` bytes and commits the first `initial_commit`.
    pub fn new(vm: Arc<VirtualMemory>, reserve: usize, initial_commit: usize) -> Result<Self> {
        let page_size = vm.page_size();
        let base = vm.allocate(reserve, initial_commit, page_size)?;

        let capacity = align_up(reserve, page_size);
        let initial_commit = align_up(initial_commit, page_size);

        tracing::debug!(reserve = capacity, initial_commit, "thread heap created");

        Ok(Self {
            vm,
            base,
            capacity,
            initial_commit,
            committed: initial_commit,
            used: 0,
        })
    }

    /// Bump-allocates `size` bytes aligned to `align`.
    ///
    /// Commits more of the block when the allocation runs past the committed
    /// prefix. Fails with [`Error::OutOfMemory`] once the reservation is
    /// exhausted and with [`Error::AlignmentTooLarge`] for alignments above
    /// the page size.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() {
            return self.vm.fail(Error::invalid_argument(format!(
                "alignment {} is not a power of two",
                align
            )));
        }
        if align > self.vm.page_size() {
            return self.vm.fail(Error::AlignmentTooLarge {
                alignment: align,
                granularity: self.vm.page_size(),
            });
        }

        // The block base is page aligned, so aligning the offset aligns the
        // address.
        let start = align_up(self.used, align);
        let end = match start.checked_add(size) {
            Some(end) if end <= self.capacity => end,
            _ => {
                tracing::warn!(size, used = self.used, capacity = self.capacity, "thread heap exhausted");
                return self.vm.fail(Error::OutOfMemory { requested: size });
            }
        };

        if end > self.committed {
            self.grow(end)?;
        }

        self.used = end;
        // SAFETY: start < capacity, inside the block.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) })
    }

    fn grow(&mut self, end: usize) -> Result<()> {
        let step = self.vm.config().thread_heap_commit_step;
        let wanted = align_up(end - self.committed, self.vm.page_size()).max(step);
        let target = (self.committed + wanted).min(self.capacity);

        // SAFETY: committed..target lies inside the block.
        unsafe {
            let start = NonNull::new_unchecked(self.base.as_ptr().add(self.committed));
            self.vm.commit(start, target - self.committed)?;
        }

        tracing::trace!(from = self.committed, to = target, "thread heap grew");
        self.committed = target;
        Ok(())
    }

    pub fn bookmark(&self) -> Bookmark {
        Bookmark(self.used)
    }

    /// Rolls the heap back to `bookmark`, invalidating everything allocated
    /// after it.
    pub fn reset_to(&mut self, bookmark: Bookmark) {
        debug_assert!(bookmark.0 <= self.used, "bookmark {:?} is ahead of the heap", bookmark);
        self.used = self.used.min(bookmark.0);
    }

    /// Drops every allocation and decommits pages above the initial commit.
    pub fn reset(&mut self) -> Result<()> {
        self.used = 0;

        if self.committed > self.initial_commit {
            // SAFETY: initial_commit..committed lies inside the block and
            // above the header page.
            unsafe {
                let start = NonNull::new_unchecked(self.base.as_ptr().add(self.initial_commit));
                self.vm.decommit(start, self.committed - self.initial_commit)?;
            }
            tracing::trace!(from = self.committed, to = self.initial_commit, "thread heap shrank");
            self.committed = self.initial_commit;
        }

        Ok(())
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for ThreadHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHeap")
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .field("committed", &self.committed)
            .field("used", &self.used)
            .finish()
    }
}

impl Drop for ThreadHeap {
    fn drop(&mut self) {
        // SAFETY: base came from vm.allocate and is released exactly once.
        if let Err(err) = unsafe { self.vm.release(self.base) } {
            tracing::warn!(error = %err, "failed to release thread heap");
        }
    }
}

thread_local! {
    static THREAD_HEAP: RefCell<Option<ThreadHeap>> = RefCell::new(None);
}

/// Installs a heap for the calling thread, sized from `vm`'s config.
pub fn init_thread_heap(vm: &Arc<VirtualMemory>) -> Result<()> {
    if THREAD_HEAP.with(|heap| heap.borrow().is_some()) {
        return Err(Error::AlreadyInitialized);
    }

    let config = vm.config();
    let heap = ThreadHeap::new(
        vm.clone(),
        config.thread_heap_reserve,
        config.thread_heap_initial_commit,
    )?;

    THREAD_HEAP.with(|slot| *slot.borrow_mut() = Some(heap));
    Ok(())
}

/// Runs `f` with the calling thread's heap.
///
/// Fails with [`Error::NotInitialized`] if [`init_thread_heap`] was not
/// called on this thread.
pub fn with_thread_heap<R>(f: impl FnOnce(&mut ThreadHeap) -> R) -> Result<R> {
    THREAD_HEAP.with(|slot| match slot.borrow_mut().as_mut() {
        Some(heap) => Ok(f(heap)),
        None => Err(Error::NotInitialized),
    })
}

/// Drops the calling thread's heap. Returns whether one was installed.
pub fn shutdown_thread_heap() -> bool {
    THREAD_HEAP.with(|slot| slot.borrow_mut().take()).is_some()
}
