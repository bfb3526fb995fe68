//! Page-granular offset allocator over a fixed-size region.
//!
//! The region is split into `page_count` pages. Free space is tracked as a
//! set of coalesced [`Range`]s; every outstanding allocation is one used
//! range. Both sets live in a single metadata block obtained from
//! [`VirtualMemory`], sized for the worst case of one range per page.
//!
//! Allocation scans the free ranges from the back and carves the request off
//! the high end of the first range that fits. Releasing puts the range back
//! into the free set, merging it with any neighbour it touches.
//!
//! An `OffsetAllocator` has a single owner: every mutating call takes
//! `&mut self`. Share it across threads behind a lock.

use super::virtual_alloc::VirtualMemory;
use crate::align::div_ceil;
use crate::error::{Error, Result};
use std::fmt;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::Arc;

/// A contiguous span of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Range {
    pub offset: usize,
    pub count: usize,
}

impl Range {
    pub const fn new(offset: usize, count: usize) -> Self {
        Self { offset, count }
    }

    /// One past the last page of the range.
    #[inline]
    pub const fn end(&self) -> usize {
        self.offset + self.count
    }

    #[inline]
    pub fn overlaps(&self, other: &Range) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Two ranges can merge when one ends exactly where the other starts.
    #[inline]
    pub fn can_merge(&self, other: &Range) -> bool {
        debug_assert!(
            !self.overlaps(other),
            "overlapping ranges {:?} and {:?}",
            self,
            other
        );
        self.end() == other.offset || other.end() == self.offset
    }

    pub fn merge(&self, other: &Range) -> Option<Range> {
        if !self.can_merge(other) {
            return None;
        }

        Some(Range {
            offset: self.offset.min(other.offset),
            count: self.count + other.count,
        })
    }
}

/// Fixed-capacity array of ranges with O(1) swap removal.
struct RangeList {
    slots: NonNull<Range>,
    capacity: usize,
    len: usize,
}

impl RangeList {
    fn as_slice(&self) -> &[Range] {
        // SAFETY: slots[..len] are initialized and owned by the table.
        unsafe { std::slice::from_raw_parts(self.slots.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [Range] {
        // SAFETY: see as_slice.
        unsafe { std::slice::from_raw_parts_mut(self.slots.as_ptr(), self.len) }
    }

    fn push(&mut self, range: Range) {
        assert!(self.len < self.capacity, "range list overflow");
        // SAFETY: len < capacity.
        unsafe { self.slots.as_ptr().add(self.len).write(range) };
        self.len += 1;
    }

    /// Removes the range at `index` by moving the last range into its slot.
    fn swap_remove(&mut self, index: usize) -> Range {
        let last = self.len - 1;
        let slice = self.as_mut_slice();
        let removed = slice[index];
        slice[index] = slice[last];
        self.len = last;
        removed
    }

    /// Inserts `range`, merging it into a neighbour when possible.
    fn insert_coalescing(&mut self, range: Range) {
        let merged = self
            .as_slice()
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, existing)| existing.merge(&range).map(|m| (i, m)));

        match merged {
            Some((i, m)) => self.as_mut_slice()[i] = m,
            None => self.push(range),
        }

        self.coalesce();
    }

    /// Merges adjacent pairs until none are left.
    fn coalesce(&mut self) {
        'scan: loop {
            for i in (1..self.len).rev() {
                for j in (0..i).rev() {
                    let ranges = self.as_mut_slice();
                    if let Some(m) = ranges[j].merge(&ranges[i]) {
                        ranges[j] = m;
                        self.swap_remove(i);
                        continue 'scan;
                    }
                }
            }
            break;
        }
    }
}

/// Metadata block holding the free and used range lists.
struct RangeTable {
    block: NonNull<u8>,
    page_size: usize,
    page_count: usize,
    free: RangeList,
    used: RangeList,
}

enum State {
    Uninitialized,
    Initialized(RangeTable),
    Shutdown,
}

pub struct OffsetAllocator {
    vm: Arc<VirtualMemory>,
    state: State,
}

// SAFETY: the range table exclusively owns its metadata block.
unsafe impl Send for OffsetAllocator {}

impl OffsetAllocator {
    /// Creates an uninitialized allocator drawing metadata from `vm`.
    pub fn new(vm: Arc<VirtualMemory>) -> Self {
        Self {
            vm,
            state: State::Uninitialized,
        }
    }

    /// Creates and initializes an allocator in one step.
    pub fn with_capacity(vm: Arc<VirtualMemory>, byte_size: usize, page_size: usize) -> Result<Self> {
        let mut allocator = Self::new(vm);
        allocator.initialize(byte_size, page_size)?;
        Ok(allocator)
    }

    /// Divides `byte_size` bytes into `page_size` pages, all free.
    ///
    /// Fails with [`Error::AlreadyInitialized`] on an initialized allocator
    /// and with [`Error::Shutdown`] once it has been shut down.
    pub fn initialize(&mut self, byte_size: usize, page_size: usize) -> Result<()> {
        match self.state {
            State::Uninitialized => {}
            State::Initialized(_) => return self.vm.fail(Error::AlreadyInitialized),
            State::Shutdown => return self.vm.fail(Error::Shutdown),
        }

        if page_size == 0 || byte_size == 0 {
            return self.vm.fail(Error::invalid_argument(format!(
                "cannot divide {} bytes into pages of {} bytes",
                byte_size, page_size
            )));
        }

        let page_count = div_ceil(byte_size, page_size);
        if page_count == 0 {
            return self
                .vm
                .fail(Error::invalid_argument("offset allocator needs at least one page"));
        }

        let metadata_size = match page_count
            .checked_mul(2)
            .and_then(|slots| slots.checked_mul(size_of::<Range>()))
        {
            Some(size) => size,
            None => return self.vm.fail(Error::OutOfMemory { requested: byte_size }),
        };

        let block = self
            .vm
            .allocate(metadata_size, metadata_size, align_of::<Range>())?;

        // SAFETY: the block is committed and holds 2 * page_count ranges.
        let (free_slots, used_slots) = unsafe {
            std::ptr::write_bytes(block.as_ptr(), 0, metadata_size);
            let free = block.cast::<Range>();
            let used = NonNull::new_unchecked(free.as_ptr().add(page_count));
            (free, used)
        };

        let mut free = RangeList {
            slots: free_slots,
            capacity: page_count,
            len: 0,
        };
        free.push(Range::new(0, page_count));

        let used = RangeList {
            slots: used_slots,
            capacity: page_count,
            len: 0,
        };

        tracing::debug!(page_count, page_size, metadata_size, "offset allocator initialized");

        self.state = State::Initialized(RangeTable {
            block,
            page_size,
            page_count,
            free,
            used,
        });
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, State::Initialized(_))
    }

    /// Releases the metadata block and forgets every range.
    ///
    /// Outstanding allocations are not checked. Calling this more than once is
    /// harmless; the allocator cannot be initialized again afterwards.
    pub fn shutdown(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Shutdown);
        if let State::Initialized(table) = state {
            if table.used.len > 0 {
                tracing::debug!(
                    outstanding = table.used.len,
                    "offset allocator shut down with live allocations"
                );
            }

            // SAFETY: the block came from this allocator's vm and nothing
            // references it once the table is gone.
            if let Err(err) = unsafe { self.vm.release(table.block) } {
                tracing::warn!(error = %err, "failed to release offset allocator metadata");
            }
        }
    }

    /// Allocates `byte_size` bytes, rounded up to whole pages.
    ///
    /// Returns the page offset of the allocation. Fails with
    /// [`Error::OutOfMemory`] when no free range is large enough.
    pub fn allocate(&mut self, byte_size: usize) -> Result<usize> {
        let table = match &mut self.state {
            State::Initialized(table) => table,
            State::Uninitialized => return self.vm.fail(Error::NotInitialized),
            State::Shutdown => return self.vm.fail(Error::Shutdown),
        };

        if byte_size == 0 {
            return self
                .vm
                .fail(Error::invalid_argument("cannot allocate zero bytes"));
        }

        let required = div_ceil(byte_size, table.page_size);
        if required > table.page_count {
            tracing::warn!(
                requested_pages = required,
                page_count = table.page_count,
                "allocation larger than the offset allocator"
            );
            return self.vm.fail(Error::OutOfMemory { requested: byte_size });
        }

        let hit = table
            .free
            .as_slice()
            .iter()
            .rposition(|range| range.count >= required);

        let Some(index) = hit else {
            tracing::warn!(
                requested_pages = required,
                free_ranges = table.free.len,
                "offset allocator exhausted"
            );
            return self.vm.fail(Error::OutOfMemory { requested: byte_size });
        };

        let range = &mut table.free.as_mut_slice()[index];
        let offset = range.end() - required;
        range.count -= required;
        if range.count == 0 {
            table.free.swap_remove(index);
        }

        table.used.push(Range::new(offset, required));

        tracing::trace!(offset, pages = required, "offset allocated");
        Ok(offset)
    }

    /// Returns the allocation starting at page `offset` to the free set.
    ///
    /// Returns `false` if no live allocation starts at `offset`.
    pub fn release(&mut self, offset: usize) -> bool {
        let State::Initialized(table) = &mut self.state else {
            tracing::debug!(offset, "release on an offset allocator that is not initialized");
            return false;
        };

        let Some(index) = table
            .used
            .as_slice()
            .iter()
            .position(|range| range.offset == offset)
        else {
            tracing::debug!(offset, "release of unknown offset");
            return false;
        };

        let range = table.used.swap_remove(index);
        table.free.insert_coalescing(range);

        tracing::trace!(offset, pages = range.count, "offset released");
        true
    }

    /// Byte size of the live allocation starting at page `offset`.
    pub fn allocation_size(&self, offset: usize) -> Option<usize> {
        let table = self.table()?;
        table
            .used
            .as_slice()
            .iter()
            .find(|range| range.offset == offset)
            .map(|range| range.count * table.page_size)
    }

    /// Converts a page offset to a byte offset into the region.
    pub fn byte_offset(&self, offset: usize) -> usize {
        offset * self.page_size()
    }

    pub fn page_size(&self) -> usize {
        self.table().map_or(0, |table| table.page_size)
    }

    pub fn page_count(&self) -> usize {
        self.table().map_or(0, |table| table.page_count)
    }

    pub fn free_ranges(&self) -> &[Range] {
        self.table().map_or(&[], |table| table.free.as_slice())
    }

    pub fn used_ranges(&self) -> &[Range] {
        self.table().map_or(&[], |table| table.used.as_slice())
    }

    pub fn free_page_count(&self) -> usize {
        self.free_ranges().iter().map(|range| range.count).sum()
    }

    pub fn used_page_count(&self) -> usize {
        self.used_ranges().iter().map(|range| range.count).sum()
    }

    fn table(&self) -> Option<&RangeTable> {
        match &self.state {
            State::Initialized(table) => Some(table),
            _ => None,
        }
    }
}

impl fmt::Debug for OffsetAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffsetAllocator")
            .field("initialized", &self.is_initialized())
            .field("page_size", &self.page_size())
            .field("page_count", &self.page_count())
            .field("free_ranges", &self.free_ranges())
            .field("used_ranges", &self.used_ranges().len())
            .finish()
    }
}

impl Drop for OffsetAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    const PAGE: usize = 256;

    fn vm() -> Arc<VirtualMemory> {
        Arc::new(VirtualMemory::new(Config::default()).unwrap())
    }

    fn paged(pages: usize) -> OffsetAllocator {
        OffsetAllocator::with_capacity(vm(), pages * PAGE, PAGE).unwrap()
    }

    fn sorted(ranges: &[Range]) -> Vec<Range> {
        let mut ranges = ranges.to_vec();
        ranges.sort_by_key(|range| range.offset);
        ranges
    }

    /// Free and used ranges tile the region with no overlap and no two
    /// adjacent free ranges.
    fn assert_consistent(allocator: &OffsetAllocator) {
        let mut all: Vec<(Range, bool)> = allocator
            .free_ranges()
            .iter()
            .map(|range| (*range, true))
            .chain(allocator.used_ranges().iter().map(|range| (*range, false)))
            .collect();
        all.sort_by_key(|(range, _)| range.offset);

        let mut cursor = 0;
        let mut previous_free = false;
        for (range, free) in all {
            assert!(range.count > 0);
            assert_eq!(range.offset, cursor, "gap or overlap at page {}", cursor);
            assert!(!(free && previous_free), "adjacent free ranges at page {}", cursor);
            cursor = range.end();
            previous_free = free;
        }
        assert_eq!(cursor, allocator.page_count());
    }

    #[test]
    fn test_range_merge() {
        let a = Range::new(0, 4);
        let b = Range::new(4, 6);
        assert_eq!(a.merge(&b), Some(Range::new(0, 10)));
        assert_eq!(b.merge(&a), Some(Range::new(0, 10)));
        assert_eq!(a.merge(&Range::new(5, 1)), None);
    }

    #[test]
    fn test_range_overlap() {
        assert!(Range::new(0, 4).overlaps(&Range::new(3, 2)));
        assert!(!Range::new(0, 4).overlaps(&Range::new(4, 2)));
        assert!(Range::new(2, 1).overlaps(&Range::new(0, 8)));
    }

    #[test]
    fn test_insert_adjacent_in_either_order() {
        let mut slots = [Range::default(); 4];
        for order in [[Range::new(0, 4), Range::new(4, 6)], [Range::new(4, 6), Range::new(0, 4)]] {
            let mut list = RangeList {
                slots: NonNull::new(slots.as_mut_ptr()).unwrap(),
                capacity: slots.len(),
                len: 0,
            };
            for range in order {
                list.insert_coalescing(range);
            }
            assert_eq!(list.as_slice(), &[Range::new(0, 10)]);
        }
    }

    #[test]
    fn test_insert_bridging_range_merges_three() {
        let mut slots = [Range::default(); 4];
        let mut list = RangeList {
            slots: NonNull::new(slots.as_mut_ptr()).unwrap(),
            capacity: slots.len(),
            len: 0,
        };
        list.insert_coalescing(Range::new(0, 2));
        list.insert_coalescing(Range::new(5, 3));
        assert_eq!(list.len, 2);

        list.insert_coalescing(Range::new(2, 3));
        assert_eq!(list.as_slice(), &[Range::new(0, 8)]);
    }

    #[test]
    fn test_scenario_carve_and_coalesce() {
        let mut allocator = paged(16);
        assert_eq!(allocator.page_count(), 16);

        assert_eq!(allocator.allocate(3 * PAGE).unwrap(), 13);
        assert_eq!(allocator.allocate(2 * PAGE).unwrap(), 11);
        assert_eq!(allocator.free_ranges(), &[Range::new(0, 11)]);

        assert!(allocator.release(13));
        assert_eq!(
            sorted(allocator.free_ranges()),
            vec![Range::new(0, 11), Range::new(13, 3)]
        );

        assert!(allocator.release(11));
        assert_eq!(allocator.free_ranges(), &[Range::new(0, 16)]);
        assert!(allocator.used_ranges().is_empty());
    }

    #[test]
    fn test_partial_page_rounds_up() {
        let mut allocator = paged(8);

        let offset = allocator.allocate(PAGE + 1).unwrap();
        assert_eq!(offset, 6);
        assert_eq!(allocator.allocation_size(offset), Some(2 * PAGE));
        assert_eq!(allocator.byte_offset(offset), 6 * PAGE);
    }

    #[test]
    fn test_byte_size_not_multiple_of_page() {
        let allocator = OffsetAllocator::with_capacity(vm(), 10 * PAGE + 1, PAGE).unwrap();
        assert_eq!(allocator.page_count(), 11);
        assert_eq!(allocator.free_page_count(), 11);
    }

    #[test]
    fn test_exhaustion() {
        let mut allocator = paged(4);
        let err = allocator.allocate(5 * PAGE).unwrap_err();
        assert!(err.is_out_of_memory());

        let mut allocator = paged(4);
        for _ in 0..4 {
            allocator.allocate(PAGE).unwrap();
        }
        assert!(allocator.free_ranges().is_empty());
        assert!(allocator.allocate(1).unwrap_err().is_out_of_memory());
    }

    #[test]
    fn test_oversized_allocation_is_out_of_memory() {
        let mut allocator = paged(16);

        assert!(allocator.allocate(usize::MAX).unwrap_err().is_out_of_memory());
        assert!(allocator.allocate(17 * PAGE).unwrap_err().is_out_of_memory());
        assert!(allocator.used_ranges().is_empty());
        assert_eq!(allocator.free_ranges(), &[Range::new(0, 16)]);

        assert_eq!(allocator.allocate(16 * PAGE).unwrap(), 0);
    }

    #[test]
    fn test_oversized_region_is_rejected() {
        let mut allocator = OffsetAllocator::new(vm());
        assert!(allocator.initialize(usize::MAX, 4096).unwrap_err().is_out_of_memory());
        assert!(allocator.initialize(usize::MAX, 1).unwrap_err().is_out_of_memory());
        assert!(!allocator.is_initialized());

        allocator.initialize(4 * PAGE, PAGE).unwrap();
        assert_eq!(allocator.page_count(), 4);
    }

    #[test]
    fn test_fill_and_drain_recovers_region() {
        let mut allocator = paged(32);

        let offsets: Vec<usize> = (0..32).map(|_| allocator.allocate(PAGE).unwrap()).collect();
        assert_eq!(allocator.used_ranges().len(), 32);
        assert!(allocator.free_ranges().is_empty());

        for offset in offsets.iter().step_by(2) {
            assert!(allocator.release(*offset));
        }
        assert_eq!(allocator.free_ranges().len(), 16);
        assert_consistent(&allocator);

        for offset in offsets.iter().skip(1).step_by(2) {
            assert!(allocator.release(*offset));
        }
        assert_eq!(allocator.free_ranges(), &[Range::new(0, 32)]);
    }

    #[test]
    fn test_release_unknown_offset_returns_false() {
        let mut allocator = paged(8);
        let offset = allocator.allocate(PAGE).unwrap();

        assert!(!allocator.release(offset + 1));
        assert!(allocator.release(offset));
        assert!(!allocator.release(offset));
    }

    #[test]
    fn test_lifecycle() {
        let vm = vm();
        let mut allocator = OffsetAllocator::new(vm.clone());
        assert!(!allocator.is_initialized());
        assert!(matches!(allocator.allocate(PAGE), Err(Error::NotInitialized)));
        assert!(!allocator.release(0));

        allocator.initialize(4 * PAGE, PAGE).unwrap();
        assert!(allocator.is_initialized());
        assert!(matches!(
            allocator.initialize(4 * PAGE, PAGE),
            Err(Error::AlreadyInitialized)
        ));

        allocator.allocate(PAGE).unwrap();
        allocator.shutdown();
        assert!(!allocator.is_initialized());
        assert_eq!(vm.free_list_len(), 1);

        allocator.shutdown();
        assert!(matches!(allocator.allocate(PAGE), Err(Error::Shutdown)));
        assert!(matches!(
            allocator.initialize(4 * PAGE, PAGE),
            Err(Error::Shutdown)
        ));
    }

    #[test]
    fn test_release_before_initialize_logs_at_debug() {
        let vm = vm();
        let logs = crate::telemetry::capture_logs(|| {
            let mut allocator = OffsetAllocator::new(vm.clone());
            assert!(!allocator.release(3));
        });

        assert!(logs.contains("DEBUG"), "{}", logs);
        assert!(!logs.contains("WARN"), "{}", logs);
    }

    #[test]
    fn test_invalid_arguments() {
        let mut allocator = OffsetAllocator::new(vm());
        assert!(allocator.initialize(0, PAGE).is_err());
        assert!(allocator.initialize(PAGE, 0).is_err());

        let mut allocator = paged(4);
        assert!(matches!(allocator.allocate(0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_random_sequences_keep_ranges_consistent() {
        let mut rng = Pcg64::seed_from_u64(0x5eed);

        for _ in 0..16 {
            let pages = rng.gen_range(1..128);
            let mut allocator = paged(pages);
            let mut live = Vec::new();

            for _ in 0..512 {
                if live.is_empty() || rng.gen_bool(0.55) {
                    let size = rng.gen_range(1..=PAGE * 6);
                    match allocator.allocate(size) {
                        Ok(offset) => live.push(offset),
                        Err(err) => assert!(err.is_out_of_memory()),
                    }
                } else {
                    let index = rng.gen_range(0..live.len());
                    assert!(allocator.release(live.swap_remove(index)));
                }
                assert_consistent(&allocator);
            }

            for offset in live.drain(..) {
                assert!(allocator.release(offset));
            }
            assert_eq!(allocator.free_ranges(), &[Range::new(0, pages)]);
        }
    }
}
