use std::ptr::NonNull;
use std::sync::{Arc, Barrier};
use tracing_subscriber::EnvFilter;
use vmem::prelude::*;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn vm() -> Arc<VirtualMemory> {
    Arc::new(VirtualMemory::new(Config::default()).unwrap())
}

#[test]
fn test_allocations_honour_alignment() {
    init_tracing();
    let vm = vm();
    let granularity = vm.allocation_granularity();

    let mut alignment = 1;
    while alignment <= granularity {
        for size in [1, 100, 4096, 70_000] {
            let ptr = vm.allocate(size, size, alignment).unwrap();
            assert_eq!(ptr.as_ptr() as usize % alignment, 0);
            unsafe {
                ptr.as_ptr().write_bytes(0x5A, size);
                vm.release(ptr).unwrap();
            }
        }
        alignment *= 2;
    }
}

#[test]
fn test_smaller_allocation_reuses_released_range() {
    init_tracing();
    let vm = vm();

    let first = vm.allocate(1000, 1000, 8).unwrap();
    unsafe { vm.release(first).unwrap() };

    let second = vm.allocate(500, 500, 8).unwrap();
    let start = first.as_ptr() as usize;
    let addr = second.as_ptr() as usize;
    assert!(addr >= start && addr + 500 <= start + 1000);

    let metrics = vm.metrics();
    assert_eq!(metrics.reservations, 1);
    assert_eq!(metrics.reuses, 1);

    unsafe { vm.force_release_to_os(second).unwrap() };
    assert_eq!(vm.free_list_len(), 0);
}

#[test]
fn test_round_trip_returns_same_pointer() {
    init_tracing();
    let vm = vm();

    let ptr = vm.allocate(1 << 20, 4096, 64).unwrap();
    unsafe { vm.release(ptr).unwrap() };
    let again = vm.allocate(1 << 20, 4096, 64).unwrap();
    assert_eq!(ptr, again);

    unsafe { vm.release(again).unwrap() };
}

#[test]
fn test_invalid_handles_are_reported() {
    init_tracing();
    let vm = vm();

    let ptr = vm.allocate(4096, 4096, 16).unwrap();
    unsafe {
        vm.release(ptr).unwrap();
        assert!(vm.release(ptr).unwrap_err().is_invalid_handle());
        assert!(vm.force_release_to_os(ptr).unwrap_err().is_invalid_handle());
    }
    assert_eq!(vm.metrics().failures, 2);
}

#[test]
fn test_alignment_above_granularity_is_rejected() {
    init_tracing();
    let vm = vm();
    let too_large = vm.allocation_granularity() * 2;

    assert!(matches!(
        vm.allocate(4096, 0, too_large),
        Err(Error::AlignmentTooLarge { .. })
    ));
}

#[test]
fn test_offset_allocator_scenario() {
    init_tracing();
    let vm = vm();
    let page = 4096;
    let mut heap = OffsetAllocator::with_capacity(vm.clone(), 16 * page, page).unwrap();

    assert_eq!(heap.allocate(3 * page).unwrap(), 13);
    assert_eq!(heap.allocate(2 * page).unwrap(), 11);

    assert!(heap.release(13));
    let mut free = heap.free_ranges().to_vec();
    free.sort_by_key(|range| range.offset);
    assert_eq!(free, vec![Range::new(0, 11), Range::new(13, 3)]);

    assert!(heap.release(11));
    assert_eq!(heap.free_ranges(), &[Range::new(0, 16)]);

    heap.shutdown();
    assert_eq!(vm.free_list_len(), 1);
}

#[test]
fn test_offset_allocators_share_metadata_reservations() {
    init_tracing();
    let vm = vm();

    let first = OffsetAllocator::with_capacity(vm.clone(), 1 << 20, 4096).unwrap();
    drop(first);
    let _second = OffsetAllocator::with_capacity(vm.clone(), 1 << 20, 4096).unwrap();

    let metrics = vm.metrics();
    assert_eq!(metrics.reservations, 1);
    assert_eq!(metrics.reuses, 1);
}

#[test]
fn test_offset_allocator_exhaustion() {
    init_tracing();
    let mut heap = OffsetAllocator::with_capacity(vm(), 8 * 256, 256).unwrap();

    for _ in 0..8 {
        heap.allocate(256).unwrap();
    }
    assert!(heap.allocate(256).unwrap_err().is_out_of_memory());
    assert_eq!(heap.free_page_count(), 0);
    assert_eq!(heap.used_page_count(), 8);
}

#[test]
fn test_thread_heaps_on_worker_threads() {
    init_tracing();
    let config = Config::builder()
        .thread_heap_reserve(16 << 20)
        .thread_heap_initial_commit(64 * 1024)
        .build()
        .unwrap();
    let vm = Arc::new(VirtualMemory::new(config).unwrap());
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let vm = vm.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                vmem::memory::init_thread_heap(&vm).unwrap();
                // Keep every heap alive until all four are reserved.
                barrier.wait();

                vmem::memory::with_thread_heap(|heap| {
                    let mark = heap.bookmark();
                    for _ in 0..1000 {
                        let ptr = heap.allocate(256, 16).unwrap();
                        unsafe { ptr.as_ptr().write_bytes(i as u8, 256) };
                    }
                    heap.reset_to(mark);
                    heap.reset().unwrap();
                    heap.committed()
                })
                .unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 64 * 1024);
    }

    // Heaps are dropped with their threads.
    assert_eq!(vm.free_list_len(), 4);
    assert_eq!(vm.metrics().reservations, 4);
}

#[test]
fn test_global_allocator() {
    init_tracing();
    vmem::shutdown();
    assert!(matches!(vmem::global(), Err(Error::NotInitialized)));

    let vm = vmem::init().unwrap();
    let ptr = vmem::global().unwrap().allocate(4096, 4096, 8).unwrap();
    unsafe { vm.release(ptr).unwrap() };
    assert_eq!(vm.free_list_len(), 1);

    vmem::shutdown();
}

#[test]
fn test_trim_returns_everything_to_os() {
    init_tracing();
    let vm = vm();
    let ptrs: Vec<NonNull<u8>> = (1..=8)
        .map(|i| vm.allocate(i * 4096, 0, 8).unwrap())
        .collect();

    for ptr in ptrs {
        unsafe { vm.release(ptr).unwrap() };
    }
    assert_eq!(vm.free_list_len(), 8);

    assert_eq!(vm.trim().unwrap(), 8);
    assert_eq!(vm.free_list_len(), 0);
    assert_eq!(vm.free_list_bytes(), 0);
}
