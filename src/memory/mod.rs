//! Virtual memory reservations and the allocators built on top of them.

pub mod offset;
pub mod os;
pub mod thread_heap;
pub mod virtual_alloc;

mod header;

pub use offset::{OffsetAllocator, Range};
pub use os::{system_info, CpuArchitecture, SystemInfo};
pub use thread_heap::{init_thread_heap, shutdown_thread_heap, with_thread_heap, Bookmark, ThreadHeap};
pub use virtual_alloc::VirtualMemory;
