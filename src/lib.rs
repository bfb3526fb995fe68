//! vmem - reusable virtual-memory reservations and a page-granular offset
//! allocator.
//!
//! # Quick Start
//!
//! ```no_run
//! use vmem::prelude::*;
//!
//! let vm = vmem::init().unwrap();
//!
//! // Reserve 64 MiB, commit the first 1 MiB.
//! let ptr = vm.allocate(64 << 20, 1 << 20, 4096).unwrap();
//! unsafe { vm.release(ptr).unwrap() };
//!
//! // Hand out page-sized slots of a 1 MiB descriptor region.
//! let mut heap = OffsetAllocator::with_capacity(vm.clone(), 1 << 20, 4096).unwrap();
//! let offset = heap.allocate(3 * 4096).unwrap();
//! assert!(heap.release(offset));
//! ```
//!
//! # Features
//!
//! - **Reservation reuse**: released blocks keep their address range and are
//!   handed out again before the OS is asked for more
//! - **Embedded headers**: every allocation carries its size and alignment
//!   just below the returned pointer
//! - **Offset allocation**: first-fit page ranges with coalescing on release
//! - **Thread heaps**: lazily committed per-thread bump allocation
//! - **Telemetry**: counters for reservations, reuse and commit traffic

#![warn(missing_debug_implementations)]

pub mod align;
pub mod config;
pub mod error;
pub mod memory;
pub mod prelude;
pub mod runtime;
pub mod telemetry;

pub use config::{Config, ConfigBuilder, FailurePolicy};
pub use error::{Error, Result};
pub use memory::{OffsetAllocator, Range, ThreadHeap, VirtualMemory};
pub use runtime::{global, init, init_with_config, shutdown};
