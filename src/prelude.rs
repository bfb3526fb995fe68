pub use crate::align::{align_down, align_up, is_aligned, Align};
pub use crate::config::{Config, ConfigBuilder, FailurePolicy};
pub use crate::error::{Error, Result};
pub use crate::memory::{OffsetAllocator, Range, SystemInfo, ThreadHeap, VirtualMemory};
pub use crate::telemetry::MetricsSnapshot;
pub use crate::{global, init, init_with_config, shutdown};
