//! Telemetry for the allocators.
//!
//! Every [`VirtualMemory`](crate::memory::VirtualMemory) owns a [`Metrics`]
//! collector; log events go through the `tracing` macros.

pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};

/// Runs `f` with a subscriber that records every event, and returns the
/// formatted output.
#[cfg(test)]
pub(crate) fn capture_logs(f: impl FnOnce()) -> String {
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;

    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer(move || Capture(writer.clone()))
        .finish();

    tracing::subscriber::with_default(subscriber, f);

    let bytes = buffer.lock().clone();
    String::from_utf8_lossy(&bytes).into_owned()
}
