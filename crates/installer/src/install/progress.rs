use std::sync::atomic::{AtomicBool, Ordering};

/// Where the installer reports progress and polls for cancellation. The
/// pipeline workers call `is_cancelled` on their hot path, so it should be
/// cheap.
pub trait ProgressSink: Send + Sync {
    /// A new named transfer (one per content, plus the db/record steps).
    fn new_transfer(&self, _name: &str) {}
    /// Written-bytes / total-bytes of the current transfer.
    fn transfer(&self, _written: i64, _total: i64) {}
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Sink that ignores everything and never cancels.
pub struct NullProgress;

impl ProgressSink for NullProgress {}

/// Minimal cancellable sink: shares a flag the caller can set from another
/// thread.
#[derive(Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl ProgressSink for CancelToken {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
