use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A shared flag used to abandon a blocking wait from another thread.
///
/// Waits that accept a token re-check it at least once per lock poll interval
/// and fail with [`IsoprobeError::InterruptedWait`](crate::IsoprobeError::InterruptedWait)
/// once it is set.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
