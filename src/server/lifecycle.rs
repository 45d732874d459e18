//! Server-wide shutdown signal

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

/// One-shot shutdown signal shared by every task.
///
/// Raising it more than once is a no-op; only the first call reports `true`.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    raised: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Returns `true` only for the call that raised it.
    pub fn trigger(&self) -> bool {
        if self.raised.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal has been raised
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    /// Token for tasks that select on the signal
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
