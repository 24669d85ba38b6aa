//! Cooperative cancellation for running pipelines
//!
//! A pipeline is stopped only at batch boundaries: a task finishes the batch
//! it is processing, then checks the token before taking the next one.
//! Batches it has not yet processed are returned to their channel.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Shared flag asking a pipeline to stop.
///
/// Clones observe the same state, so a token taken from a
/// [`TaskPool`](crate::TaskPool) before `run` can stop it from another thread.
///
/// # Example
///
/// ```
/// use outcore_scheduler::CancellationToken;
///
/// let token = CancellationToken::new();
/// let observer = token.clone();
///
/// token.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token in the non-cancelled state
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation has been requested on this token or any clone
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Clear the flag so the pipeline can be resumed with another `run`.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
