//! Request-scoped cancellation and deadline.
//!
//! The core is synchronous: every backend call blocks the calling worker. A
//! [`RequestContext`] is threaded through each of those calls so that a caller
//! timeout or an explicit cancel stops further backend work, and so backend
//! clients can bound their own I/O with [`RequestContext::remaining`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::BtcError;

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl RequestContext {
    /// A context with no deadline that is only stopped by [`cancel`](Self::cancel).
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancels this context and every clone of it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fails if the request was cancelled or its deadline has passed.
    pub fn check(&self) -> Result<(), BtcError> {
        if self.is_cancelled() {
            return Err(BtcError::BackendUnavailable("request cancelled".into()));
        }
        if matches!(self.remaining(), Some(left) if left.is_zero()) {
            return Err(BtcError::BackendUnavailable(
                "request deadline exceeded".into(),
            ));
        }
        Ok(())
    }
}
