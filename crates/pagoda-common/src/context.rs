//! Execution context and cooperative cancellation
//!
//! Long-running background work (GC sweeps, snapshot copies) receives an
//! [`ExecutionContext`] and polls it between units of work. Cancellation is
//! never forced; a unit that has started runs to completion.

use crate::error::{Result, StorageFault};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared, atomically checked cancellation flag
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; every clone observes it
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Context passed down to cancellable operations
#[derive(Clone, Debug, Default)]
pub struct ExecutionContext {
    token: CancellationToken,
}

impl ExecutionContext {
    /// Context that never cancels on its own
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context bound to an existing token
    #[must_use]
    pub const fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Check whether work should stop
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail with [`StorageFault::Cancelled`] if work should stop
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StorageFault::Cancelled)
        } else {
            Ok(())
        }
    }
}
