//! Cooperative cancellation and worker-pool error collection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{Error, Result};

/// Cancellation signal shared by the walker, the tar-partition queue and the
/// WAL tail reader. Cancellation is one-way; a cancelled token stays
/// cancelled.
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

    /// Fail fast at a cooperative checkpoint.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        Ok(())
    }
}

/// First-error-wins collector for a pool of workers. Recording an error
/// cancels the shared token so sibling workers stop at their next checkpoint.
#[derive(Debug)]
pub struct ErrorGroup {
    first: Mutex<Option<anyhow::Error>>,
    cancel: CancelToken,
}

impl ErrorGroup {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            first: Mutex::new(None),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Record a worker failure. Later errors are dropped; cancellation
    /// errors never displace a real cause.
    pub fn record(&self, err: anyhow::Error) {
        let mut slot = self.first.lock();
        let is_cancel = matches!(err.downcast_ref::<Error>(), Some(Error::Cancelled));
        if slot.is_none() && !is_cancel {
            *slot = Some(err);
        }
        drop(slot);
        self.cancel.cancel();
    }

    pub fn is_failed(&self) -> bool {
        self.first.lock().is_some()
    }

    /// Take the first recorded error, if any. A cancelled group with no
    /// recorded cause yields [`Error::Cancelled`].
    pub fn into_result(self) -> Result<()> {
        match self.first.into_inner() {
            Some(err) => Err(err),
            None if self.cancel.is_cancelled() => Err(Error::Cancelled.into()),
            None => Ok(()),
        }
    }
}

/// Counted barrier for in-flight background work, in the shape of the
/// uploader's finish semantics.
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: Mutex<usize>,
    zero: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self) {
        *self.count.lock() += 1;
    }

    pub fn done(&self) {
        let mut count = self.count.lock();
        debug_assert!(*count > 0, "WaitGroup::done without matching add");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }
}
