use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{Error, Result};

/// One-shot, many-waiter flag.
///
/// Goes from pending to raised exactly once; every current and future waiter
/// then returns immediately.
#[derive(Debug)]
pub struct CompletionSignal {
    owner: String,
    raised: Mutex<bool>,
    cond: Condvar,
}

impl CompletionSignal {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            raised: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.raised.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raise the signal. Raising it a second time is an error.
    pub fn raise(&self) -> Result<()> {
        let mut raised = self.lock();
        if *raised {
            return Err(Error::SignalAlreadyRaised(self.owner.clone()));
        }
        *raised = true;
        self.cond.notify_all();
        Ok(())
    }

    pub fn is_raised(&self) -> bool {
        *self.lock()
    }

    /// Block until raised.
    pub fn wait(&self) {
        let guard = self.lock();
        let _raised = self
            .cond
            .wait_while(guard, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Block until raised or `timeout` passes; true if raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (raised, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
        *raised
    }
}
