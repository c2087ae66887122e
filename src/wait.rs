//! Bounded polling.
//!
//! The probe is first invoked one interval after the call, then once per
//! interval until it reports success, returns an error, or the timeout has
//! elapsed. A probe error is never retried: probes must map transient
//! negatives (connection refused, EOF, ...) to `Ok(false)`.
//!
//! The deadline is checked after each attempt, so a zero timeout still makes
//! exactly one attempt before reporting [`Error::Timeout`]. Callers wanting an
//! effectively unbounded wait pass a large timeout.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct Poller {
    interval: Duration,
}

impl Default for Poller {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl Poller {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll `probe` until it returns `Ok(true)`, an error, or `timeout` passes.
    pub fn poll<F>(&self, timeout: Duration, mut probe: F) -> Result<bool>
    where
        F: FnMut() -> Result<bool>,
    {
        let start = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            std::thread::sleep(self.interval);
            attempts += 1;

            if probe()? {
                trace!(attempts, elapsed = ?start.elapsed(), "probe succeeded");
                return Ok(true);
            }

            if start.elapsed() >= timeout {
                trace!(attempts, "probe timed out");
                return Err(Error::Timeout(timeout));
            }
        }
    }
}

/// Poll `probe` on the default 500 ms cadence.
pub fn until_true<F>(timeout: Duration, probe: F) -> Result<bool>
where
    F: FnMut() -> Result<bool>,
{
    Poller::default().poll(timeout, probe)
}

/// Wait for a single result produced elsewhere, bounded by `timeout`.
///
/// A dropped sender counts as "finished without success".
pub fn until_done(timeout: Duration, rx: &Receiver<Result<bool>>) -> Result<bool> {
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => Ok(false),
    }
}
