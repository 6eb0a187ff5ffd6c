//! Cooperative interrupt shared by every blocking wait
//!
//! One flag per process. The Ctrl+C handler triggers it; blocking code polls
//! [`StopFlag::is_stopped`], async code awaits [`StopFlag::stopped`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Returned by waits that were cut short by a user stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped;

#[derive(Clone, Default)]
pub struct StopFlag {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Returns `true` if this was the first request.
    pub fn trigger(&self) -> bool {
        let first = !self.inner.stopped.swap(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Stopped> {
        if self.is_stopped() { Err(Stopped) } else { Ok(()) }
    }

    /// Resolves once a stop has been requested
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration` unless a stop arrives first
    pub async fn sleep(&self, duration: Duration) -> Result<(), Stopped> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.check(),
            _ = self.stopped() => Err(Stopped),
        }
    }

    /// Blocking sleep in short slices so a stop is noticed promptly
    pub fn sleep_blocking(&self, duration: Duration) -> Result<(), Stopped> {
        const SLICE: Duration = Duration::from_millis(100);
        let deadline = std::time::Instant::now() + duration;
        loop {
            self.check()?;
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLICE.min(deadline - now));
        }
    }
}
