use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

pub const SAVE_DEBOUNCE_INTERVAL: Duration = Duration::from_millis(500);

/// Trailing-edge debouncer with a single pending slot.
///
/// Scheduling aborts whatever is pending, so at most one delayed action survives a
/// burst and it is the one scheduled last.
pub struct SaveDebouncer {
    interval: Duration,
    pending: Option<JoinHandle<()>>,
}

impl SaveDebouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: None,
        }
    }

    pub fn schedule<F>(&mut self, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let interval = self.interval;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            action.await;
        }));
    }

    /// Drops the pending action. Returns true if one had not fired yet.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Default for SaveDebouncer {
    fn default() -> Self {
        Self::new(SAVE_DEBOUNCE_INTERVAL)
    }
}

impl Drop for SaveDebouncer {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}
