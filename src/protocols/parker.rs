//! Interruptible sleep for maintenance loops.

use std::time::Duration;
use tokio::sync::Notify;

/// At most one wake-up is remembered: any number of `unpark` calls made
/// while nobody is parked shorten exactly one following `park_timeout`.
#[derive(Debug, Default)]
pub struct Parker {
    notify: Notify,
}

impl Parker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep until `timeout` elapses or `unpark` is called. Returns true
    /// when woken early.
    pub async fn park_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }

    pub fn unpark(&self) {
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_unpark() {
        let parker = Parker::new();
        assert!(!parker.park_timeout(Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparks_coalesce() {
        let parker = Parker::new();
        parker.unpark();
        parker.unpark();
        parker.unpark();
        assert!(parker.park_timeout(Duration::from_secs(60)).await);
        // the extra unparks did not queue up
        assert!(!parker.park_timeout(Duration::from_secs(60)).await);
    }
}
