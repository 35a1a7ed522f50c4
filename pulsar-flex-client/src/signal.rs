//! Session-scoped notification for sends parked on the producer

use std::time::Duration;
use tokio::sync::watch;

/// Generation counter bumped whenever the session changes in a way a parked
/// send cares about: a registration attempt settles, the producer closes, or
/// another send is written or finishes.
///
/// A waiter records the generation before it issues a request and, after a
/// failure, waits for any later generation. Because the counter only grows, a
/// signal fired between the failure and the wait is never missed, and each
/// waiter is released at most once per wait.
#[derive(Debug)]
pub struct ActivationSignal {
    tx: watch::Sender<u64>,
}

impl Default for ActivationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivationSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Release every waiter parked on an earlier generation
    pub fn fire(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    /// Wait until the generation is newer than `seen`. Returns false if
    /// `limit` elapses first.
    pub async fn wait_after(&self, seen: u64, limit: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let waited = tokio::time::timeout(limit, rx.wait_for(|generation| *generation > seen)).await;
        matches!(waited, Ok(Ok(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fire_before_wait_is_not_missed() {
        let signal = ActivationSignal::new();
        let seen = signal.generation();
        signal.fire();

        assert!(signal.wait_after(seen, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_times_out_without_fire() {
        let signal = ActivationSignal::new();
        let seen = signal.generation();

        assert!(!signal.wait_after(seen, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_all_waiters_released() {
        let signal = Arc::new(ActivationSignal::new());
        let seen = signal.generation();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move { signal.wait_after(seen, Duration::from_secs(5)).await })
            })
            .collect();

        tokio::task::yield_now().await;
        signal.fire();

        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
        assert_eq!(signal.generation(), seen + 1);
    }
}
