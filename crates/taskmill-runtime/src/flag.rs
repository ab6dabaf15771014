use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct Shared {
    raised: AtomicBool,
    notify: Notify,
}

/// A one-shot async flag used for cooperative shutdown.
///
/// Raising the flag wakes every waiter; `wait` returns immediately once the
/// flag is up. Components check `is_raised` between atomic units of work and
/// select on `wait` while sleeping.
#[derive(Clone)]
pub struct ShutdownFlag(Arc<Shared>);

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(Shared {
            raised: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn raise(&self) {
        self.0.raised.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.0.raised.load(Ordering::Acquire)
    }

    /// Resolve once the flag is raised.
    pub async fn wait(&self) {
        loop {
            if self.is_raised() {
                return;
            }

            // Register interest before re-checking so a raise() between the
            // check and the await cannot be missed.
            let notified = self.0.notify.notified();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn wait_resolves_after_raise() {
        let flag = ShutdownFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        flag.raise();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn wait_after_raise_is_immediate() {
        let flag = ShutdownFlag::new();
        flag.raise();
        flag.wait().await;
        assert!(flag.is_raised());
    }
}
