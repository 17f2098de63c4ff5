//! Cooperative cancellation for background loops.

use tokio::sync::watch;

/// Owner side of a shutdown flag. Triggering it (or dropping it) stops
/// every loop holding a matching [`ShutdownSignal`].
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Asks every subscribed loop to stop. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new listener for this flag.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener side of a [`Shutdown`]. Cheap to clone, one per loop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// `true` once the owner triggered or dropped the flag.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once shutdown is requested. A dropped owner counts as a
    /// request, so orphaned loops never outlive their service.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_wait_resolves_after_trigger() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        assert!(!signal.is_triggered());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .expect("wait should resolve");
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_wait_resolves_when_owner_dropped() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        drop(shutdown);

        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .expect("dropped owner should release waiters");
        assert!(signal.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_pends_without_trigger() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        let result = tokio::time::timeout(Duration::from_secs(5), signal.wait()).await;
        assert!(result.is_err());
        assert!(!shutdown.is_triggered());
    }
}
