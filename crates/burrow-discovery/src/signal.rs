//! Cancellation for background loops and suspended waiters.

use std::time::Duration;
use tokio::sync::watch;

/// Owner side of a cancellation flag.
#[derive(Debug)]
pub struct Cancel {
    tx: watch::Sender<bool>,
}

impl Cancel {
    /// A flag that is not yet raised.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Raise the flag. Returns `true` only for the call that raised it.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|raised| !std::mem::replace(raised, true))
    }

    /// Whether the flag is raised.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// A handle that observes the flag.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Cancel {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a [`Cancel`].
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Whether the flag is raised.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the flag is raised or its owner is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // An error means the owner was dropped, which counts as cancelled.
        let _ = rx.wait_for(|raised| *raised).await;
    }

    /// Sleep for `duration`. Returns `false` if cancelled first.
    pub async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => !self.is_cancelled(),
            () = self.cancelled() => false,
        }
    }
}
