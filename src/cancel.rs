//! Cooperative cancellation tokens.
//!
//! A watch channel wearing a small API: the handle flips the flag once,
//! every token clone observes it, and `cancelled()` resolves for awaiters.

use tokio::sync::watch;

/// Create a linked handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// The cancelling side. Dropping the handle without cancelling leaves the
/// tokens un-cancelled forever.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// The observing side. Cheap to clone; share one per job.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is signalled. If the handle is dropped
    /// without cancelling, this pends forever.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// A token that never cancels, for call sites without a job attached.
    pub fn never() -> Self {
        static NEVER: std::sync::OnceLock<CancelToken> = std::sync::OnceLock::new();
        NEVER
            .get_or_init(|| {
                let (tx, rx) = watch::channel(false);
                // Keep the channel open for the life of the process.
                std::mem::forget(tx);
                CancelToken { rx }
            })
            .clone()
    }
}
