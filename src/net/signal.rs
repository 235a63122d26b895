//! One-shot cancellation signal.
//!
//! A [`CancelSignal`] is owned by the object whose lifetime it tracks (a fan-in
//! listener, a channel connection). Observers get a [`Done`] handle that can be
//! checked or awaited but cannot fire the signal.

use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

/// Monotonic, fire-once cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    /// Create an unfired signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns `true` only for the call that actually fired it.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    /// Whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal fires.
    pub async fn cancelled(&self) {
        self.done().wait().await
    }

    /// An observe-only handle to this signal.
    pub fn done(&self) -> Done {
        Done {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Observe-only side of a [`CancelSignal`].
#[derive(Debug, Clone)]
pub struct Done {
    rx: watch::Receiver<bool>,
}

impl Done {
    /// A handle that never fires, for callers with nothing to cancel.
    pub fn never() -> Self {
        // The sender must outlive every receiver, otherwise `wait` resolves.
        static NEVER: OnceLock<watch::Sender<bool>> = OnceLock::new();
        let tx = NEVER.get_or_init(|| watch::channel(false).0);
        Self { rx: tx.subscribe() }
    }

    /// Whether the signal has fired.
    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the signal fires.
    ///
    /// Also resolves when every owner of the signal has been dropped, since
    /// nothing could fire it anymore.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|fired| *fired).await;
    }
}
