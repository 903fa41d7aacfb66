//! Cancellation signals.
//!
//! Long-running operations take a `watch::Receiver<bool>`; sending `true`
//! cancels them. A dropped sender never cancels.

use tokio::sync::watch;

/// Receiving side of a cancellation signal.
pub type CancelSignal = watch::Receiver<bool>;

/// Create a cancellation pair. Send `true` on the sender to cancel.
pub fn cancel_pair() -> (watch::Sender<bool>, CancelSignal) {
    watch::channel(false)
}

/// A signal that is never cancelled.
pub fn never() -> CancelSignal {
    let (tx, rx) = watch::channel(false);
    drop(tx);
    rx
}

/// Whether cancellation has already been requested.
pub fn is_cancelled(signal: &CancelSignal) -> bool {
    *signal.borrow()
}

/// Resolve once `true` has been sent. Pends forever if the sender is gone.
pub async fn cancelled(signal: &mut CancelSignal) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
