use core::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

/**
   Create a linked cancellation pair.

   The [`CancelHandle`] is held by whoever owns the lifetime of the work;
   dropping it (or calling [`CancelHandle::cancel`]) cancels every clone of
   the [`CancelToken`]. Cancellation is signalled by channel disconnection,
   so it is observable from `crossbeam_channel::select!` arms as well as by
   polling.
*/
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = bounded::<()>(0);
    (CancelHandle { _tx: tx }, CancelToken { rx })
}

/// The owning side of a cancellation pair. Dropping it cancels the tokens.
pub struct CancelHandle {
    _tx: Sender<()>,
}

impl CancelHandle {
    /// Cancel every token linked to this handle.
    pub fn cancel(self) {
        drop(self);
    }
}

/// A cloneable token observed by every task spawned under one root.
#[derive(Clone)]
pub struct CancelToken {
    rx: Receiver<()>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `dur`, waking up early on cancellation.
    /// Returns `true` if the sleep was interrupted by cancellation.
    pub fn sleep(&self, dur: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(dur),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// The underlying receiver, for use in `select!` arms. The receive
    /// completes (with a disconnect error) exactly when the pair is
    /// cancelled.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}
