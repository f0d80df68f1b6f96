// ABOUTME: Cancellable capability for in-flight work units.
// ABOUTME: Implemented for cancellation tokens and tokio task handles.

use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

/// A handle to running work that can be asked to stop.
///
/// Cancellation is cooperative: `cancel` only signals, it does not wait for
/// the work to unwind.
pub trait Cancellable: Send + Sync {
    /// Signal the work to stop.
    fn cancel(&self);

    /// Whether the work has stopped or been told to stop.
    fn is_done(&self) -> bool;
}

impl Cancellable for CancellationToken {
    fn cancel(&self) {
        CancellationToken::cancel(self);
    }

    fn is_done(&self) -> bool {
        self.is_cancelled()
    }
}

impl<T: Send + 'static> Cancellable for JoinHandle<T> {
    fn cancel(&self) {
        self.abort();
    }

    fn is_done(&self) -> bool {
        self.is_finished()
    }
}

impl Cancellable for AbortHandle {
    fn cancel(&self) {
        self.abort();
    }

    fn is_done(&self) -> bool {
        self.is_finished()
    }
}
