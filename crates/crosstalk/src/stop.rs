//! Stopping in-flight inbound calls.
//!
//! The connection loop owns every dispatched call future through a
//! `FuturesUnordered`, which never gives a future back, so "drop it"
//! is not available as a cancellation path.  Instead, each streamer
//! drain races a one-shot stop signal: when the signal trips, the race
//! resolves against the drain, and the drain is dropped unpolled —
//! which drops the handler's stream in turn.

use futures::FutureExt;
use oneshot_fused_workaround as oneshot;

/// How a stoppable drain came to its end.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DrainOutcome {
    /// The work ran to completion on its own.
    Finished,
    /// The stop signal won the race; the work was dropped mid-way.
    Stopped,
}

/// Trips the stop signal of one in-flight call.
///
/// Dropping the handle without calling [`stop`](Self::stop) also stops
/// the work: a drain nobody tracks any more has no business running.
#[derive(Debug)]
pub(crate) struct StopHandle {
    /// Sending half of the stop signal.
    tx: oneshot::Sender<()>,
}

impl StopHandle {
    /// Stop the associated work at its next poll.
    ///
    /// Trips nothing if the work already finished.
    pub(crate) fn stop(self) {
        let _ = self.tx.send(());
    }
}

/// Wrap `work` so it can be stopped from outside.
///
/// Returns the handle and the racing future.  The signal is polled
/// before the work on every turn, so once it has tripped, `work` makes
/// no further progress.
pub(crate) fn stoppable<F>(work: F) -> (StopHandle, impl Future<Output = DrainOutcome>)
where
    F: Future<Output = ()>,
{
    let (tx, mut rx) = oneshot::channel::<()>();
    let raced = async move {
        let mut work = std::pin::pin!(work.fuse());
        futures::select_biased! {
            _ = rx => DrainOutcome::Stopped,
            () = work => DrainOutcome::Finished,
        }
    };
    (StopHandle { tx }, raced)
}
