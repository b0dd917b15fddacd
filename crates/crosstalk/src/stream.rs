//! The consumer side of a remote stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::stream::{FusedStream, Stream};
use serde_json::Value;

use crosstalk_base::CallError;

use crate::channel::Channel;
use crate::msgs::RequestId;
use crate::table::StreamEvent;

/// A lazy, single-consumer sequence of chunks from a remote streamer.
///
/// Chunks arrive in the order the producer yielded them.  Buffered
/// chunks are yielded before any terminal error is surfaced, and
/// termination is observed exactly once: a clean end ends the stream,
/// a failure yields one final `Err`.
///
/// Dropping the stream, or calling [`cancel`](Self::cancel), tells the
/// producer to stop: one `stream-cancel` frame is sent, the
/// correlation entry is deleted, and anything else the producer
/// already sent for this call is dropped silently.
pub struct RemoteStream {
    /// Event queue fed by the connection loop.
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    /// Count of chunks sitting unconsumed in `rx`, shared with the
    /// correlation entry for backpressure accounting.
    depth: Arc<AtomicUsize>,
    /// The call this stream answers.
    req_id: RequestId,
    /// The channel the call was made on.
    channel: Weak<Channel>,
    /// True once terminated or cancelled; nothing more will be
    /// yielded, and no cancel needs to be sent.
    finished: bool,
}

impl RemoteStream {
    /// Assemble a stream from its correlation-table parts.
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<StreamEvent>,
        depth: Arc<AtomicUsize>,
        req_id: RequestId,
        channel: Weak<Channel>,
    ) -> Self {
        RemoteStream {
            rx,
            depth,
            req_id,
            channel,
            finished: false,
        }
    }

    /// Return the request id of the call this stream answers.
    pub fn request_id(&self) -> RequestId {
        self.req_id
    }

    /// Stop consuming, and tell the producer to stop producing.
    ///
    /// Idempotent, and a no-op after the stream has terminated on its
    /// own.  Called automatically on drop.
    pub fn cancel(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(channel) = self.channel.upgrade() {
            channel.cancel_outbound_stream(self.req_id);
        }
    }
}

impl Stream for RemoteStream {
    type Item = Result<Value, CallError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.rx).poll_next(cx) {
            Poll::Ready(Some(StreamEvent::Chunk(v))) => {
                this.depth.fetch_sub(1, Ordering::Relaxed);
                Poll::Ready(Some(Ok(v)))
            }
            Poll::Ready(Some(StreamEvent::Failed(e))) => {
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            // An end event, or the loop dropping the queue wholesale:
            // either way the sequence is over.
            Poll::Ready(Some(StreamEvent::End)) | Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl FusedStream for RemoteStream {
    fn is_terminated(&self) -> bool {
        self.finished
    }
}

impl Drop for RemoteStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("req_id", &self.req_id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
