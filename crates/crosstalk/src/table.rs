//! The correlation table: calls this side has sent and not yet seen
//! complete, and the machinery to complete them.
//!
//! There is one table per channel, owned by the channel's shared
//! state.  Entries are inserted when a call leaves, and removed by the
//! terminal inbound frame for that call (or by teardown, which fails
//! everything exactly once).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::channel::mpsc;
use oneshot_fused_workaround as oneshot;
use serde_json::Value;
use tracing::{debug, warn};

use crosstalk_base::{CallError, Validator};

use crate::msgs::{ReplyBody, RequestId};

/// One event on a pending stream's queue.
///
/// Events are delivered in arrival order, so buffered chunks drain
/// before the consumer observes the terminal event.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// A validated chunk.
    Chunk(Value),
    /// Clean termination.
    End,
    /// Abnormal termination.
    Failed(CallError),
}

/// Completion machinery for one pending outbound call.
enum PendingCall {
    /// A unary call waiting for its single reply.
    Unary {
        /// Resolves the caller's future.
        tx: oneshot::Sender<Result<Value, CallError>>,
        /// Applied to the result on delivery.
        output: Validator,
    },
    /// A stream call; chunks flow until a terminal event.
    Stream {
        /// Feeds the consumer's `RemoteStream`.
        tx: mpsc::UnboundedSender<StreamEvent>,
        /// Chunks currently queued and not yet consumed.
        depth: Arc<AtomicUsize>,
        /// Applied to every chunk on delivery.
        output: Validator,
    },
}

/// The correlation table for one channel.
pub(crate) struct PendingCalls {
    /// Next unused request id.
    next_id: u64,
    /// Cap on unconsumed buffered chunks per stream, if configured.
    chunk_buffer_bound: Option<usize>,
    /// Pending calls by id.
    table: HashMap<RequestId, PendingCall>,
}

impl PendingCalls {
    /// Return an empty table.
    pub(crate) fn new(chunk_buffer_bound: Option<usize>) -> Self {
        PendingCalls {
            next_id: 1,
            chunk_buffer_bound,
            table: HashMap::new(),
        }
    }

    /// Allocate a request id.  Ids are never reused within a channel.
    fn next_request_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        id.into()
    }

    /// Enroll a unary call; returns its id and the completion future's
    /// receiving half.
    pub(crate) fn insert_unary(
        &mut self,
        output: Validator,
    ) -> (RequestId, oneshot::Receiver<Result<Value, CallError>>) {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.table.insert(id, PendingCall::Unary { tx, output });
        (id, rx)
    }

    /// Enroll a stream call; returns its id, the event queue's
    /// receiving half, and the shared queue-depth counter.
    pub(crate) fn insert_stream(
        &mut self,
        output: Validator,
    ) -> (
        RequestId,
        mpsc::UnboundedReceiver<StreamEvent>,
        Arc<AtomicUsize>,
    ) {
        let id = self.next_request_id();
        let (tx, rx) = mpsc::unbounded();
        let depth = Arc::new(AtomicUsize::new(0));
        self.table.insert(
            id,
            PendingCall::Stream {
                tx,
                depth: Arc::clone(&depth),
                output,
            },
        );
        (id, rx, depth)
    }

    /// Drop the entry for `id`, if any; true if something was dropped.
    ///
    /// Used when a send fails after enrollment, and when a consumer
    /// cancels a stream.
    pub(crate) fn remove(&mut self, id: RequestId) -> bool {
        self.table.remove(&id).is_some()
    }

    /// Deliver a `rpc-res` body for `id`.
    pub(crate) fn deliver_reply(&mut self, id: RequestId, body: ReplyBody) {
        match body {
            ReplyBody::Accepted { .. } => {
                // A streamer acknowledgement; there is nothing to
                // resolve yet.
                if !matches!(self.table.get(&id), Some(PendingCall::Stream { .. })) {
                    debug!("dropping stream acknowledgement for unknown call {}", id);
                }
            }
            ReplyBody::Success { data, .. } => match self.table.remove(&id) {
                Some(PendingCall::Unary { tx, output }) => {
                    let result = output.check(data).map_err(CallError::from);
                    let _ = tx.send(result);
                }
                Some(entry @ PendingCall::Stream { .. }) => {
                    // A unary result for a stream call is a peer bug;
                    // keep the stream alive and drop the value.
                    warn!("dropping unary result for stream call {}", id);
                    self.table.insert(id, entry);
                }
                None => debug!("dropping reply for unknown call {}", id),
            },
            ReplyBody::Failure { error, .. } => match self.table.remove(&id) {
                Some(PendingCall::Unary { tx, .. }) => {
                    let _ = tx.send(Err(CallError::Remote(error)));
                }
                Some(PendingCall::Stream { tx, .. }) => {
                    let _ = tx.unbounded_send(StreamEvent::Failed(CallError::Remote(error)));
                }
                None => debug!("dropping failure for unknown call {}", id),
            },
        }
    }

    /// Deliver one stream chunk for `id`.
    ///
    /// Chunks for ids we no longer track are dropped silently; that is
    /// the normal aftermath of a consumer-side cancel.
    pub(crate) fn deliver_chunk(&mut self, id: RequestId, chunk: Value) {
        let (tx, depth, output) = match self.table.get(&id) {
            Some(PendingCall::Stream { tx, depth, output }) => {
                (tx.clone(), Arc::clone(depth), output.clone())
            }
            Some(PendingCall::Unary { .. }) => {
                warn!("dropping chunk for unary call {}", id);
                return;
            }
            None => return,
        };

        if let Some(bound) = self.chunk_buffer_bound {
            if depth.load(Ordering::Relaxed) >= bound {
                let _ = tx.unbounded_send(StreamEvent::Failed(CallError::BackpressureDropped));
                self.table.remove(&id);
                return;
            }
        }

        match output.check(chunk) {
            Ok(v) => {
                depth.fetch_add(1, Ordering::Relaxed);
                if tx.unbounded_send(StreamEvent::Chunk(v)).is_err() {
                    // Consumer side is gone; stop tracking.
                    self.table.remove(&id);
                }
            }
            Err(e) => {
                // A bad chunk fails the stream locally; the producer is
                // not told.
                let _ = tx.unbounded_send(StreamEvent::Failed(CallError::from(e)));
                self.table.remove(&id);
            }
        }
    }

    /// Deliver a clean stream end for `id`.
    pub(crate) fn deliver_end(&mut self, id: RequestId) {
        match self.table.remove(&id) {
            Some(PendingCall::Stream { tx, .. }) => {
                let _ = tx.unbounded_send(StreamEvent::End);
            }
            Some(entry @ PendingCall::Unary { .. }) => {
                warn!("dropping stream end for unary call {}", id);
                self.table.insert(id, entry);
            }
            None => {}
        }
    }

    /// Deliver a stream failure for `id`.
    pub(crate) fn deliver_stream_error(&mut self, id: RequestId, error: String) {
        match self.table.remove(&id) {
            Some(PendingCall::Stream { tx, .. }) => {
                let _ = tx.unbounded_send(StreamEvent::Failed(CallError::Remote(error)));
            }
            Some(entry @ PendingCall::Unary { .. }) => {
                warn!("dropping stream error for unary call {}", id);
                self.table.insert(id, entry);
            }
            None => {}
        }
    }

    /// Fail every pending call with [`CallError::ConnectionClosed`].
    ///
    /// The table is drained, so each call observes the failure exactly
    /// once.
    pub(crate) fn fail_all(&mut self) {
        for (_, entry) in self.table.drain() {
            match entry {
                PendingCall::Unary { tx, .. } => {
                    let _ = tx.send(Err(CallError::ConnectionClosed));
                }
                PendingCall::Stream { tx, .. } => {
                    let _ = tx.unbounded_send(StreamEvent::Failed(CallError::ConnectionClosed));
                }
            }
        }
    }

    /// Return how many calls are pending.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }
}
