//! One connection: the per-channel engine loop, its lifecycle, and
//! its teardown semantics.

use std::collections::HashMap;
use std::io::Error as IoError;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use asynchronous_codec::{FramedRead, FramedWrite, JsonCodecError};
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::{FusedStream, FuturesUnordered};
use futures::{AsyncRead, AsyncWrite, FutureExt, Sink, SinkExt, StreamExt};
use oneshot_fused_workaround as oneshot;
use serde_json::error::Category as JsonErrorCategory;
use tracing::{debug, warn};

use crosstalk_base::{CallError, Catalog, Side, Validator};

use crate::codecs::{FrameDecoder, FrameEncoder};
use crate::dispatch;
use crate::engine::{EngineShared, LifecycleHook};
use crate::msgs::{FlexibleFrame, Frame, ReplyBody, RequestId};
use crate::peer::Peer;
use crate::stop::StopHandle;
use crate::table::{PendingCalls, StreamEvent};

/// How many outbound frames may queue before producers block.
///
/// Handlers and callers pushing into a full queue park until the loop
/// drains it, which in turn happens only as fast as the transport
/// accepts frames; that chain is the engine's backpressure.
const OUTBOUND_CHAN_SIZE: usize = 128;

/// Source of process-unique channel ids.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for one [`Channel`].
///
/// Surfaced in the ambient context and in log lines, so concurrent
/// connections can be told apart.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, derive_more::Display, derive_more::Into,
)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate the next id.
    fn next() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// An id for tests that never build a real channel.
    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        ChannelId(0)
    }
}

/// A type-erased fused stream of decoded inbound frames.
///
/// This is the receive half of the transport seam: adapters for
/// message-oriented transports decode each message into a
/// [`FlexibleFrame`] and hand the engine one of these.
pub type BoxedFrameStream =
    Pin<Box<dyn FusedStream<Item = Result<FlexibleFrame, JsonCodecError>> + Send>>;

/// A type-erased sink accepting outbound frames: the send half of the
/// transport seam.
pub type BoxedFrameSink = Pin<Box<dyn Sink<Frame, Error = JsonCodecError> + Send>>;

/// Where a channel is in its life.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ChannelState {
    /// Constructed; the loop has not started.  Outbound calls enqueue
    /// and will flush once the loop runs.
    Opening,
    /// The loop is running and frames flow.
    Open,
    /// Teardown has begun; new calls are rejected.
    Closing,
    /// Teardown is complete.
    Closed,
}

/// One side's engine for one connection.
///
/// A channel owns the correlation table for its outbound calls, the
/// in-flight map for inbound streamers, and (while running) the
/// transport halves.  Everything else — the catalog, handlers,
/// middleware, hooks — is shared engine state.
///
/// Drive it with [`run`](Self::run) (newline-delimited JSON over an
/// `AsyncRead`/`AsyncWrite` pair) or [`run_frames`](Self::run_frames)
/// (decoded frames from a custom transport adapter).  The future
/// resolves when the peer hangs up, the transport fails, or a local
/// [`close`](Self::close) lands; by then every outstanding call has
/// been failed with [`CallError::ConnectionClosed`] exactly once.
pub struct Channel {
    /// Engine-wide immutable state.
    engine: Arc<EngineShared>,
    /// This channel's process-unique id.
    channel_id: ChannelId,
    /// Mutable per-connection state.  Never held across an await.
    inner: Mutex<Inner>,
    /// Producer handle for the outbound frame queue.
    tx_outbound: mpsc::Sender<Frame>,
    /// Pieces consumed by the loop; present until it starts.
    run_parts: Mutex<Option<RunParts>>,
    /// Self-reference handed to contexts and facades.
    this_channel: Weak<Channel>,
}

/// Lock-protected mutable state of a channel.
struct Inner {
    /// Lifecycle state.
    state: ChannelState,
    /// Outbound calls awaiting completion.
    pending: PendingCalls,
    /// Inbound streamer drains, stoppable by the peer.
    inflight: HashMap<RequestId, StopHandle>,
    /// Wakes the loop for a local close; consumed on first use.
    close_tx: Option<oneshot::Sender<()>>,
}

/// The run-once pieces of a channel.
struct RunParts {
    /// Consumer side of the outbound frame queue.
    rx_outbound: mpsc::Receiver<Frame>,
    /// Completion of a local close request.
    close_rx: oneshot::Receiver<()>,
}

impl Channel {
    /// Build a channel over `engine`'s shared state.
    pub(crate) fn new(engine: Arc<EngineShared>) -> Arc<Self> {
        let (tx_outbound, rx_outbound) = mpsc::channel(OUTBOUND_CHAN_SIZE);
        let (close_tx, close_rx) = oneshot::channel();
        let chunk_bound = engine.config.chunk_buffer_bound();
        Arc::new_cyclic(|this_channel| Channel {
            engine,
            channel_id: ChannelId::next(),
            inner: Mutex::new(Inner {
                state: ChannelState::Opening,
                pending: PendingCalls::new(chunk_bound),
                inflight: HashMap::new(),
                close_tx: Some(close_tx),
            }),
            tx_outbound,
            run_parts: Mutex::new(Some(RunParts {
                rx_outbound,
                close_rx,
            })),
            this_channel: Weak::clone(this_channel),
        })
    }

    /// Return this channel's process-unique id.
    pub fn id(&self) -> ChannelId {
        self.channel_id
    }

    /// Return the facade for the remote side's endpoints.
    pub fn peer(&self) -> Peer {
        Peer::new(Weak::clone(&self.this_channel))
    }

    /// Return a handle that can close this channel from anywhere.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            channel: Weak::clone(&self.this_channel),
        }
    }

    /// Request teardown.
    ///
    /// Idempotent.  The loop notices at its next turn; `run` then
    /// fails everything outstanding and returns.
    pub fn close(&self) {
        let close_tx = self.inner.lock().expect("poisoned lock").close_tx.take();
        if let Some(tx) = close_tx {
            let _ = tx.send(());
        }
    }

    /// Drive this channel over a byte transport, framing with
    /// newline-delimited JSON.
    ///
    /// Transport-level end-of-stream is a normal close and returns
    /// `Ok(())`; see [`run_frames`] for everything else.
    ///
    /// [`run_frames`]: Self::run_frames
    pub async fn run<IN, OUT>(self: Arc<Self>, input: IN, output: OUT) -> Result<(), ChannelError>
    where
        IN: AsyncRead + Send + Sync + Unpin + 'static,
        OUT: AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let frames_out: BoxedFrameSink =
            Box::pin(FramedWrite::new(output, FrameEncoder::default()));
        let frames_in: BoxedFrameStream =
            Box::pin(FramedRead::new(input, FrameDecoder::default()).fuse());
        match self.run_frames(frames_in, frames_out).await {
            Err(e) if e.is_connection_close() => Ok(()),
            other => other,
        }
    }

    /// Drive this channel over a frame transport.
    ///
    /// Runs until the inbound stream ends, the sink fails, or a local
    /// close lands, then tears down: every pending outbound call fails
    /// with [`CallError::ConnectionClosed`], every in-flight inbound
    /// streamer is cancelled, and the `on_close` hook runs.  A channel
    /// runs at most once.
    pub async fn run_frames(
        self: Arc<Self>,
        frames_in: BoxedFrameStream,
        frames_out: BoxedFrameSink,
    ) -> Result<(), ChannelError> {
        let parts = self.run_parts.lock().expect("poisoned lock").take();
        let Some(parts) = parts else {
            return Err(ChannelError::AlreadyRunning);
        };
        let result = self.run_loop(frames_in, frames_out, parts).await;
        self.teardown().await;
        result
    }

    /// The per-connection multiplex loop.
    ///
    /// Three inputs compete: inbound frames from the peer, outbound
    /// frames queued by handlers and callers, and completions of
    /// dispatched handler futures.  All state transitions for this
    /// connection happen from here or under the `inner` lock, so
    /// nothing else needs coordination.
    async fn run_loop(
        self: &Arc<Self>,
        mut frames_in: BoxedFrameStream,
        mut frames_out: BoxedFrameSink,
        parts: RunParts,
    ) -> Result<(), ChannelError> {
        let RunParts {
            mut rx_outbound,
            mut close_rx,
        } = parts;

        self.inner.lock().expect("poisoned lock").state = ChannelState::Open;
        self.run_hook(self.engine.on_open.as_ref(), "on_open").await;

        // Dispatched handler futures.  Seeded with a future that never
        // finishes, so the set is never empty (and never terminates).
        let mut running: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
        running.push(futures::future::pending().boxed());

        loop {
            futures::select! {
                () = running.select_next_some() => {
                    // A dispatched call finished; nothing more to do.
                }

                frame = rx_outbound.next() => {
                    // We hold a sender, so the queue cannot end while
                    // the loop runs.
                    let frame = frame.expect("outbound queue closed under a running loop");
                    // Awaiting here is deliberate: a slow transport
                    // must stall frame producers, not grow the queue.
                    frames_out.send(frame).await.map_err(ChannelError::writing)?;
                }

                inbound = frames_in.next() => match inbound {
                    None => {
                        // Peer closed the transport.
                        debug!(channel = %self.channel_id, "transport ended");
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(ChannelError::from_read_error(e)),
                    Some(Ok(FlexibleFrame::Invalid(bad))) => {
                        // Malformed frames cost the peer a log line,
                        // never the connection.
                        warn!(channel = %self.channel_id, "discarding inbound frame: {}", bad.describe());
                    }
                    Some(Ok(FlexibleFrame::Valid(frame))) => {
                        if let Some(reply) = self.handle_frame(frame, &mut running) {
                            frames_out.send(reply).await.map_err(ChannelError::writing)?;
                        }
                    }
                },

                _ = close_rx => {
                    debug!(channel = %self.channel_id, "local close requested");
                    return Ok(());
                }
            }
        }
    }

    /// Act on one valid inbound frame.
    ///
    /// Returns an immediate error reply for the loop to send, if the
    /// frame deserves one.  Calls that can start are dispatched onto
    /// `running`; reply-side frames resolve the correlation table.
    fn handle_frame(
        self: &Arc<Self>,
        frame: Frame,
        running: &mut FuturesUnordered<BoxFuture<'static, ()>>,
    ) -> Option<Frame> {
        match frame {
            Frame::Call {
                side,
                req_id,
                method,
                args,
                streaming,
            } => {
                if side != self.engine.side {
                    // The peer asked us to execute its own role's
                    // routes; answer the call, keep the connection.
                    warn!(
                        channel = %self.channel_id,
                        "peer sent a {} call to the {} side", side, self.engine.side,
                    );
                    return Some(Frame::Reply {
                        req_id,
                        body: ReplyBody::failure(format!(
                            "WrongSide: this peer is the {} side",
                            self.engine.side
                        )),
                    });
                }
                dispatch::incoming_call(self, running, req_id, method, args, streaming)
            }
            Frame::Reply { req_id, body } => {
                self.inner
                    .lock()
                    .expect("poisoned lock")
                    .pending
                    .deliver_reply(req_id, body);
                None
            }
            Frame::Chunk { req_id, chunk } => {
                self.inner
                    .lock()
                    .expect("poisoned lock")
                    .pending
                    .deliver_chunk(req_id, chunk);
                None
            }
            Frame::End { req_id } => {
                self.inner
                    .lock()
                    .expect("poisoned lock")
                    .pending
                    .deliver_end(req_id);
                None
            }
            Frame::StreamError { req_id, error } => {
                self.inner
                    .lock()
                    .expect("poisoned lock")
                    .pending
                    .deliver_stream_error(req_id, error);
                None
            }
            Frame::StreamCancel { req_id } => {
                let handle = self
                    .inner
                    .lock()
                    .expect("poisoned lock")
                    .inflight
                    .remove(&req_id);
                match handle {
                    Some(handle) => handle.stop(),
                    None => {
                        debug!(channel = %self.channel_id, "ignoring cancel for unknown call {}", req_id);
                    }
                }
                None
            }
        }
    }

    /// Fail everything outstanding and run the close hook.
    ///
    /// Runs exactly once, after the loop has exited for any reason.
    async fn teardown(self: &Arc<Self>) {
        let handles: Vec<StopHandle> = {
            let mut inner = self.inner.lock().expect("poisoned lock");
            inner.state = ChannelState::Closing;
            // Every pending call observes ConnectionClosed exactly
            // once; the table is drained.
            inner.pending.fail_all();
            inner.inflight.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            // Trips nothing for drains that already finished.
            handle.stop();
        }
        self.run_hook(self.engine.on_close.as_ref(), "on_close").await;
        self.inner.lock().expect("poisoned lock").state = ChannelState::Closed;
        debug!(channel = %self.channel_id, "channel closed");
    }

    /// Run a lifecycle hook, if one is configured.
    async fn run_hook(self: &Arc<Self>, hook: Option<&LifecycleHook>, which: &str) {
        let Some(hook) = hook else { return };
        if let Err(e) = hook(Arc::clone(self)).await {
            warn!(channel = %self.channel_id, "error in {} hook: {}", which, e);
        }
    }

    /// Return the engine state shared by this channel.
    pub(crate) fn engine_shared(&self) -> &Arc<EngineShared> {
        &self.engine
    }

    /// Return which side of the connection this channel is.
    pub(crate) fn local_side(&self) -> Side {
        self.engine.side
    }

    /// Return the shared route catalog.
    pub(crate) fn catalog(&self) -> &Catalog {
        &self.engine.catalog
    }

    /// Return a weak self-reference.
    pub(crate) fn downgrade(&self) -> Weak<Channel> {
        Weak::clone(&self.this_channel)
    }

    /// Return a producer handle for the outbound frame queue.
    pub(crate) fn outbound(&self) -> mpsc::Sender<Frame> {
        self.tx_outbound.clone()
    }

    /// Queue one frame for the transport.
    ///
    /// Fails only when the loop is gone, which callers surface as
    /// [`CallError::ConnectionClosed`].
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), mpsc::SendError> {
        self.tx_outbound.clone().send(frame).await
    }

    /// Enroll a unary call, unless the channel is already closing.
    pub(crate) fn enroll_unary(
        &self,
        output: Validator,
    ) -> Result<(RequestId, oneshot::Receiver<Result<serde_json::Value, CallError>>), CallError>
    {
        let mut inner = self.inner.lock().expect("poisoned lock");
        match inner.state {
            ChannelState::Opening | ChannelState::Open => Ok(inner.pending.insert_unary(output)),
            ChannelState::Closing | ChannelState::Closed => Err(CallError::ConnectionClosed),
        }
    }

    /// Enroll a stream call, unless the channel is already closing.
    pub(crate) fn enroll_stream(
        &self,
        output: Validator,
    ) -> Result<
        (
            RequestId,
            mpsc::UnboundedReceiver<StreamEvent>,
            Arc<std::sync::atomic::AtomicUsize>,
        ),
        CallError,
    > {
        let mut inner = self.inner.lock().expect("poisoned lock");
        match inner.state {
            ChannelState::Opening | ChannelState::Open => Ok(inner.pending.insert_stream(output)),
            ChannelState::Closing | ChannelState::Closed => Err(CallError::ConnectionClosed),
        }
    }

    /// Drop a correlation entry whose call never made it out.
    pub(crate) fn unenroll(&self, id: RequestId) {
        self.inner
            .lock()
            .expect("poisoned lock")
            .pending
            .remove(id);
    }

    /// Consumer-side stream cancellation: forget the call and tell the
    /// producer to stop.
    ///
    /// Anything the producer already sent for this id will no longer
    /// match a correlation entry and is dropped silently.
    pub(crate) fn cancel_outbound_stream(&self, id: RequestId) {
        let removed = self.inner.lock().expect("poisoned lock").pending.remove(id);
        if !removed {
            return;
        }
        let mut tx = self.tx_outbound.clone();
        if tx.try_send(Frame::StreamCancel { req_id: id }).is_err() {
            // Queue full or loop gone; either way the entry is gone,
            // and any further inbound frames for the id are dropped.
            debug!(channel = %self.channel_id, "could not send stream-cancel for {}", id);
        }
    }

    /// Track a running inbound streamer so the peer can cancel it.
    pub(crate) fn register_inflight(&self, id: RequestId, handle: StopHandle) {
        self.inner
            .lock()
            .expect("poisoned lock")
            .inflight
            .insert(id, handle);
    }

    /// Stop tracking an inbound streamer whose drain finished.
    pub(crate) fn remove_inflight(&self, id: RequestId) {
        self.inner
            .lock()
            .expect("poisoned lock")
            .inflight
            .remove(&id);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("channel_id", &self.channel_id)
            .field("side", &self.engine.side)
            .finish_non_exhaustive()
    }
}

/// A handle that can request a channel's teardown from anywhere.
///
/// Holds no strong reference; closing an already-gone channel is a
/// no-op.
#[derive(Clone, Debug)]
pub struct CloseHandle {
    /// The channel to close.
    channel: Weak<Channel>,
}

impl CloseHandle {
    /// Request teardown of the channel.
    pub fn close(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.close();
        }
    }
}

/// A failure that ends a [`Channel`]'s run.
///
/// Note what is *not* here: per-call errors, validation failures,
/// unknown routes, and malformed frames are all handled per call and
/// never end the run.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// Could not write to the transport.
    #[error("could not write to transport")]
    WriteFailed(#[source] Arc<IoError>),
    /// Could not read from the transport.
    #[error("could not read from transport")]
    ReadFailed(#[source] Arc<IoError>),
    /// Could not encode an outbound frame as JSON.
    #[error("could not encode outbound frame")]
    EncodeFailed(#[source] Arc<serde_json::Error>),
    /// The transport byte stream broke in a way the codec could not
    /// recover from.
    #[error("could not decode inbound data")]
    DecodeFailed(#[source] Arc<serde_json::Error>),
    /// `run` was called on a channel that already ran.
    #[error("channel was already run")]
    AlreadyRunning,
}

impl ChannelError {
    /// Classify a codec error that occurred while writing.
    fn writing(error: JsonCodecError) -> Self {
        match error {
            JsonCodecError::Io(e) => ChannelError::WriteFailed(Arc::new(e)),
            JsonCodecError::Json(e) => ChannelError::EncodeFailed(Arc::new(e)),
        }
    }

    /// Classify a codec error that occurred while reading.
    fn from_read_error(error: JsonCodecError) -> Self {
        match error {
            JsonCodecError::Io(e) => ChannelError::ReadFailed(Arc::new(e)),
            JsonCodecError::Json(e) => ChannelError::DecodeFailed(Arc::new(e)),
        }
    }

    /// Return true if this error probably just means the peer hung up.
    ///
    /// Such ends are tolerated silently; anything else deserves at
    /// least a log line from the caller.
    fn is_connection_close(&self) -> bool {
        use std::io::ErrorKind as IK;
        match self {
            ChannelError::ReadFailed(e) | ChannelError::WriteFailed(e) => matches!(
                e.kind(),
                IK::UnexpectedEof | IK::ConnectionAborted | IK::ConnectionReset | IK::BrokenPipe
            ),
            ChannelError::DecodeFailed(e) => matches!(e.classify(), JsonErrorCategory::Eof),
            _ => false,
        }
    }
}
