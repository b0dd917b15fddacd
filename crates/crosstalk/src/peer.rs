//! The caller facade: the remote side's endpoints as local calls.

use std::sync::{Arc, Weak};

use serde_json::Value;

use crosstalk_base::{CallError, EndpointKind};

use crate::channel::Channel;
use crate::msgs::Frame;
use crate::stream::RemoteStream;

/// The remote side's endpoints, as local calls.
///
/// This is the typed pair of accessors for the two endpoint kinds:
/// [`invoke`](Self::invoke) for procs and
/// [`open_stream`](Self::open_stream) for streamers, both looked up by
/// name on the remote side of the catalog.
///
/// A `Peer` is cheap to clone and holds no strong reference to its
/// channel; calls made after the channel is gone (or torn down) fail
/// with [`CallError::ConnectionClosed`].
#[derive(Clone, Debug)]
pub struct Peer {
    /// The channel calls travel over.
    channel: Weak<Channel>,
}

impl Peer {
    /// Build a facade over `channel`.
    pub(crate) fn new(channel: Weak<Channel>) -> Self {
        Peer { channel }
    }

    /// Call a unary procedure on the peer, and wait for its reply.
    ///
    /// `args` are validated against the route's input shape before
    /// anything is sent; the result is validated against its output
    /// shape on delivery.  Exactly one `rpc` frame leaves per call.
    pub async fn invoke(&self, method: &str, args: Value) -> Result<Value, CallError> {
        let channel = self.upgrade()?;
        let remote = channel.local_side().opposite();
        let route = channel
            .catalog()
            .route(remote, EndpointKind::Proc, method)
            .ok_or_else(|| CallError::no_such_route(remote, EndpointKind::Proc, method))?
            .clone();
        let args = route.input().check(args)?;

        let (req_id, rx) = channel.enroll_unary(route.output().clone())?;
        let frame = Frame::Call {
            side: remote,
            req_id,
            method: method.to_owned(),
            args,
            streaming: false,
        };
        if channel.send_frame(frame).await.is_err() {
            channel.unenroll(req_id);
            return Err(CallError::ConnectionClosed);
        }

        match rx.await {
            Ok(result) => result,
            // The loop dropped our entry without failing it first;
            // that only happens in teardown races.
            Err(_) => Err(CallError::ConnectionClosed),
        }
    }

    /// Open a stream from a streamer on the peer.
    ///
    /// The returned [`RemoteStream`] yields output-validated chunks
    /// lazily.  Dropping it (or calling its `cancel`) tells the
    /// producer to stop.
    pub async fn open_stream(&self, method: &str, args: Value) -> Result<RemoteStream, CallError> {
        let channel = self.upgrade()?;
        let remote = channel.local_side().opposite();
        let route = channel
            .catalog()
            .route(remote, EndpointKind::Streamer, method)
            .ok_or_else(|| CallError::no_such_route(remote, EndpointKind::Streamer, method))?
            .clone();
        let args = route.input().check(args)?;

        let (req_id, rx, depth) = channel.enroll_stream(route.output().clone())?;
        let frame = Frame::Call {
            side: remote,
            req_id,
            method: method.to_owned(),
            args,
            streaming: true,
        };
        if channel.send_frame(frame).await.is_err() {
            channel.unenroll(req_id);
            return Err(CallError::ConnectionClosed);
        }

        Ok(RemoteStream::new(
            rx,
            depth,
            req_id,
            Weak::clone(&self.channel),
        ))
    }

    /// Upgrade to the channel, or report it gone.
    fn upgrade(&self) -> Result<Arc<Channel>, CallError> {
        self.channel.upgrade().ok_or(CallError::ConnectionClosed)
    }
}
