//! Shared plumbing for integration tests: in-memory frame pipes and a
//! two-engine harness.

#![allow(clippy::unwrap_used)]
#![allow(dead_code)] // not every test file uses every helper

use std::io;
use std::sync::Arc;

use asynchronous_codec::JsonCodecError;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};

use crosstalk::msgs::{FlexibleFrame, Frame};
use crosstalk::{BoxedFrameSink, BoxedFrameStream, Channel, Engine};

/// One direction of frame flow: a sink for the writer end, a stream
/// for the reader end.
pub fn frame_pipe() -> (BoxedFrameSink, BoxedFrameStream) {
    let (tx, rx) = mpsc::unbounded::<Frame>();
    let sink: BoxedFrameSink = Box::pin(tx.sink_map_err(|_| {
        JsonCodecError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
    }));
    let stream: BoxedFrameStream = Box::pin(rx.map(|f| Ok(FlexibleFrame::Valid(f))).fuse());
    (sink, stream)
}

/// An inbound frame stream the test feeds by hand.
pub fn hand_fed_stream() -> (
    mpsc::UnboundedSender<Result<FlexibleFrame, JsonCodecError>>,
    BoxedFrameStream,
) {
    let (tx, rx) = mpsc::unbounded();
    (tx, Box::pin(rx.fuse()))
}

/// An outbound frame sink the test observes by hand.
pub fn observed_sink() -> (BoxedFrameSink, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded::<Frame>();
    let sink: BoxedFrameSink = Box::pin(tx.sink_map_err(|_| {
        JsonCodecError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
    }));
    (sink, rx)
}

/// Wrap a frame so it looks like it came off the decoder.
pub fn valid(frame: Frame) -> Result<FlexibleFrame, JsonCodecError> {
    Ok(FlexibleFrame::Valid(frame))
}

/// Connect a server engine and a client engine back to back over
/// in-memory pipes, run `scenario` with the two channels, and drive
/// everything to completion.
pub fn run_connected<F, Fut>(server: &Engine, client: &Engine, scenario: F)
where
    F: FnOnce(Arc<Channel>, Arc<Channel>) -> Fut,
    Fut: Future<Output = ()>,
{
    let server_chan = server.channel();
    let client_chan = client.channel();
    let (c2s_sink, c2s_stream) = frame_pipe();
    let (s2c_sink, s2c_stream) = frame_pipe();

    let server_run = Arc::clone(&server_chan).run_frames(c2s_stream, s2c_sink);
    let client_run = Arc::clone(&client_chan).run_frames(s2c_stream, c2s_sink);
    let body = {
        let server_chan = Arc::clone(&server_chan);
        let client_chan = Arc::clone(&client_chan);
        async move {
            scenario(Arc::clone(&server_chan), Arc::clone(&client_chan)).await;
            client_chan.close();
            server_chan.close();
        }
    };

    futures::executor::block_on(async {
        let (server_result, client_result, ()) = futures::join!(server_run, client_run, body);
        server_result.expect("server run failed");
        client_result.expect("client run failed");
    });
}
