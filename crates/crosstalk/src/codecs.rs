//! Framing of wire frames onto async byte transports.
//!
//! On byte transports the encoding is newline-delimited JSON: one
//! frame per line.  Message-oriented transports (WebSockets and
//! friends) skip this module entirely and feed decoded frames through
//! [`Channel::run_frames`](crate::channel::Channel::run_frames).

use asynchronous_codec::{Decoder, Encoder, JsonCodecError};
use bytes::{BufMut, BytesMut};

use crate::msgs::{FlexibleFrame, Frame};

/// Encoder writing one [`Frame`] per newline-terminated JSON line.
///
/// The line framing is sound because a serialized frame never contains
/// a raw newline: JSON escapes them inside strings.
#[derive(Clone, Debug, Default)]
pub(crate) struct FrameEncoder {}

impl Encoder for FrameEncoder {
    type Item<'a> = Frame;

    type Error = JsonCodecError;

    fn encode(&mut self, frame: Self::Item<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = serde_json::to_vec(&frame).map_err(JsonCodecError::Json)?;
        dst.reserve(line.len() + 1);
        dst.extend_from_slice(&line);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Decoder producing one [`FlexibleFrame`] per well-formed line.
///
/// A line that is not valid JSON at all is logged and skipped: a buggy
/// peer costs us frames, never the connection.  Valid JSON that isn't
/// a recognizable frame still decodes (as
/// [`FlexibleFrame::Invalid`]), so the connection loop can log what
/// was wrong with it.
#[derive(Clone, Debug, Default)]
pub(crate) struct FrameDecoder {}

impl Decoder for FrameDecoder {
    type Item = FlexibleFrame;

    type Error = JsonCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FlexibleFrame>, JsonCodecError> {
        while let Some(pos) = src.iter().position(|b| *b == b'\n') {
            let line = src.split_to(pos + 1);
            if let Some(frame) = parse_line(&line[..line.len() - 1]) {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<FlexibleFrame>, JsonCodecError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // A final line without a trailing newline is still a frame.
        let rest = src.split_to(src.len());
        Ok(parse_line(&rest))
    }
}

/// Parse one line as a frame, if there is anything on it to parse.
fn parse_line(line: &[u8]) -> Option<FlexibleFrame> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_slice(line) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!("discarding inbound line that was not valid JSON: {}", e);
            None
        }
    }
}
