//! Message types used on the crosstalk wire.
//!
//! One frame travels per transport message (or per line, on byte
//! transports).  Unknown fields on a known frame type are ignored; a
//! whole frame we cannot recognize decodes as
//! [`FlexibleFrame::Invalid`] so the connection loop can log it and
//! move on.

mod invalid;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crosstalk_base::Side;

pub use invalid::InvalidFrame;

/// An identifier for one call within one connection.
///
/// Each originator numbers its own calls and never reuses a number for
/// the life of the connection.  The two sides' counters are
/// independent: each side correlates only the replies to its own
/// requests, so collisions between them cannot happen.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    derive_more::From,
    derive_more::Into,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct RequestId(u64);

/// A single wire frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
#[allow(clippy::exhaustive_enums)] // the wire protocol is the contract
pub enum Frame {
    /// Ask the peer identified by `side` to execute an endpoint.
    #[serde(rename = "rpc")]
    Call {
        /// Which peer should execute the call.
        ///
        /// A receiver that finds its own role here answers with a
        /// `WrongSide` failure instead of executing.
        side: Side,
        /// The originator's id for this call.
        #[serde(rename = "reqId")]
        req_id: RequestId,
        /// Endpoint name in the catalog.
        method: String,
        /// Call arguments, input-validated by the originator.
        args: Value,
        /// True to invoke a streamer, false for a proc.
        #[serde(default)]
        streaming: bool,
    },

    /// Reply to a `rpc` frame.
    #[serde(rename = "rpc-res")]
    Reply {
        /// Id of the call being answered.
        #[serde(rename = "reqId")]
        req_id: RequestId,
        /// Success, failure, or streamer acknowledgement.
        #[serde(flatten)]
        body: ReplyBody,
    },

    /// One streamed chunk.
    #[serde(rename = "stream-chunk")]
    Chunk {
        /// Id of the stream call this chunk belongs to.
        #[serde(rename = "reqId")]
        req_id: RequestId,
        /// The (output-validated) chunk value.
        chunk: Value,
    },

    /// Clean end of a stream.
    #[serde(rename = "stream-end")]
    End {
        /// Id of the stream call that ended.
        #[serde(rename = "reqId")]
        req_id: RequestId,
    },

    /// Abnormal end of a stream.
    #[serde(rename = "stream-error")]
    StreamError {
        /// Id of the stream call that failed.
        #[serde(rename = "reqId")]
        req_id: RequestId,
        /// Why the producer gave up.
        error: String,
    },

    /// Consumer asks the producer to stop a stream.
    #[serde(rename = "stream-cancel")]
    StreamCancel {
        /// Id of the stream call to stop.
        #[serde(rename = "reqId")]
        req_id: RequestId,
    },
}

/// The body of a `rpc-res` frame.
///
/// The three shapes are distinguished by which fields are present, not
/// by a tag; decoding tries them in declared order, most-specific
/// first.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
#[allow(clippy::exhaustive_enums)] // the wire protocol is the contract
pub enum ReplyBody {
    /// Acknowledgement that a streamer call was accepted.
    ///
    /// Optional on the wire; this implementation emits it so reply
    /// shapes stay symmetric between procs and streamers.
    Accepted {
        /// Always true here.
        ok: bool,
        /// Marks the reply as a streamer acknowledgement.
        streaming: bool,
    },
    /// A successful unary result.
    Success {
        /// Always true here.
        ok: bool,
        /// The (output-validated) result value.
        data: Value,
    },
    /// A failed call.
    Failure {
        /// Always false here.
        ok: bool,
        /// Why the call failed.
        error: String,
    },
}

impl ReplyBody {
    /// Build a successful unary reply.
    pub fn success(data: Value) -> Self {
        ReplyBody::Success { ok: true, data }
    }

    /// Build a failure reply.
    pub fn failure(error: impl Into<String>) -> Self {
        ReplyBody::Failure {
            ok: false,
            error: error.into(),
        }
    }

    /// Build a streamer acknowledgement.
    pub fn stream_accepted() -> Self {
        ReplyBody::Accepted {
            ok: true,
            streaming: true,
        }
    }
}

/// A frame that may or may not be something we recognize.
///
/// The decoder produces this instead of failing outright, so that a
/// buggy peer costs us single frames and a log line, never the
/// connection.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
#[allow(clippy::exhaustive_enums)]
pub enum FlexibleFrame {
    /// A recognized frame.
    Valid(Frame),
    /// Valid JSON that is not a recognizable frame.
    Invalid(InvalidFrame),
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::needless_pass_by_value)]

    use super::*;
    use serde_json::json;

    /// Parse a frame that must be valid.
    fn parse(s: &str) -> Frame {
        match serde_json::from_str::<FlexibleFrame>(s) {
            Ok(FlexibleFrame::Valid(f)) => f,
            other => panic!("{:?}", other),
        }
    }

    /// Parse a frame that must be invalid, and return its description.
    fn parse_invalid(s: &str) -> String {
        match serde_json::from_str::<FlexibleFrame>(s) {
            Ok(FlexibleFrame::Invalid(inv)) => inv.describe(),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn call_roundtrip() {
        let frame = parse(
            r#"{"type":"rpc","side":"server","reqId":7,"method":"uppercase","args":"foo","streaming":false}"#,
        );
        assert!(matches!(
            &frame,
            Frame::Call { side: Side::Server, req_id, method, args, streaming: false }
                if *req_id == RequestId::from(7)
                    && method == "uppercase"
                    && *args == json!("foo")
        ));

        // NOTE: this is a bit fragile for a test, since nothing in
        // serde_json guarantees field order; it documents the shape we
        // actually emit.
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"type":"rpc","side":"server","reqId":7,"method":"uppercase","args":"foo","streaming":false}"#
        );
    }

    #[test]
    fn streaming_defaults_to_false() {
        let frame = parse(r#"{"type":"rpc","side":"client","reqId":1,"method":"approve","args":{}}"#);
        assert!(matches!(frame, Frame::Call { streaming: false, .. }));
    }

    #[test]
    fn reply_shapes() {
        let ok = parse(r#"{"type":"rpc-res","reqId":7,"ok":true,"data":{"result":25}}"#);
        assert!(matches!(
            &ok,
            Frame::Reply { body: ReplyBody::Success { data, .. }, .. }
                if *data == json!({"result": 25})
        ));

        let err = parse(r#"{"type":"rpc-res","reqId":7,"ok":false,"error":"boom"}"#);
        assert!(matches!(
            &err,
            Frame::Reply { body: ReplyBody::Failure { error, .. }, .. } if error == "boom"
        ));

        let ack = parse(r#"{"type":"rpc-res","reqId":7,"ok":true,"streaming":true}"#);
        assert!(matches!(
            ack,
            Frame::Reply {
                body: ReplyBody::Accepted { streaming: true, .. },
                ..
            }
        ));
    }

    #[test]
    fn reply_serialization() {
        let reply = Frame::Reply {
            req_id: RequestId::from(9),
            body: ReplyBody::success(json!("FOO")),
        };
        assert_eq!(
            serde_json::to_string(&reply).unwrap(),
            r#"{"type":"rpc-res","reqId":9,"ok":true,"data":"FOO"}"#
        );

        let ack = Frame::Reply {
            req_id: RequestId::from(9),
            body: ReplyBody::stream_accepted(),
        };
        assert_eq!(
            serde_json::to_string(&ack).unwrap(),
            r#"{"type":"rpc-res","reqId":9,"ok":true,"streaming":true}"#
        );
    }

    #[test]
    fn stream_frames() {
        let chunk = parse(r#"{"type":"stream-chunk","reqId":3,"chunk":"Working..."}"#);
        assert!(matches!(
            &chunk,
            Frame::Chunk { chunk, .. } if *chunk == json!("Working...")
        ));

        assert!(matches!(
            parse(r#"{"type":"stream-end","reqId":3}"#),
            Frame::End { .. }
        ));
        assert!(matches!(
            parse(r#"{"type":"stream-cancel","reqId":3}"#),
            Frame::StreamCancel { .. }
        ));
        assert!(matches!(
            parse(r#"{"type":"stream-error","reqId":3,"error":"boom"}"#),
            Frame::StreamError { error, .. } if error == "boom"
        ));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let frame = parse(
            r#"{"type":"stream-end","reqId":3,"hopefully":"forward-compatible"}"#,
        );
        assert!(matches!(frame, Frame::End { req_id } if req_id == RequestId::from(3)));
    }

    #[test]
    fn unrecognizable_frames() {
        assert_eq!(
            parse_invalid(r#"{"reqId":3}"#),
            "frame has no `type` field"
        );
        assert_eq!(
            parse_invalid(r#"{"type":12,"reqId":3}"#),
            "frame `type` field is not a string"
        );
        assert_eq!(
            parse_invalid(r#"{"type":"rpc-blurb","reqId":3}"#),
            "unrecognized frame type \"rpc-blurb\""
        );
        // Known type, but the rest of the frame is malformed.
        assert_eq!(
            parse_invalid(r#"{"type":"stream-chunk","reqId":"xyz"}"#),
            "malformed \"stream-chunk\" frame"
        );
    }
}
