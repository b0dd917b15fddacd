//! A shadow type for diagnosing frames we could not decode.

use serde_json::Value;

use super::RequestId;

/// Frame types this implementation understands.
const KNOWN_FRAME_TYPES: &[&str] = &[
    "rpc",
    "rpc-res",
    "stream-chunk",
    "stream-end",
    "stream-error",
    "stream-cancel",
];

/// Either a value of the expected type, or whatever was actually there.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(untagged)]
enum Possibly<T> {
    /// The field decoded as expected.
    Good(T),
    /// The field was present but had the wrong shape.
    #[allow(dead_code)] // kept so the bad value shows up in Debug output
    Bad(Value),
}

/// An unrecognizable frame.
///
/// When a transport message parses as JSON but not as a
/// [`Frame`](super::Frame), we re-parse it as this structure so the
/// discard log can say what was wrong with it.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct InvalidFrame {
    /// The frame's `type` field, if it had one.
    #[serde(rename = "type")]
    frame_type: Option<Possibly<String>>,
    /// The frame's `reqId` field, if it had one.
    #[serde(rename = "reqId")]
    req_id: Option<Possibly<RequestId>>,
}

impl InvalidFrame {
    /// Return the request id this frame named, if it named one.
    pub fn req_id(&self) -> Option<RequestId> {
        match &self.req_id {
            Some(Possibly::Good(id)) => Some(*id),
            _ => None,
        }
    }

    /// Describe what is wrong with this frame, for the discard log.
    pub fn describe(&self) -> String {
        match &self.frame_type {
            None => "frame has no `type` field".to_owned(),
            Some(Possibly::Bad(_)) => "frame `type` field is not a string".to_owned(),
            Some(Possibly::Good(t)) if KNOWN_FRAME_TYPES.contains(&t.as_str()) => {
                format!("malformed {:?} frame", t)
            }
            Some(Possibly::Good(t)) => format!("unrecognized frame type {:?}", t),
        }
    }
}
