//! Error vocabulary shared by both sides of a connection.
//!
//! Per-call failures are always delivered per call, as a local error
//! or an error frame to the peer; none of these ever terminates a
//! connection by itself.

use crate::catalog::{EndpointKind, Side};

/// A value failed a route's shape check.
///
/// The `Display` form carries a leading `ValidationError:` so that the
/// failure kind survives the trip across the wire, where only a string
/// is available.
#[derive(Clone, Debug, thiserror::Error)]
#[error("ValidationError: {msg}")]
pub struct ValidationError {
    /// What the validator objected to.
    msg: String,
}

impl ValidationError {
    /// Construct a validation error from the validator's complaint.
    pub fn new(msg: impl Into<String>) -> Self {
        ValidationError { msg: msg.into() }
    }

    /// Return the validator's complaint, without the kind prefix.
    pub fn message(&self) -> &str {
        &self.msg
    }
}

/// An error produced by application handler code.
///
/// The message travels to the peer verbatim, so callers see exactly
/// what the handler reported.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{msg}")]
pub struct HandlerError {
    /// The handler's report.
    msg: String,
}

impl HandlerError {
    /// Construct a handler error from a message.
    pub fn new(msg: impl Into<String>) -> Self {
        HandlerError { msg: msg.into() }
    }

    /// Return the message as the peer will see it.
    pub fn message(&self) -> &str {
        &self.msg
    }
}

impl From<ValidationError> for HandlerError {
    fn from(e: ValidationError) -> Self {
        HandlerError::new(e.to_string())
    }
}

/// Why a local call could not complete.
///
/// This is the error surface of the caller facade: unary calls reject
/// with it, and stream consumers observe it as the terminal event.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CallError {
    /// The catalog has no route matching the requested endpoint.
    #[error("NoSuchRoute: no {kind} named {name:?} on the {side} side")]
    NoSuchRoute {
        /// Side the endpoint was looked up on.
        side: Side,
        /// Kind the endpoint was looked up as.
        kind: EndpointKind,
        /// The endpoint name.
        name: String,
    },

    /// A value failed validation before leaving this process, or on
    /// delivery of a result or chunk.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The peer reported that the call failed.
    #[error("peer reported failure: {0}")]
    Remote(String),

    /// The connection closed before the call completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The bounded inbound chunk buffer overflowed, and the stream was
    /// dropped rather than stall the connection.
    #[error("BackpressureDropped: inbound chunk buffer overflowed")]
    BackpressureDropped,
}

impl CallError {
    /// Construct a `NoSuchRoute` error for a failed lookup.
    pub fn no_such_route(side: Side, kind: EndpointKind, name: &str) -> Self {
        CallError::NoSuchRoute {
            side,
            kind,
            name: name.to_owned(),
        }
    }
}
