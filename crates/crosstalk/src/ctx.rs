//! Ambient per-message context for handlers.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use serde_json::Value;

use crosstalk_base::Side;

use crate::channel::{Channel, ChannelId};
use crate::msgs::RequestId;
use crate::peer::Peer;

/// What a handler can see about the message it is serving.
///
/// One context is created per dispatched inbound message and shared
/// (as an `Arc`) with every future serving that message, so every
/// suspension inside a handler resumes with the same context; nothing
/// needs to be threaded through parameters.
///
/// Middleware runs before the handler and may enrich the
/// [field map](Self::set_field) in declared order.
pub struct RequestContext {
    /// The channel the message arrived on.
    channel: Weak<Channel>,
    /// Process-unique id of that channel.
    channel_id: ChannelId,
    /// The originator's id for this call.
    req_id: RequestId,
    /// The side that sent the call.
    caller: Side,
    /// Application-supplied fields.
    fields: Mutex<HashMap<String, Value>>,
}

impl RequestContext {
    /// Build the context for one inbound message.
    pub(crate) fn new(
        channel: Weak<Channel>,
        channel_id: ChannelId,
        req_id: RequestId,
        caller: Side,
    ) -> Self {
        RequestContext {
            channel,
            channel_id,
            req_id,
            caller,
            fields: Mutex::new(HashMap::new()),
        }
    }

    /// Return a facade for the peer that sent this message.
    ///
    /// This is how handlers call back into their caller: a server
    /// streamer can, mid-stream, invoke a proc on the client that
    /// started it.
    pub fn peer(&self) -> Peer {
        Peer::new(Weak::clone(&self.channel))
    }

    /// Return the id of the channel this message arrived on.
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Return the originator's id for this call.
    pub fn request_id(&self) -> RequestId {
        self.req_id
    }

    /// Return which side sent the call.
    pub fn caller(&self) -> Side {
        self.caller
    }

    /// Store an application field, overwriting any previous value.
    pub fn set_field(&self, name: &str, value: Value) {
        self.fields
            .lock()
            .expect("poisoned lock")
            .insert(name.to_owned(), value);
    }

    /// Fetch a copy of an application field.
    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields.lock().expect("poisoned lock").get(name).cloned()
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("channel_id", &self.channel_id)
            .field("req_id", &self.req_id)
            .field("caller", &self.caller)
            .finish_non_exhaustive()
    }
}
