//! Building engines, and stamping out per-connection channels.
//!
//! An [`Engine`] is the immutable bundle shared by every connection on
//! one side: the catalog, the local handlers, the middleware chain,
//! the lifecycle hooks, and per-channel configuration.  Servers build
//! one engine and call [`Engine::channel`] per accepted transport;
//! clients do the same per dialed transport.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{Stream, StreamExt};
use serde_json::Value;

use crosstalk_base::{Catalog, EndpointKind, HandlerError, Side};

use crate::channel::Channel;
use crate::ctx::RequestContext;
use crate::dispatch::{BoxedProcHandler, BoxedStreamerHandler, HandlerSet};
use crate::middleware::Middleware;

/// Per-channel configuration knobs.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct ChannelConfig {
    /// See [`max_inbound_chunk_buffer`](Self::max_inbound_chunk_buffer).
    chunk_buffer_bound: Option<usize>,
}

impl ChannelConfig {
    /// Return the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the number of unconsumed chunks buffered for each stream
    /// opened through the peer facade.
    ///
    /// The default is unbounded.  With a bound set, a chunk arriving
    /// while `bound` chunks sit unconsumed is dropped, and the stream
    /// fails with [`CallError::BackpressureDropped`]: the engine sheds
    /// the slow consumer rather than stall every other call on the
    /// connection.
    ///
    /// [`CallError::BackpressureDropped`]:
    ///     crosstalk_base::CallError::BackpressureDropped
    pub fn max_inbound_chunk_buffer(mut self, bound: usize) -> Self {
        self.chunk_buffer_bound = Some(bound);
        self
    }

    /// Return the configured chunk-buffer bound, if any.
    pub(crate) fn chunk_buffer_bound(&self) -> Option<usize> {
        self.chunk_buffer_bound
    }
}

/// A hook run when a channel opens or closes.
///
/// Hook errors are logged and otherwise ignored; they never abort the
/// connection.
pub(crate) type LifecycleHook =
    Arc<dyn Fn(Arc<Channel>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// The immutable engine state shared by all of its channels.
pub(crate) struct EngineShared {
    /// Which side of connections this engine is.
    pub(crate) side: Side,
    /// The route catalog shared with the remote side.
    pub(crate) catalog: Catalog,
    /// Local handlers for this side's routes.
    pub(crate) handlers: HandlerSet,
    /// Middleware chain, outermost first.
    pub(crate) middleware: Vec<Arc<dyn Middleware>>,
    /// Run when a channel's loop starts.
    pub(crate) on_open: Option<LifecycleHook>,
    /// Run when a channel has torn down.
    pub(crate) on_close: Option<LifecycleHook>,
    /// Per-channel configuration.
    pub(crate) config: ChannelConfig,
}

/// One side's RPC setup, from which per-connection channels are made.
#[derive(Clone)]
pub struct Engine {
    /// State shared with every channel.
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Return a builder for an engine serving `side` of `catalog`.
    pub fn builder(side: Side, catalog: Catalog) -> EngineBuilder {
        EngineBuilder {
            side,
            catalog,
            registered: Vec::new(),
            middleware: Vec::new(),
            on_open: None,
            on_close: None,
            config: ChannelConfig::default(),
        }
    }

    /// Return which side of connections this engine is.
    pub fn side(&self) -> Side {
        self.shared.side
    }

    /// Return the engine's route catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    /// Build a channel for one freshly connected transport.
    pub fn channel(&self) -> Arc<Channel> {
        Channel::new(Arc::clone(&self.shared))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("side", &self.shared.side)
            .finish_non_exhaustive()
    }
}

/// A handler as registered, before build-time checking.
enum RegisteredHandler {
    /// A unary handler.
    Proc(BoxedProcHandler),
    /// A streamer handler.
    Streamer(BoxedStreamerHandler),
}

/// An error from assembling an [`Engine`].
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineBuilderError {
    /// A handler was registered for an endpoint the catalog does not
    /// declare on this side.
    #[error("no {kind} named {name:?} on the {side} side of the catalog")]
    NoSuchRoute {
        /// The engine's side.
        side: Side,
        /// The kind the handler was registered as.
        kind: EndpointKind,
        /// The endpoint name.
        name: String,
    },
    /// Two handlers were registered for the same endpoint.
    #[error("{kind} {name:?} was given two handlers")]
    DuplicateHandler {
        /// The kind the handlers were registered as.
        kind: EndpointKind,
        /// The endpoint name.
        name: String,
    },
}

/// Builder for an [`Engine`].
///
/// Handlers are declared here and checked against the catalog when
/// [`build`](Self::build) runs: a handler for an undeclared route, or
/// a second handler for the same route, is a build error.
pub struct EngineBuilder {
    /// Which side this engine will be.
    side: Side,
    /// The shared route catalog.
    catalog: Catalog,
    /// Handlers in registration order.
    registered: Vec<(EndpointKind, String, RegisteredHandler)>,
    /// Middleware in registration order (outermost first).
    middleware: Vec<Arc<dyn Middleware>>,
    /// Hook run when a channel opens.
    on_open: Option<LifecycleHook>,
    /// Hook run when a channel closes.
    on_close: Option<LifecycleHook>,
    /// Per-channel configuration.
    config: ChannelConfig,
}

impl EngineBuilder {
    /// Register the handler for a local proc.
    ///
    /// The handler receives input-validated arguments and the ambient
    /// [`RequestContext`]; its result is validated against the route's
    /// output shape before it is sent.
    pub fn proc<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Value, Arc<RequestContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: BoxedProcHandler = Arc::new(move |args, ctx| handler(args, ctx).boxed());
        self.registered
            .push((EndpointKind::Proc, name.to_owned(), RegisteredHandler::Proc(handler)));
        self
    }

    /// Register the handler for a local streamer.
    ///
    /// The handler returns the stream of chunks to send; each chunk is
    /// validated against the route's output shape.  Dropping the
    /// stream is the cancellation path, so handlers that need cleanup
    /// should do it in a drop guard.
    pub fn streamer<F, S>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Value, Arc<RequestContext>) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: BoxedStreamerHandler = Arc::new(move |args, ctx| handler(args, ctx).boxed());
        self.registered.push((
            EndpointKind::Streamer,
            name.to_owned(),
            RegisteredHandler::Streamer(handler),
        ));
        self
    }

    /// Add a middleware layer.
    ///
    /// Layers run around every inbound call, in the order they were
    /// added.
    pub fn middleware<M: Middleware>(mut self, layer: M) -> Self {
        self.middleware.push(Arc::new(layer));
        self
    }

    /// Run `hook` when a channel's loop starts.
    pub fn on_open<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Channel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_open = Some(Arc::new(move |channel| hook(channel).boxed()));
        self
    }

    /// Run `hook` when a channel has torn down.
    pub fn on_close<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<Channel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_close = Some(Arc::new(move |channel| hook(channel).boxed()));
        self
    }

    /// Set the per-channel configuration.
    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Check every registration against the catalog and build the
    /// engine.
    pub fn build(self) -> Result<Engine, EngineBuilderError> {
        let EngineBuilder {
            side,
            catalog,
            registered,
            middleware,
            on_open,
            on_close,
            config,
        } = self;

        let mut handlers = HandlerSet::default();
        for (kind, name, handler) in registered {
            if !catalog.contains(side, kind, &name) {
                return Err(EngineBuilderError::NoSuchRoute { side, kind, name });
            }
            let duplicate = match handler {
                RegisteredHandler::Proc(h) => handlers
                    .procs
                    .insert(name.clone().into_boxed_str(), h)
                    .is_some(),
                RegisteredHandler::Streamer(h) => handlers
                    .streamers
                    .insert(name.clone().into_boxed_str(), h)
                    .is_some(),
            };
            if duplicate {
                return Err(EngineBuilderError::DuplicateHandler { kind, name });
            }
        }

        Ok(Engine {
            shared: Arc::new(EngineShared {
                side,
                catalog,
                handlers,
                middleware,
                on_open,
                on_close,
                config,
            }),
        })
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("side", &self.side)
            .field("handlers", &self.registered.len())
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::needless_pass_by_value)]

    use super::*;
    use crosstalk_base::Validator;
    use serde_json::json;

    /// A catalog with one proc and one streamer on the server side.
    fn catalog() -> Catalog {
        Catalog::builder()
            .proc(
                Side::Server,
                "uppercase",
                Validator::identity(),
                Validator::identity(),
            )
            .streamer(
                Side::Server,
                "count_up",
                Validator::identity(),
                Validator::identity(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn handlers_must_match_the_catalog() {
        let err = Engine::builder(Side::Server, catalog())
            .proc("not_in_catalog", |_args, _ctx| async { Ok(json!(null)) })
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            EngineBuilderError::NoSuchRoute { name, .. } if name == "not_in_catalog"
        ));

        // Registering a streamer handler under a proc route is a kind
        // mismatch, not a variant of "close enough".
        let err = Engine::builder(Side::Server, catalog())
            .streamer("uppercase", |_args, _ctx| {
                futures::stream::empty::<Result<Value, HandlerError>>()
            })
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            EngineBuilderError::NoSuchRoute { kind: EndpointKind::Streamer, .. }
        ));
    }

    #[test]
    fn duplicate_handlers_are_rejected() {
        let err = Engine::builder(Side::Server, catalog())
            .proc("uppercase", |_args, _ctx| async { Ok(json!(1)) })
            .proc("uppercase", |_args, _ctx| async { Ok(json!(2)) })
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            EngineBuilderError::DuplicateHandler { name, .. } if name == "uppercase"
        ));
    }

    #[test]
    fn partial_implementations_are_allowed() {
        // A side may implement only some of its catalog routes; calls
        // to the rest get a NoSuchRoute error frame at dispatch time.
        let engine = Engine::builder(Side::Server, catalog()).build().unwrap();
        assert_eq!(engine.side(), Side::Server);
        assert_eq!(engine.catalog().len(), 2);
    }
}
