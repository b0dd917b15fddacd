//! Inbound call dispatch: from a decoded `rpc` frame to the frames
//! that answer it.
//!
//! Dispatch never blocks the connection loop: a call that can start is
//! pushed onto the loop's set of running futures, and calls for
//! different request ids interleave freely from then on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, FuturesUnordered};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tracing::debug;

use crosstalk_base::{EndpointKind, HandlerError, Validator};

use crate::channel::Channel;
use crate::ctx::RequestContext;
use crate::engine::EngineShared;
use crate::middleware::Next;
use crate::msgs::{Frame, ReplyBody, RequestId};
use crate::stop::stoppable;

/// A type-erased unary handler.
pub(crate) type BoxedProcHandler = Arc<
    dyn Fn(Value, Arc<RequestContext>) -> BoxFuture<'static, Result<Value, HandlerError>>
        + Send
        + Sync,
>;

/// A type-erased streamer handler.
pub(crate) type BoxedStreamerHandler = Arc<
    dyn Fn(Value, Arc<RequestContext>) -> BoxStream<'static, Result<Value, HandlerError>>
        + Send
        + Sync,
>;

/// The registered local handlers for one engine.
#[derive(Clone, Default)]
pub(crate) struct HandlerSet {
    /// Unary handlers by endpoint name.
    pub(crate) procs: HashMap<Box<str>, BoxedProcHandler>,
    /// Streamer handlers by endpoint name.
    pub(crate) streamers: HashMap<Box<str>, BoxedStreamerHandler>,
}

/// Resolve and launch one inbound call.
///
/// Returns an immediate error frame when the call cannot start at all;
/// otherwise pushes the running call onto `running` and returns
/// nothing.
pub(crate) fn incoming_call(
    channel: &Arc<Channel>,
    running: &mut FuturesUnordered<BoxFuture<'static, ()>>,
    req_id: RequestId,
    method: String,
    args: Value,
    streaming: bool,
) -> Option<Frame> {
    let engine = Arc::clone(channel.engine_shared());
    let kind = if streaming {
        EndpointKind::Streamer
    } else {
        EndpointKind::Proc
    };

    let Some(route) = engine.catalog.route(engine.side, kind, &method) else {
        debug!("peer called unknown {} {:?}", kind, method);
        return Some(error_frame(
            kind,
            req_id,
            format!(
                "NoSuchRoute: no {} named {:?} on the {} side",
                kind, method, engine.side
            ),
        ));
    };
    let output = route.output().clone();
    let args = match route.input().check(args) {
        Ok(v) => v,
        Err(e) => {
            debug!("rejecting {} {:?}: {}", kind, method, e);
            return Some(error_frame(kind, req_id, e.to_string()));
        }
    };

    let ctx = Arc::new(RequestContext::new(
        channel.downgrade(),
        channel.id(),
        req_id,
        engine.side.opposite(),
    ));
    let tx = channel.outbound();

    match kind {
        EndpointKind::Proc => {
            let Some(handler) = engine.handlers.procs.get(method.as_str()).cloned() else {
                return Some(no_handler_frame(&engine, kind, req_id, &method));
            };
            running.push(run_proc(engine, tx, handler, output, ctx, req_id, args).boxed());
        }
        EndpointKind::Streamer => {
            let Some(handler) = engine.handlers.streamers.get(method.as_str()).cloned() else {
                return Some(no_handler_frame(&engine, kind, req_id, &method));
            };
            // Register the stop handle before the drain can first run,
            // so a stream-cancel that races the first chunk still
            // lands.
            let (handle, drain) =
                stoppable(run_streamer(engine, tx, handler, output, ctx, req_id, args));
            channel.register_inflight(req_id, handle);
            let channel = Arc::clone(channel);
            running.push(
                async move {
                    // Stopped just means the peer cancelled us.
                    let _ = drain.await;
                    channel.remove_inflight(req_id);
                }
                .boxed(),
            );
        }
    }
    None
}

/// Shape an immediate failure the way the call kind expects.
fn error_frame(kind: EndpointKind, req_id: RequestId, error: String) -> Frame {
    match kind {
        EndpointKind::Proc => Frame::Reply {
            req_id,
            body: ReplyBody::failure(error),
        },
        EndpointKind::Streamer => Frame::StreamError { req_id, error },
    }
}

/// The error frame for a route that exists in the catalog but has no
/// local handler.
fn no_handler_frame(
    engine: &EngineShared,
    kind: EndpointKind,
    req_id: RequestId,
    method: &str,
) -> Frame {
    debug!("peer called unimplemented {} {:?}", kind, method);
    error_frame(
        kind,
        req_id,
        format!(
            "NoSuchRoute: {} {:?} has no handler on the {} side",
            kind, method, engine.side
        ),
    )
}

/// Drive one unary call to its reply frame.
async fn run_proc(
    engine: Arc<EngineShared>,
    mut tx: mpsc::Sender<Frame>,
    handler: BoxedProcHandler,
    output: Validator,
    ctx: Arc<RequestContext>,
    req_id: RequestId,
    args: Value,
) {
    // The endpoint parks its result here; the middleware chain itself
    // only reports success or failure.
    let slot: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let endpoint = {
        let slot = Arc::clone(&slot);
        let ctx = Arc::clone(&ctx);
        async move {
            let value = handler(args, ctx).await?;
            *slot.lock().expect("poisoned lock") = Some(value);
            Ok(())
        }
        .boxed()
    };

    let outcome = Next::new(&engine.middleware, endpoint).run(&ctx).await;
    let body = match outcome {
        Ok(()) => {
            let value = slot.lock().expect("poisoned lock").take();
            match value {
                Some(v) => match output.check(v) {
                    Ok(v) => ReplyBody::success(v),
                    Err(e) => ReplyBody::failure(e.to_string()),
                },
                None => ReplyBody::failure(
                    "HandlerError: middleware completed without invoking the endpoint",
                ),
            }
        }
        Err(e) => ReplyBody::failure(e.message().to_owned()),
    };
    // A send failure means the loop is gone; there is no one to tell.
    let _ = tx.send(Frame::Reply { req_id, body }).await;
}

/// Drive one streamer call: acknowledgement, drain, terminal frame.
async fn run_streamer(
    engine: Arc<EngineShared>,
    mut tx: mpsc::Sender<Frame>,
    handler: BoxedStreamerHandler,
    output: Validator,
    ctx: Arc<RequestContext>,
    req_id: RequestId,
    args: Value,
) {
    if tx
        .send(Frame::Reply {
            req_id,
            body: ReplyBody::stream_accepted(),
        })
        .await
        .is_err()
    {
        return;
    }

    let endpoint = {
        let mut tx = tx.clone();
        let ctx = Arc::clone(&ctx);
        async move {
            let mut chunks = handler(args, ctx);
            while let Some(item) = chunks.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Frame::StreamError {
                                req_id,
                                error: e.message().to_owned(),
                            })
                            .await;
                        return Ok(());
                    }
                };
                match output.check(chunk) {
                    Ok(v) => {
                        if tx.send(Frame::Chunk { req_id, chunk: v }).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        // Returning here drops the handler's stream,
                        // which is its cancellation path.
                        let _ = tx
                            .send(Frame::StreamError {
                                req_id,
                                error: e.to_string(),
                            })
                            .await;
                        return Ok(());
                    }
                }
            }
            let _ = tx.send(Frame::End { req_id }).await;
            Ok(())
        }
        .boxed()
    };

    if let Err(e) = Next::new(&engine.middleware, endpoint).run(&ctx).await {
        let _ = tx
            .send(Frame::StreamError {
                req_id,
                error: e.message().to_owned(),
            })
            .await;
    }
}
