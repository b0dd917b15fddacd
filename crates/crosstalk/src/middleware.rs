//! Onion-style middleware around inbound dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crosstalk_base::HandlerError;

use crate::ctx::RequestContext;

/// A layer that runs around every inbound call on a channel.
///
/// Layers run in the order they were added to the engine.  Each one
/// receives the ambient context and the rest of the chain as a
/// [`Next`]; calling [`Next::run`] continues with the remaining layers
/// and, at the center, the endpoint itself.  Code before that call
/// runs before the handler (this is where contexts get enriched), code
/// after it runs once the handler is done.
///
/// A layer that returns an error without calling `next` short-circuits
/// the call; the peer sees the error exactly as if the handler had
/// failed.  Returning `Ok(())` without calling `next` does not produce
/// silence: the peer gets an error reply, since no result was ever
/// made.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Run this layer around the rest of the chain.
    async fn around(
        &self,
        ctx: Arc<RequestContext>,
        next: Next<'_>,
    ) -> Result<(), HandlerError>;
}

/// The not-yet-entered remainder of the middleware chain.
pub struct Next<'a> {
    /// Layers still to enter, outermost first.
    rest: &'a [Arc<dyn Middleware>],
    /// The endpoint invocation at the center of the onion.
    endpoint: BoxFuture<'a, Result<(), HandlerError>>,
}

impl<'a> Next<'a> {
    /// Build the chain entry point over `layers` and an endpoint.
    pub(crate) fn new(
        layers: &'a [Arc<dyn Middleware>],
        endpoint: BoxFuture<'a, Result<(), HandlerError>>,
    ) -> Self {
        Next {
            rest: layers,
            endpoint,
        }
    }

    /// Enter the next layer, or the endpoint if no layers remain.
    pub async fn run(self, ctx: &Arc<RequestContext>) -> Result<(), HandlerError> {
        match self.rest.split_first() {
            None => self.endpoint.await,
            Some((layer, rest)) => {
                let next = Next {
                    rest,
                    endpoint: self.endpoint,
                };
                layer.around(Arc::clone(ctx), next).await
            }
        }
    }
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("layers_remaining", &self.rest.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::needless_pass_by_value)]

    use super::*;
    use crate::msgs::RequestId;
    use crosstalk_base::Side;
    use futures::FutureExt;
    use futures_await_test::async_test;
    use serde_json::json;
    use std::sync::Weak;

    /// A context with no channel behind it, for chain tests.
    fn bare_ctx() -> Arc<RequestContext> {
        Arc::new(RequestContext::new(
            Weak::new(),
            crate::channel::ChannelId::for_test(),
            RequestId::from(1),
            Side::Client,
        ))
    }

    /// Middleware appending its tag to a "trail" context field.
    struct Tag(&'static str);

    #[async_trait]
    impl Middleware for Tag {
        async fn around(
            &self,
            ctx: Arc<RequestContext>,
            next: Next<'_>,
        ) -> Result<(), HandlerError> {
            let mut trail = ctx.field("trail").unwrap_or_else(|| json!([]));
            trail
                .as_array_mut()
                .expect("trail was not an array")
                .push(json!(self.0));
            ctx.set_field("trail", trail);
            next.run(&ctx).await
        }
    }

    /// Middleware that fails before reaching the endpoint.
    struct Refuse;

    #[async_trait]
    impl Middleware for Refuse {
        async fn around(
            &self,
            _ctx: Arc<RequestContext>,
            _next: Next<'_>,
        ) -> Result<(), HandlerError> {
            Err(HandlerError::new("refused"))
        }
    }

    #[async_test]
    async fn layers_run_in_declared_order() {
        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(Tag("outer")), Arc::new(Tag("inner"))];
        let ctx = bare_ctx();
        let endpoint = {
            let ctx = Arc::clone(&ctx);
            async move {
                // The endpoint sees the fully enriched context.
                assert_eq!(ctx.field("trail").unwrap(), json!(["outer", "inner"]));
                Ok(())
            }
            .boxed()
        };
        Next::new(&layers, endpoint).run(&ctx).await.unwrap();
        assert_eq!(ctx.field("trail").unwrap(), json!(["outer", "inner"]));
    }

    #[async_test]
    async fn short_circuit_skips_the_endpoint() {
        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(Refuse), Arc::new(Tag("unreached"))];
        let ctx = bare_ctx();
        let endpoint: BoxFuture<'static, Result<(), HandlerError>> =
            async move { panic!("endpoint should not run") }.boxed();
        let err = Next::new(&layers, endpoint).run(&ctx).await.unwrap_err();
        assert_eq!(err.message(), "refused");
        assert!(ctx.field("trail").is_none());
    }

    #[async_test]
    async fn empty_chain_is_just_the_endpoint() {
        let layers: Vec<Arc<dyn Middleware>> = Vec::new();
        let ctx = bare_ctx();
        let endpoint: BoxFuture<'static, Result<(), HandlerError>> =
            async move { Ok(()) }.boxed();
        Next::new(&layers, endpoint).run(&ctx).await.unwrap();
    }
}
