//! Handler, middleware and hook types.
//!
//! Middleware is a `Handler -> Handler` transform: it receives the next handler in
//! the chain and returns a handler wrapping it.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use maxbot_core::{MaxbotError, Result};

use crate::context::{Context, Meta};

pub type HandlerFuture = BoxFuture<'static, Result<()>>;

pub type Handler = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync>;

pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Returns `true` when the error is handled. The future may borrow the error.
pub type ErrorHandler =
    Arc<dyn for<'a> Fn(&'a MaxbotError, Context) -> BoxFuture<'a, bool> + Send + Sync>;

pub type MetaResolver = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<Meta>> + Send + Sync>;

/// Boxes an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx: Context| -> HandlerFuture { Box::pin(f(ctx)) })
}

/// Builds middleware from `f(ctx, next)`; call `next(ctx).await` to continue the chain.
pub fn middleware<F, Fut>(f: F) -> Middleware
where
    F: Fn(Context, Handler) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |next: Handler| {
        let f = f.clone();
        let wrapped: Handler =
            Arc::new(move |ctx: Context| -> HandlerFuture { Box::pin(f(ctx, next.clone())) });
        wrapped
    })
}

/// Wraps `handler` so that `middlewares[0]` is outermost.
pub fn chain(handler: Handler, middlewares: &[Middleware]) -> Handler {
    middlewares
        .iter()
        .rev()
        .fold(handler, |next, middleware| middleware(next))
}
