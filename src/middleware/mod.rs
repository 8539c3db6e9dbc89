//! Handler and middleware contract.
//!
//! # Data Flow
//! ```text
//! Chain [m1, m2, m3] + handler h
//!     → m1(m2(m3(h)))
//!     → m1 pre → m2 pre → m3 pre → h → m3 post → m2 post → m1 post
//! ```
//!
//! # Design Decisions
//! - Handlers are shared function objects (`Arc<dyn Fn>`), cloning is cheap
//! - Middleware is `Handler -> Handler`; per-middleware state is captured once
//!   at construction, so wrapping a handler never recreates buckets or breakers
//! - The `Context` is passed explicitly and forwarded unchanged
//! - Interoperates with `tower` (`Service` / `Layer`), see `chain.rs`

pub mod chain;

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;

use crate::context::Context;
use crate::error::Error;

pub use chain::{chain, Chain};

pub type BoxFuture<T> = futures_util::future::BoxFuture<'static, T>;

type HandlerFn<Req, Resp> = dyn Fn(Context, Req) -> BoxFuture<Result<Resp, Error>> + Send + Sync;
type MiddlewareFn<Req, Resp> = dyn Fn(Handler<Req, Resp>) -> Handler<Req, Resp> + Send + Sync;

/// The unit of request processing.
pub struct Handler<Req, Resp> {
    inner: Arc<HandlerFn<Req, Resp>>,
}

impl<Req, Resp> Clone for Handler<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Req, Resp> Handler<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Error>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |ctx, req| f(ctx, req).boxed()),
        }
    }

    /// Invoke the handler. May panic if the underlying function does; wrap the
    /// chain with the recovery middleware to contain that.
    pub fn call(&self, ctx: Context, req: Req) -> BoxFuture<Result<Resp, Error>> {
        (self.inner)(ctx, req)
    }
}

/// A function transforming one handler into another.
pub struct Middleware<Req, Resp> {
    inner: Arc<MiddlewareFn<Req, Resp>>,
}

impl<Req, Resp> Clone for Middleware<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Req, Resp> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Handler<Req, Resp>) -> Handler<Req, Resp> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Middleware that returns the wrapped handler untouched.
    pub fn identity() -> Self {
        Self::new(|next| next)
    }

    pub fn wrap(&self, next: Handler<Req, Resp>) -> Handler<Req, Resp> {
        (self.inner)(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handler_is_shared_and_callable_repeatedly() {
        let h = Handler::new(|_ctx, n: u32| async move { Ok::<_, Error>(n * 2) });
        let h2 = h.clone();
        assert_eq!(h.call(Context::new(), 2).await.unwrap(), 4);
        assert_eq!(h2.call(Context::new(), 5).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn identity_passes_through() {
        let h = Handler::new(|_ctx, s: String| async move { Ok::<_, Error>(s.len()) });
        let wrapped = Middleware::identity().wrap(h);
        assert_eq!(wrapped.call(Context::new(), "four".into()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn middleware_forwards_context() {
        let h = Handler::new(|ctx: Context, _: ()| async move { Ok::<_, Error>(ctx.is_done()) });
        let m = Middleware::new(|next: Handler<(), bool>| {
            Handler::new(move |ctx, req| next.call(ctx, req))
        });
        let ctx = Context::new();
        ctx.token().cancel();
        assert!(m.wrap(h).call(ctx, ()).await.unwrap());
    }
}
