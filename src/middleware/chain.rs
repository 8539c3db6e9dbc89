//! Middleware chain composition and `tower` interop.

use std::task::{Context as TaskContext, Poll};

use tower::{Layer, Service};

use crate::context::Context;
use crate::error::Error;
use crate::middleware::{BoxFuture, Handler, Middleware};

/// Ordered middleware list; the first entry runs outermost.
pub struct Chain<Req, Resp> {
    middlewares: Vec<Middleware<Req, Resp>>,
}

impl<Req, Resp> Clone for Chain<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            middlewares: self.middlewares.clone(),
        }
    }
}

impl<Req, Resp> Default for Chain<Req, Resp> {
    fn default() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }
}

impl<Req, Resp> Chain<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware; it runs inside every middleware already added.
    pub fn with(mut self, middleware: Middleware<Req, Resp>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn push(&mut self, middleware: Middleware<Req, Resp>) {
        self.middlewares.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Wrap `handler` so the result is `m1(m2(...(handler)))`.
    pub fn then(&self, handler: Handler<Req, Resp>) -> Handler<Req, Resp> {
        self.middlewares
            .iter()
            .rev()
            .fold(handler, |next, m| m.wrap(next))
    }

    /// Collapse the chain into a single middleware.
    pub fn into_middleware(self) -> Middleware<Req, Resp> {
        Middleware::new(move |next| self.then(next))
    }
}

impl<Req, Resp> FromIterator<Middleware<Req, Resp>> for Chain<Req, Resp> {
    fn from_iter<I: IntoIterator<Item = Middleware<Req, Resp>>>(iter: I) -> Self {
        Self {
            middlewares: iter.into_iter().collect(),
        }
    }
}

/// Compose `middlewares` into one; the first listed executes outermost.
pub fn chain<Req, Resp, I>(middlewares: I) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    I: IntoIterator<Item = Middleware<Req, Resp>>,
{
    middlewares.into_iter().collect::<Chain<_, _>>().into_middleware()
}

impl<Req, Resp> Service<(Context, Req)> for Handler<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Response = Resp;
    type Error = Error;
    type Future = BoxFuture<Result<Resp, Error>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, (ctx, req): (Context, Req)) -> Self::Future {
        (self.inner)(ctx, req)
    }
}

impl<Req, Resp> Layer<Handler<Req, Resp>> for Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Service = Handler<Req, Resp>;

    fn layer(&self, inner: Handler<Req, Resp>) -> Self::Service {
        self.wrap(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tower::{ServiceBuilder, ServiceExt};

    type Log = Arc<Mutex<Vec<String>>>;

    fn tracer(name: &'static str, log: Log) -> Middleware<(), ()> {
        Middleware::new(move |next: Handler<(), ()>| {
            let log = log.clone();
            Handler::new(move |ctx, req| {
                let next = next.clone();
                let log = log.clone();
                async move {
                    log.lock().push(format!("{name} pre"));
                    let res = next.call(ctx, req).await;
                    log.lock().push(format!("{name} post"));
                    res
                }
            })
        })
    }

    fn terminal(log: Log) -> Handler<(), ()> {
        Handler::new(move |_ctx, _req| {
            let log = log.clone();
            async move {
                log.lock().push("handler".to_string());
                Ok(())
            }
        })
    }

    fn expected() -> Vec<String> {
        ["m1 pre", "m2 pre", "m3 pre", "handler", "m3 post", "m2 post", "m1 post"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[tokio::test]
    async fn first_listed_runs_outermost() {
        let log: Log = Arc::default();
        let chain = Chain::new()
            .with(tracer("m1", log.clone()))
            .with(tracer("m2", log.clone()))
            .with(tracer("m3", log.clone()));
        assert_eq!(chain.len(), 3);

        chain.then(terminal(log.clone())).call(Context::new(), ()).await.unwrap();
        assert_eq!(*log.lock(), expected());
    }

    #[tokio::test]
    async fn composed_middleware_matches_chain() {
        let log: Log = Arc::default();
        let composed = chain([
            tracer("m1", log.clone()),
            tracer("m2", log.clone()),
            tracer("m3", log.clone()),
        ]);

        composed.wrap(terminal(log.clone())).call(Context::new(), ()).await.unwrap();
        assert_eq!(*log.lock(), expected());
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_layers() {
        let log: Log = Arc::default();
        let reject = Middleware::new(|_next: Handler<(), ()>| {
            Handler::new(|_ctx, _req| async { Err(Error::RateLimitExceeded) })
        });
        let handler = Chain::new()
            .with(tracer("m1", log.clone()))
            .with(reject)
            .with(tracer("m3", log.clone()))
            .then(terminal(log.clone()));

        let err = handler.call(Context::new(), ()).await.unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded));
        assert_eq!(*log.lock(), vec!["m1 pre".to_string(), "m1 post".to_string()]);
    }

    #[tokio::test]
    async fn tower_service_builder_composes_the_same_way() {
        let log: Log = Arc::default();
        let svc = ServiceBuilder::new()
            .layer(tracer("m1", log.clone()))
            .layer(tracer("m2", log.clone()))
            .layer(tracer("m3", log.clone()))
            .service(terminal(log.clone()));

        svc.oneshot((Context::new(), ())).await.unwrap();
        assert_eq!(*log.lock(), expected());
    }
}
