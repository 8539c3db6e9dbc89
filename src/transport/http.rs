//! HTTP server adapter.
//!
//! # Responsibilities
//! - Bind the listener and serve an Axum router
//! - Run every request through the middleware chain with a `Context`
//!   carrying an `HttpTransport`
//! - Map chain errors to HTTP status codes with a JSON body
//! - Stop gracefully when the application stops
//!
//! # Status Mapping
//! ```text
//! RateLimitExceeded              → 429
//! CircuitOpen / TooManyRequests  → 503
//! DeadlineExceeded               → 504
//! anything else                  → 500
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{MatchedPath, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::{self as axum_middleware, Next},
    response::{IntoResponse, Response},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::schema::HttpConfig;
use crate::context::Context;
use crate::error::{BoxError, Error};
use crate::middleware::{Chain, Handler, Middleware};
use crate::transport::{Header, Kind, Metadata, Server, ServerOptions, Transporter};

pub const DEFAULT_ADDRESS: &str = "0.0.0.0:8000";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport of a single inbound HTTP request.
#[derive(Debug)]
pub struct HttpTransport {
    operation: String,
    request: Metadata,
    reply: Metadata,
}

impl HttpTransport {
    /// Operation is `"METHOD /path"`, using the matched route pattern when known.
    pub fn from_request(request: &Request) -> Self {
        let path = request
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());
        let headers = request
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)));
        Self {
            operation: format!("{} {}", request.method(), path),
            request: headers.collect(),
            reply: Metadata::new(),
        }
    }
}

impl Transporter for HttpTransport {
    fn kind(&self) -> Kind {
        Kind::HTTP
    }

    fn operation(&self) -> &str {
        &self.operation
    }

    fn request_header(&self) -> &dyn Header {
        &self.request
    }

    fn reply_header(&self) -> &dyn Header {
        &self.reply
    }
}

pub type HttpChain = Chain<Request, Response>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServeState {
    Idle,
    Listening(SocketAddr),
    Stopped,
}

/// An Axum server managed by the application lifecycle.
pub struct HttpServer {
    address: String,
    timeout: Duration,
    router: Mutex<Option<Router>>,
    chain: HttpChain,
    options: Mutex<ServerOptions>,
    shutdown: CancellationToken,
    state: watch::Sender<ServeState>,
}

impl HttpServer {
    pub fn new(router: Router) -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            timeout: DEFAULT_TIMEOUT,
            router: Mutex::new(Some(router)),
            chain: Chain::new(),
            options: Mutex::new(ServerOptions::default()),
            shutdown: CancellationToken::new(),
            state: watch::Sender::new(ServeState::Idle),
        }
    }

    pub fn from_config(router: Router, config: &HttpConfig) -> Self {
        Self::new(router)
            .with_address(config.address.clone())
            .with_timeout(config.timeout())
    }

    /// Bind address; port 0 picks a free port (see `local_addr`).
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Per-request timeout, applied both as a tower layer and as the
    /// deadline of the request `Context`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Append a middleware to the request chain.
    pub fn with_middleware(mut self, middleware: Middleware<Request, Response>) -> Self {
        self.chain.push(middleware);
        self
    }

    pub fn with_chain(mut self, chain: HttpChain) -> Self {
        self.chain = chain;
        self
    }

    /// Options received from the application at build time.
    pub fn options(&self) -> ServerOptions {
        self.options.lock().clone()
    }

    /// Address actually bound, once listening. `None` if the server stopped
    /// or failed to bind before listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| *state != ServeState::Idle)
            .await
            .map(|state| *state)
            .ok()?;
        match state {
            ServeState::Listening(addr) => Some(addr),
            _ => None,
        }
    }

    #[allow(deprecated)]
    fn build_router(&self, router: Router, base: Context) -> Router {
        let dispatch = Arc::new(Dispatch {
            chain: self.chain.clone(),
            base,
            timeout: self.timeout,
        });
        router
            .layer(axum_middleware::from_fn_with_state(dispatch, dispatch_request))
            .layer(TimeoutLayer::new(self.timeout))
            .layer(TraceLayer::new_for_http())
    }
}

#[async_trait]
impl Server for HttpServer {
    fn init(&self, options: &ServerOptions) -> Result<(), BoxError> {
        *self.options.lock() = options.clone();
        Ok(())
    }

    async fn start(&self, ctx: Context) -> Result<(), BoxError> {
        let router = self
            .router
            .lock()
            .take()
            .ok_or_else(|| Error::config("HTTP server can only be started once"))?;

        let listener = match TcpListener::bind(&self.address).await {
            Ok(listener) => listener,
            Err(err) => {
                self.state.send_replace(ServeState::Stopped);
                return Err(err.into());
            }
        };
        let addr = listener.local_addr()?;
        self.state.send_replace(ServeState::Listening(addr));
        tracing::info!(address = %addr, server = %self.options.lock().name, "HTTP server listening");

        let app = self.build_router(router, ctx.clone());
        let shutdown = self.shutdown.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = ctx.done() => {}
                    _ = shutdown.cancelled() => {}
                }
            })
            .await;

        self.state.send_replace(ServeState::Stopped);
        tracing::info!(address = %addr, "HTTP server stopped");
        served.map_err(Into::into)
    }

    async fn stop(&self, ctx: Context) -> Result<(), BoxError> {
        self.shutdown.cancel();
        let mut rx = self.state.subscribe();
        let idle = *rx.borrow() == ServeState::Idle;
        if idle {
            return Ok(());
        }
        ctx.run(async move {
            rx.wait_for(|state| *state == ServeState::Stopped)
                .await
                .map(|_| ())
        })
        .await?
        .map_err(Into::into)
    }
}

struct Dispatch {
    chain: HttpChain,
    base: Context,
    timeout: Duration,
}

async fn dispatch_request(
    State(dispatch): State<Arc<Dispatch>>,
    request: Request,
    next: Next,
) -> Response {
    let transport = Arc::new(HttpTransport::from_request(&request));
    let ctx = dispatch
        .base
        .child()
        .with_timeout(dispatch.timeout)
        .with_server_transport(transport.clone());

    // The router behind `next` is invoked at most once per request.
    let next = Arc::new(Mutex::new(Some(next)));
    let terminal = Handler::new(move |_ctx: Context, request: Request| {
        let next = next.lock().take();
        async move {
            match next {
                Some(next) => Ok(next.run(request).await),
                None => Err(Error::handler("request handler invoked twice")),
            }
        }
    });

    let mut response = match dispatch.chain.then(terminal).call(ctx, request).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    };

    let headers = response.headers_mut();
    for (key, value) in transport.reply.entries() {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(key), HeaderValue::try_from(value)) {
            headers.insert(name, value);
        }
    }
    response
}

/// Status code for an error leaving the chain.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        Error::CircuitOpen { .. } | Error::TooManyRequests { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &Error) -> Response {
    let body = Json(json!({
        "error": err.reason(),
        "message": err.to_string(),
    }));
    (status_for(err), body).into_response()
}
