//! Transport contracts consumed by the orchestrator and the middleware pipeline.
//!
//! # Data Flow
//! ```text
//! App::build
//!     → Server::init (id, name, version)
//! App::run
//!     → Server::start (blocks while serving)
//!     → per call: Context + Transporter → middleware chain → handler
//! App::stop
//!     → Server::stop (bounded by stop timeout)
//! ```
//!
//! # Design Decisions
//! - Wire protocols live behind `Server`; this crate only ships an HTTP adapter
//! - `Transporter` describes a call (kind, operation, headers) without owning it
//! - Headers use interior mutability so reply headers can be set through `&self`

pub mod http;
pub mod metadata;

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::BoxError;

pub use metadata::Metadata;

/// Which end of a call a middleware is wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Server,
    Client,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Server => "server",
            Side::Client => "client",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport kind, e.g. `http` or `grpc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Kind(Cow<'static, str>);

impl Kind {
    pub const GRPC: Kind = Kind(Cow::Borrowed("grpc"));
    pub const HTTP: Kind = Kind(Cow::Borrowed("http"));

    pub fn new(kind: impl Into<String>) -> Self {
        Kind(Cow::Owned(kind.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key/value header storage of a transport.
pub trait Header: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn keys(&self) -> Vec<String>;
}

/// Describes the call currently flowing through a handler chain.
pub trait Transporter: Send + Sync {
    fn kind(&self) -> Kind;

    /// Full operation selector, e.g. `/helloworld.Greeter/SayHello` or `GET /users`.
    fn operation(&self) -> &str;

    fn request_header(&self) -> &dyn Header;

    /// Reply header; only meaningful on the server side.
    fn reply_header(&self) -> &dyn Header;
}

/// A plain in-memory transporter, used for outbound calls and by adapters
/// that have no richer transport type of their own.
#[derive(Debug)]
pub struct Transport {
    kind: Kind,
    operation: String,
    request: Metadata,
    reply: Metadata,
}

impl Transport {
    pub fn new(kind: Kind, operation: impl Into<String>) -> Self {
        Self {
            kind,
            operation: operation.into(),
            request: Metadata::new(),
            reply: Metadata::new(),
        }
    }

    pub fn with_request_header(self, key: &str, value: &str) -> Self {
        self.request.set(key, value);
        self
    }
}

impl Transporter for Transport {
    fn kind(&self) -> Kind {
        self.kind.clone()
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

/// Identity handed to every server at application build time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerOptions {
    pub id: String,
    pub name: String,
    pub version: String,
}

/// A long-running, independently listening server.
#[async_trait]
pub trait Server: Send + Sync {
    /// Called once while the application is being built.
    fn init(&self, options: &ServerOptions) -> Result<(), BoxError> {
        let _ = options;
        Ok(())
    }

    /// Serve until the listener terminates or `ctx` is cancelled.
    async fn start(&self, ctx: Context) -> Result<(), BoxError>;

    /// Stop serving; should return before the deadline carried by `ctx`.
    async fn stop(&self, ctx: Context) -> Result<(), BoxError>;
}

#[async_trait]
impl<S> Server for Arc<S>
where
    S: Server + ?Sized,
{
    fn init(&self, options: &ServerOptions) -> Result<(), BoxError> {
        (**self).init(options)
    }

    async fn start(&self, ctx: Context) -> Result<(), BoxError> {
        (**self).start(ctx).await
    }

    async fn stop(&self, ctx: Context) -> Result<(), BoxError> {
        (**self).stop(ctx).await
    }
}
