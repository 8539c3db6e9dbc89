//! Microservice scaffolding: an application lifecycle orchestrator and a
//! resilience middleware pipeline.
//!
//! # Architecture Overview
//!
//! ```text
//!   App (lifecycle)
//!     ├── hooks: before_start / after_start / before_stop / after_stop
//!     ├── signals → stop
//!     └── servers (transport::Server)
//!           └── HttpServer ──▶ per request: Context + HttpTransport
//!                                 │
//!                                 ▼
//!           middleware::Chain [recovery → tracing → metrics → logging
//!                              → rate_limit → circuit_breaker]
//!                                 │
//!                                 ▼
//!                           business handler
//! ```

// Core contracts
pub mod context;
pub mod error;
pub mod middleware;
pub mod transport;

// Orchestration
pub mod lifecycle;

// Cross-cutting concerns
pub mod config;
pub mod observability;
pub mod resilience;

pub use context::Context;
pub use error::{BoxError, Error, Result};
pub use lifecycle::{App, AppBuilder, AppInfo, ShutdownHandle};
pub use middleware::{chain, Chain, Handler, Middleware};
pub use transport::http::HttpServer;
pub use transport::{Server, Side, Transporter};
