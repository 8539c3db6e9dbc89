//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Every call through the pipeline may produce:
//!     → tracing.rs (span with request id, id propagated to outbound calls)
//!     → logging.rs (one structured event per call, warn when slow or failed)
//!     → metrics.rs (request counter and latency histogram)
//!
//! Resilience layers report into metrics.rs directly:
//!     rate limited calls, recovered panics, breaker state changes
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows from inbound to outbound calls via the `Context`
//! - Metrics are cheap and free when no exporter is installed

pub mod logging;
pub mod metrics;
pub mod tracing;

pub use logging::{init_logging, LoggingSettings};
pub use metrics::init_metrics;
