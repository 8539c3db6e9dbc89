//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call entering the pipeline:
//!     → recovery.rs (panic below this point becomes an error)
//!     → rate_limit.rs (token bucket admission, reject or wait)
//!     → registry.rs (pick breaker by key)
//!         → circuit_breaker.rs (admit, fail fast, or fall back)
//!     → business handler
//! ```
//!
//! # Design Decisions
//! - Every resilience concern is a `Middleware`, composable in any order
//! - State (buckets, breakers) lives as long as the middleware, not the call
//! - Each middleware has a server and a client constructor; the side decides
//!   which transport in the `Context` is consulted
//! - A disabled middleware is the identity

pub mod circuit_breaker;
pub mod rate_limit;
pub mod recovery;
pub mod registry;

pub use circuit_breaker::{BreakerSettings, CircuitBreaker, CircuitState, Counts};
pub use rate_limit::{RateLimitSettings, TokenBucket};
pub use recovery::{FaultInfo, RecoverySettings};
pub use registry::{BreakerRegistry, CircuitBreakerLayer};
