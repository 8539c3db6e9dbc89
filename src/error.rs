//! Error taxonomy shared by the middleware pipeline and the orchestrator.
//!
//! # Design Decisions
//! - Rejections (rate limit, open circuit) are typed so outer layers can fall back
//! - Business errors and server errors pass through transparently
//! - Panics only ever surface as `FaultRecovered`, produced by the recovery layer

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::resilience::recovery::FaultInfo;

/// Boxed error used at the collaborator seams (servers, hooks, business handlers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Lifecycle point at which a hook failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    BeforeStart,
    AfterStart,
    BeforeStop,
    AfterStop,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HookStage::BeforeStart => "before_start",
            HookStage::AfterStart => "after_start",
            HookStage::BeforeStop => "before_stop",
            HookStage::AfterStop => "after_stop",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid construction parameters.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A panic converted into an error at the recovery boundary.
    #[error("panic recovered: {}", .0.message)]
    FaultRecovered(FaultInfo),

    /// Admission rejected by a token bucket.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Fail-fast rejection from an open circuit.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// Half-open circuit already has `max_requests` trials in flight.
    #[error("circuit breaker '{name}' is half-open and at its trial limit")]
    TooManyRequests { name: String },

    /// A lifecycle hook failed.
    #[error("{stage} hook failed: {source}")]
    Hook {
        stage: HookStage,
        #[source]
        source: BoxError,
    },

    /// Propagated verbatim from `Server::start` / `Server::stop`.
    #[error(transparent)]
    Server(BoxError),

    /// `Server::stop` did not return within the configured stop timeout.
    #[error("server stop timed out after {0:?}")]
    StopTimeout(Duration),

    #[error("context cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Error returned by a business handler.
    #[error(transparent)]
    Handler(BoxError),

    /// An orchestrator task panicked or was aborted.
    #[error("lifecycle task failed: {0}")]
    TaskPanicked(String),
}

impl Error {
    /// Wrap any business error.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Handler(err.into())
    }

    /// Wrap any server error.
    pub fn server<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Server(err.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// True for admission rejections produced without running the wrapped handler.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::RateLimitExceeded | Error::CircuitOpen { .. } | Error::TooManyRequests { .. }
        )
    }

    /// True when a circuit breaker fallback may replace this error.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. } | Error::TooManyRequests { .. })
    }

    /// True for a cancelled context, also when wrapped by a server or handler.
    /// A deadline expiry is not a cancellation.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Server(source) | Error::Handler(source) => source
                .downcast_ref::<Error>()
                .is_some_and(Error::is_cancellation),
            _ => false,
        }
    }

    /// True for an expired context deadline, also when wrapped by a server or handler.
    pub fn is_deadline_exceeded(&self) -> bool {
        match self {
            Error::DeadlineExceeded => true,
            Error::Server(source) | Error::Handler(source) => source
                .downcast_ref::<Error>()
                .is_some_and(Error::is_deadline_exceeded),
            _ => false,
        }
    }

    /// Short machine-readable label, used for metrics and error bodies.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::FaultRecovered(_) => "panic",
            Error::RateLimitExceeded => "rate_limited",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::TooManyRequests { .. } => "too_many_requests",
            Error::Hook { .. } => "hook",
            Error::Server(_) => "server",
            Error::StopTimeout(_) => "stop_timeout",
            Error::Cancelled => "cancelled",
            Error::DeadlineExceeded => "deadline_exceeded",
            Error::Handler(_) => "handler",
            Error::TaskPanicked(_) => "task_panicked",
        }
    }
}
