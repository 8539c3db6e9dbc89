//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a service.
//! All types derive Serde traits for deserialization from config files, and
//! every section converts into the runtime settings of the component it
//! configures.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::lifecycle::Signal;
use crate::observability::LoggingSettings;
use crate::resilience::circuit_breaker::{self, BreakerSettings};
use crate::resilience::{RateLimitSettings, RecoverySettings};

/// Root configuration of a service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct KitConfig {
    /// Application identity and lifecycle.
    pub app: AppConfig,

    /// HTTP server settings.
    pub http: HttpConfig,

    /// Panic recovery middleware.
    pub recovery: RecoveryConfig,

    /// Token bucket middleware.
    pub rate_limit: RateLimitConfig,

    /// Circuit breaker middleware.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Call logging middleware.
    pub logging: LoggingConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Application identity and lifecycle.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Instance id; a UUID v4 is generated when absent.
    pub id: Option<String>,

    pub name: String,

    pub version: String,

    pub metadata: BTreeMap<String, String>,

    /// Upper bound for each server's stop, in seconds.
    pub stop_timeout_secs: u64,

    /// Signals that trigger a graceful stop. Empty disables signal handling.
    pub signals: Vec<Signal>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            metadata: BTreeMap::new(),
            stop_timeout_secs: 10,
            signals: Signal::defaults(),
        }
    }
}

impl AppConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address (e.g., "0.0.0.0:8000").
    pub address: String,

    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8000".to_string(),
            timeout_secs: 30,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Panic recovery middleware.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,

    /// Maximum backtrace bytes kept per recovered panic.
    pub stack_size: usize,

    pub disable_stack: bool,

    pub disable_print: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stack_size: crate::resilience::recovery::DEFAULT_STACK_SIZE,
            disable_stack: false,
            disable_print: false,
        }
    }
}

impl RecoveryConfig {
    pub fn settings(&self) -> Result<RecoverySettings, Error> {
        RecoverySettings::builder()
            .disabled(!self.enabled)
            .stack_size(self.stack_size)
            .disable_stack(self.disable_stack)
            .disable_print(self.disable_print)
            .build()
    }
}

/// Token bucket middleware.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Bucket size (burst).
    pub capacity: u64,

    /// Refill rate in tokens per second.
    pub rate: f64,

    /// Block until a token is available instead of rejecting.
    pub wait_if_full: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: crate::resilience::rate_limit::DEFAULT_CAPACITY,
            rate: crate::resilience::rate_limit::DEFAULT_RATE,
            wait_if_full: false,
        }
    }
}

impl RateLimitConfig {
    pub fn settings(&self) -> Result<RateLimitSettings, Error> {
        RateLimitSettings::builder()
            .disabled(!self.enabled)
            .capacity(self.capacity)
            .rate(self.rate)
            .wait_if_full(self.wait_if_full)
            .build()
    }
}

/// Circuit breaker middleware.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,

    /// Prefix of default breaker keys; the side name when empty.
    pub name: String,

    /// Trial requests while half-open, and successes needed to close.
    pub max_requests: u32,

    /// Closed-state counting window in seconds; 0 never resets.
    pub interval_secs: u64,

    /// Seconds spent open before probing.
    pub timeout_secs: u64,

    /// Requests needed in a window before the breaker may trip.
    pub min_requests: u32,

    /// Failure ratio at or above which the breaker trips.
    pub failure_ratio: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: String::new(),
            max_requests: circuit_breaker::DEFAULT_MAX_REQUESTS,
            interval_secs: circuit_breaker::DEFAULT_INTERVAL.as_secs(),
            timeout_secs: circuit_breaker::DEFAULT_TIMEOUT.as_secs(),
            min_requests: circuit_breaker::DEFAULT_MIN_REQUESTS,
            failure_ratio: circuit_breaker::DEFAULT_FAILURE_RATIO,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn settings(&self) -> Result<BreakerSettings, Error> {
        let trip = circuit_breaker::trip_on_failure_ratio(self.min_requests, self.failure_ratio);
        let mut builder = BreakerSettings::builder()
            .disabled(!self.enabled)
            .max_requests(self.max_requests)
            .interval(Duration::from_secs(self.interval_secs))
            .timeout(Duration::from_secs(self.timeout_secs))
            .ready_to_trip(move |counts| trip(counts));
        if !self.name.is_empty() {
            builder = builder.name(self.name.clone());
        }
        builder.build()
    }
}

/// Call logging middleware.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,

    /// Calls slower than this are logged at warn level.
    pub slow_threshold_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slow_threshold_ms: 500,
        }
    }
}

impl LoggingConfig {
    pub fn settings(&self) -> LoggingSettings {
        LoggingSettings::new(Duration::from_millis(self.slow_threshold_ms)).disabled(!self.enabled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
