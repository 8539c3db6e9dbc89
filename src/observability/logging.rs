//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global `tracing` subscriber
//! - Log every call passing through the logging middleware
//!
//! # Design Decisions
//! - JSON format for production, pretty format for development
//! - `RUST_LOG` overrides the configured level
//! - Calls slower than `slow_threshold` are logged at warn level

use std::time::{Duration, Instant};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::schema::{LogFormat, ObservabilityConfig};
use crate::context::Context;
use crate::middleware::{Handler, Middleware};
use crate::transport::Side;

pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(500);

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let json = config.log_format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .try_init()
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    disabled: bool,
    slow_threshold: Duration,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            disabled: false,
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
        }
    }
}

impl LoggingSettings {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            disabled: false,
            slow_threshold,
        }
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }
}

/// Call logging middleware for inbound calls.
pub fn server<Req, Resp>(settings: LoggingSettings) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    logging(Side::Server, settings)
}

/// Call logging middleware for outbound calls.
pub fn client<Req, Resp>(settings: LoggingSettings) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    logging(Side::Client, settings)
}

fn logging<Req, Resp>(side: Side, settings: LoggingSettings) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    if settings.disabled {
        return Middleware::identity();
    }
    let slow = settings.slow_threshold;
    Middleware::new(move |next: Handler<Req, Resp>| {
        Handler::new(move |ctx: Context, req: Req| {
            let next = next.clone();
            async move {
                let start = Instant::now();
                let (kind, operation) = match ctx.transport(side) {
                    Some(tr) => (tr.kind().to_string(), tr.operation().to_string()),
                    None => (String::new(), String::new()),
                };
                let result = next.call(ctx, req).await;
                let latency = start.elapsed();
                let latency_ms = latency.as_secs_f64() * 1000.0;

                match &result {
                    Ok(_) if latency > slow => tracing::warn!(
                        side = %side, kind = %kind, operation = %operation,
                        latency_ms, "Slow call"
                    ),
                    Ok(_) => tracing::info!(
                        side = %side, kind = %kind, operation = %operation,
                        latency_ms, code = "ok", "Call completed"
                    ),
                    Err(err) => tracing::warn!(
                        side = %side, kind = %kind, operation = %operation,
                        latency_ms, code = err.reason(), error = %err, "Call failed"
                    ),
                }
                result
            }
        })
    })
}
