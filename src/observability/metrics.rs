//! Metrics collection and exposition.
//!
//! # Metrics
//! - `microkit_requests_total` (counter): calls by kind, side, operation, code
//! - `microkit_request_duration_seconds` (histogram): call latency
//! - `microkit_rate_limited_total` (counter): calls rejected by a token bucket
//! - `microkit_panics_recovered_total` (counter): panics turned into errors
//! - `microkit_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - The Prometheus exporter is optional and serves its own scrape endpoint

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::context::Context;
use crate::error::Error;
use crate::middleware::{Handler, Middleware};
use crate::resilience::CircuitState;
use crate::transport::Side;

/// Install the Prometheus recorder and its HTTP scrape listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_request(kind: &str, side: Side, operation: &str, code: &'static str, start: Instant) {
    let labels = [
        ("kind", kind.to_string()),
        ("side", side.as_str().to_string()),
        ("operation", operation.to_string()),
    ];
    histogram!("microkit_request_duration_seconds", &labels).record(start.elapsed().as_secs_f64());

    let [kind, side, operation] = labels;
    let labels = [kind, side, operation, ("code", code.to_string())];
    counter!("microkit_requests_total", &labels).increment(1);
}

pub fn record_rate_limited(side: Side, operation: &str) {
    counter!(
        "microkit_rate_limited_total",
        "side" => side.as_str(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

pub fn record_panic_recovered(side: Side) {
    counter!("microkit_panics_recovered_total", "side" => side.as_str()).increment(1);
}

pub fn record_circuit_state(name: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("microkit_circuit_state", "breaker" => name.to_string()).set(value);
}

/// Request metrics middleware for inbound calls.
pub fn server<Req, Resp>() -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    metrics_middleware(Side::Server)
}

/// Request metrics middleware for outbound calls.
pub fn client<Req, Resp>() -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    metrics_middleware(Side::Client)
}

fn metrics_middleware<Req, Resp>(side: Side) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
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
                let code = result.as_ref().err().map_or("ok", Error::reason);
                record_request(&kind, side, &operation, code, start);
                result
            }
        })
    })
}
