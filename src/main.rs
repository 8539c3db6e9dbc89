//! Demo service built on microkit.
//!
//! Serves a small HTTP API behind the full middleware pipeline:
//!
//! ```text
//! GET /         greeting
//! GET /health   liveness
//! GET /panic    panics inside the handler; answered with 500 by recovery
//! GET /slow     sleeps past the slow-call threshold
//! ```
//!
//! Configuration comes from an optional TOML file; `--address` overrides the
//! HTTP bind address.

use std::path::PathBuf;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use clap::Parser;
use serde_json::{json, Value};

use microkit::config::{load_config, KitConfig};
use microkit::middleware::Chain;
use microkit::observability::{self, logging, metrics, tracing as call_tracing};
use microkit::resilience::{rate_limit, recovery, registry::CircuitBreakerLayer};
use microkit::{AppBuilder, HttpServer};

#[derive(Parser)]
#[command(name = "microkit")]
#[command(about = "Demo service for the microkit lifecycle and middleware pipeline", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP bind address, overrides the configuration
    #[arg(short, long)]
    address: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => KitConfig::default(),
    };
    if let Some(address) = cli.address {
        config.http.address = address;
    }

    observability::init_logging(&config.observability)?;
    tracing::info!(
        name = %config.app.name,
        version = %config.app.version,
        http_address = %config.http.address,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let chain = Chain::new()
        .with(recovery::server(config.recovery.settings()?))
        .with(call_tracing::server())
        .with(metrics::server())
        .with(logging::server(config.logging.settings()))
        .with(rate_limit::server(config.rate_limit.settings()?))
        .with(CircuitBreakerLayer::server(config.circuit_breaker.settings()?).build());

    let router = Router::new()
        .route("/", get(hello))
        .route("/health", get(health))
        .route("/panic", get(explode))
        .route("/slow", get(slow));
    let server = HttpServer::from_config(router, &config.http).with_chain(chain);

    let app = AppBuilder::from_config(&config.app)
        .server(server)
        .after_start(|ctx| async move {
            if let Some(app) = ctx.app() {
                tracing::info!(id = %app.id, "Service ready");
            }
            Ok::<_, std::io::Error>(())
        })
        .after_stop(|_ctx| async {
            tracing::info!("Shutdown complete");
            Ok::<_, std::io::Error>(())
        })
        .build()?;

    app.run().await?;
    Ok(())
}

async fn hello() -> Json<Value> {
    Json(json!({ "message": "hello from microkit" }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn explode() -> Json<Value> {
    let values: Vec<u32> = Vec::new();
    Json(json!({ "first": values[0] }))
}

async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_millis(750)).await;
    Json(json!({ "status": "done" }))
}
