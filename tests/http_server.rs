//! End-to-end tests of the HTTP server running under an application.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use microkit::observability::tracing as call_tracing;
use microkit::resilience::{rate_limit, recovery, RateLimitSettings, RecoverySettings};
use microkit::transport::http::HttpChain;
use microkit::{App, Chain, Error, HttpServer};

struct Running {
    app: App,
    server: Arc<HttpServer>,
    addr: SocketAddr,
    runner: JoinHandle<Result<(), Error>>,
}

impl Running {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

fn router() -> Router {
    Router::new()
        .route("/", get(|| async { Json(json!({ "message": "hello" })) }))
        .route(
            "/panic",
            get(|| async {
                let empty: Vec<u8> = Vec::new();
                Json(json!({ "first": empty[0] }))
            }),
        )
}

fn recovering() -> HttpChain {
    Chain::new()
        .with(recovery::server(RecoverySettings::builder().disable_print(true).build().unwrap()))
        .with(call_tracing::server())
}

async fn start(chain: HttpChain) -> Running {
    let server = Arc::new(
        HttpServer::new(router())
            .with_address("127.0.0.1:0")
            .with_chain(chain),
    );
    let app = App::builder()
        .name("http-test")
        .version("0.1.0")
        .signals(vec![])
        .server(server.clone())
        .build()
        .unwrap();
    let runner = tokio::spawn({
        let app = app.clone();
        async move { app.run().await }
    });
    let addr = tokio::time::timeout(Duration::from_secs(5), server.local_addr())
        .await
        .expect("server did not start")
        .expect("server failed to bind");
    Running {
        app,
        server,
        addr,
        runner,
    }
}

#[tokio::test]
async fn test_serves_requests_through_the_chain() {
    let running = start(recovering()).await;
    let client = reqwest::Client::new();

    let response = client.get(running.url("/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .expect("request id header");
    assert!(!request_id.is_empty());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["message"], "hello");

    let response = client
        .get(running.url("/"))
        .header("x-request-id", "trace-me")
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("trace-me")
    );

    assert_eq!(running.server.options().name, "http-test");
    running.app.stop().await.unwrap();
    running.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handler_panic_becomes_500_and_server_survives() {
    let running = start(recovering()).await;
    let client = reqwest::Client::new();

    let response = client.get(running.url("/panic")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "panic");

    let response = client.get(running.url("/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    running.app.stop().await.unwrap();
    running.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rate_limited_requests_get_429() {
    let chain = recovering().with(rate_limit::server(
        RateLimitSettings::builder().capacity(2).rate(0.01).build().unwrap(),
    ));
    let running = start(chain).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let response = client.get(running.url("/")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = client.get(running.url("/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "rate_limited");

    running.app.stop().await.unwrap();
    running.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_closes_the_listener() {
    let running = start(recovering()).await;
    let url = running.url("/");
    let client = reqwest::Client::new();
    assert!(client.get(&url).send().await.is_ok());

    running.app.shutdown_handle().stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), running.runner)
        .await
        .expect("run did not return")
        .unwrap()
        .unwrap();

    let fresh = reqwest::Client::new();
    assert!(fresh.get(&url).send().await.is_err());
}
