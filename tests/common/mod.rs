//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use microkit::transport::{Server, ServerOptions};
use microkit::{BoxError, Context};

/// Ordered record of lifecycle events, shared by mocks and hooks.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.0.lock().iter().any(|e| e == event)
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == event)
    }
}

/// How a mock server behaves when started.
#[derive(Clone)]
pub enum StartBehavior {
    /// Serve until the context is cancelled.
    UntilCancelled,
    /// Fail after the given delay.
    FailAfter(Duration, &'static str),
}

/// A server that records init/start/stop calls instead of listening.
pub struct MockServer {
    name: &'static str,
    log: EventLog,
    start: StartBehavior,
    stop_delay: Duration,
    stop_until_deadline: bool,
    options: Mutex<Option<ServerOptions>>,
}

impl MockServer {
    pub fn new(name: &'static str, log: &EventLog) -> Self {
        Self {
            name,
            log: log.clone(),
            start: StartBehavior::UntilCancelled,
            stop_delay: Duration::ZERO,
            stop_until_deadline: false,
            options: Mutex::new(None),
        }
    }

    pub fn failing_after(mut self, delay: Duration, message: &'static str) -> Self {
        self.start = StartBehavior::FailAfter(delay, message);
        self
    }

    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Stop never finishes on its own; it returns when its context expires.
    pub fn stopping_at_deadline(mut self) -> Self {
        self.stop_until_deadline = true;
        self
    }

    pub fn options(&self) -> Option<ServerOptions> {
        self.options.lock().clone()
    }
}

#[async_trait]
impl Server for MockServer {
    fn init(&self, options: &ServerOptions) -> Result<(), BoxError> {
        *self.options.lock() = Some(options.clone());
        self.log.push(format!("{}:init", self.name));
        Ok(())
    }

    async fn start(&self, ctx: Context) -> Result<(), BoxError> {
        self.log.push(format!("{}:start", self.name));
        match &self.start {
            StartBehavior::UntilCancelled => {
                ctx.done().await;
                Ok(())
            }
            StartBehavior::FailAfter(delay, message) => {
                tokio::time::sleep(*delay).await;
                Err((*message).into())
            }
        }
    }

    async fn stop(&self, ctx: Context) -> Result<(), BoxError> {
        self.log.push(format!("{}:stop", self.name));
        if self.stop_until_deadline {
            ctx.run(std::future::pending::<()>()).await?;
        }
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        self.log.push(format!("{}:stopped", self.name));
        Ok(())
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
