//! Per-call context: cancellation, deadline, transport and application info.
//!
//! Every handler, hook and server call receives a `Context` explicitly. It is
//! cheap to clone; clones share the same cancellation token.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::lifecycle::AppInfo;
use crate::transport::{Side, Transporter};

#[derive(Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
    server_transport: Option<Arc<dyn Transporter>>,
    client_transport: Option<Arc<dyn Transporter>>,
    app: Option<Arc<AppInfo>>,
}

impl Context {
    /// A root context that is never cancelled unless its token is.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context observing an existing token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Derive a context whose token is a child of this one: cancelling the
    /// parent cancels the child, not the other way round.
    pub fn child(&self) -> Self {
        let mut ctx = self.clone();
        ctx.token = self.token.child_token();
        ctx
    }

    /// Bound the context by `timeout` from now. An earlier deadline is kept.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the reason this context is done, if it is.
    pub fn err(&self) -> Option<Error> {
        if self.token.is_cancelled() {
            return Some(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves when the token is cancelled or the deadline passes.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Error::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Error::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                Error::Cancelled
            }
        }
    }

    /// Drive `fut` to completion unless the context finishes first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, Error>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            out = fut => Ok(out),
            err = self.done() => Err(err),
        }
    }

    pub fn with_server_transport(mut self, tr: Arc<dyn Transporter>) -> Self {
        self.server_transport = Some(tr);
        self
    }

    pub fn with_client_transport(mut self, tr: Arc<dyn Transporter>) -> Self {
        self.client_transport = Some(tr);
        self
    }

    pub fn server_transport(&self) -> Option<&Arc<dyn Transporter>> {
        self.server_transport.as_ref()
    }

    pub fn client_transport(&self) -> Option<&Arc<dyn Transporter>> {
        self.client_transport.as_ref()
    }

    /// Transport for the given side of the call.
    pub fn transport(&self, side: Side) -> Option<&Arc<dyn Transporter>> {
        match side {
            Side::Server => self.server_transport(),
            Side::Client => self.client_transport(),
        }
    }

    pub fn with_app(mut self, app: Arc<AppInfo>) -> Self {
        self.app = Some(app);
        self
    }

    pub fn app(&self) -> Option<&AppInfo> {
        self.app.as_deref()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.token.is_cancelled())
            .field("deadline", &self.deadline)
            .field(
                "server_operation",
                &self.server_transport.as_ref().map(|t| t.operation().to_string()),
            )
            .field(
                "client_operation",
                &self.client_transport.as_ref().map(|t| t.operation().to_string()),
            )
            .field("app", &self.app.as_ref().map(|a| a.name.clone()))
            .finish()
    }
}
