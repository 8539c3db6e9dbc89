//! Application orchestrator.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::schema::AppConfig;
use crate::context::Context;
use crate::error::{BoxError, Error, HookStage};
use crate::lifecycle::group::TaskGroup;
use crate::lifecycle::hooks::{hook, Hooks};
use crate::lifecycle::shutdown::ShutdownHandle;
use crate::lifecycle::signals::{self, Signal};
use crate::transport::{Server, ServerOptions};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity of a running application, visible to servers, hooks and handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub metadata: BTreeMap<String, String>,
}

/// Builder for `App`.
pub struct AppBuilder {
    id: Option<String>,
    name: String,
    version: String,
    metadata: BTreeMap<String, String>,
    parent: Option<CancellationToken>,
    signals: Vec<Signal>,
    stop_timeout: Duration,
    servers: Vec<Arc<dyn Server>>,
    hooks: Hooks,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self {
            id: None,
            name: String::new(),
            version: String::new(),
            metadata: BTreeMap::new(),
            parent: None,
            signals: Signal::defaults(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            servers: Vec::new(),
            hooks: Hooks::default(),
        }
    }
}

impl AppBuilder {
    /// Seed identity, stop timeout and signals from configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut builder = Self::default()
            .name(config.name.clone())
            .version(config.version.clone())
            .stop_timeout(config.stop_timeout())
            .signals(config.signals.clone());
        builder.id = config.id.clone();
        builder.metadata = config.metadata.clone();
        builder
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Run under `parent`: cancelling it stops the application.
    pub fn parent(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Signals that trigger a graceful stop. An empty list disables signal handling.
    pub fn signals(mut self, signals: Vec<Signal>) -> Self {
        self.signals = signals;
        self
    }

    /// Upper bound for each server's `stop`.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn server<S>(mut self, server: S) -> Self
    where
        S: Server + 'static,
    {
        self.servers.push(Arc::new(server));
        self
    }

    pub fn before_start<F, Fut, E>(self, f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.with_hook(HookStage::BeforeStart, f)
    }

    pub fn after_start<F, Fut, E>(self, f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.with_hook(HookStage::AfterStart, f)
    }

    pub fn before_stop<F, Fut, E>(self, f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.with_hook(HookStage::BeforeStop, f)
    }

    pub fn after_stop<F, Fut, E>(self, f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.with_hook(HookStage::AfterStop, f)
    }

    fn with_hook<F, Fut, E>(mut self, stage: HookStage, f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.hooks.push(stage, hook(f));
        self
    }

    /// Validate the options and initialize every server with the app identity.
    pub fn build(self) -> Result<App, Error> {
        if self.name.trim().is_empty() {
            return Err(Error::config("application name must not be empty"));
        }
        if self.stop_timeout.is_zero() {
            return Err(Error::config("stop timeout must be positive"));
        }

        let info = Arc::new(AppInfo {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.name,
            version: self.version,
            metadata: self.metadata,
        });
        let options = ServerOptions {
            id: info.id.clone(),
            name: info.name.clone(),
            version: info.version.clone(),
        };
        for server in &self.servers {
            server.init(&options).map_err(Error::Server)?;
        }

        let root = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let hooks = Arc::new(self.hooks);
        let shutdown = ShutdownHandle::new(
            root.clone(),
            Arc::clone(&hooks),
            Arc::clone(&info),
            self.stop_timeout,
        );

        Ok(App {
            inner: Arc::new(AppInner {
                info,
                servers: self.servers,
                hooks,
                signals: self.signals,
                stop_timeout: self.stop_timeout,
                root,
                shutdown,
                running: AtomicBool::new(false),
            }),
        })
    }
}

/// A set of servers run together under one lifecycle.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

struct AppInner {
    info: Arc<AppInfo>,
    servers: Vec<Arc<dyn Server>>,
    hooks: Arc<Hooks>,
    signals: Vec<Signal>,
    stop_timeout: Duration,
    root: CancellationToken,
    shutdown: ShutdownHandle,
    running: AtomicBool,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("info", &self.inner.info)
            .field("servers", &self.inner.servers.len())
            .field("signals", &self.inner.signals)
            .field("stop_timeout", &self.inner.stop_timeout)
            .finish()
    }
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::default()
    }

    pub fn id(&self) -> &str {
        &self.inner.info.id
    }

    pub fn name(&self) -> &str {
        &self.inner.info.name
    }

    pub fn version(&self) -> &str {
        &self.inner.info.version
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.inner.info.metadata
    }

    pub fn info(&self) -> Arc<AppInfo> {
        Arc::clone(&self.inner.info)
    }

    /// Handle that can stop this application from anywhere.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.inner.shutdown.clone()
    }

    /// Gracefully stop a running application. See `ShutdownHandle::stop`.
    pub async fn stop(&self) -> Result<(), Error> {
        self.inner.shutdown.stop().await
    }

    /// Run every server until a stop is requested, a signal arrives, the
    /// parent token is cancelled, or a server fails.
    ///
    /// Returns the first error of the run; a cancellation-only end is `Ok(())`.
    pub async fn run(&self) -> Result<(), Error> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::config("application is already running"));
        }
        let inner = &self.inner;
        let info = Arc::clone(&inner.info);
        tracing::info!(
            id = %info.id,
            name = %info.name,
            version = %info.version,
            servers = inner.servers.len(),
            "Starting application"
        );

        let root_ctx = Context::from_token(inner.root.clone()).with_app(Arc::clone(&info));
        inner.hooks.run(HookStage::BeforeStart, &root_ctx).await?;

        let mut group = TaskGroup::new(&inner.root);
        let group_ctx = Context::from_token(group.token()).with_app(Arc::clone(&info));
        let (started_tx, mut started_rx) = mpsc::channel::<()>(inner.servers.len().max(1));

        for server in &inner.servers {
            let stopping = Arc::clone(server);
            let token = group.token();
            let stop_info = Arc::clone(&info);
            let stop_timeout = inner.stop_timeout;
            group.spawn(async move {
                token.cancelled().await;
                // The group context is already done; stop gets a fresh bounded one.
                let ctx = Context::new().with_app(stop_info).with_timeout(stop_timeout);
                match tokio::time::timeout(stop_timeout, stopping.stop(ctx)).await {
                    Ok(Ok(())) => Ok(()),
                    // A stop that gave up at its own deadline is a timeout too.
                    Ok(Err(err)) => match Error::Server(err) {
                        err if err.is_deadline_exceeded() => Err(Error::StopTimeout(stop_timeout)),
                        err => Err(err),
                    },
                    Err(_) => Err(Error::StopTimeout(stop_timeout)),
                }
            });

            let starting = Arc::clone(server);
            let ctx = group_ctx.clone();
            let started = started_tx.clone();
            group.spawn(async move {
                let _ = started.send(()).await;
                starting.start(ctx).await.map_err(Error::Server)
            });
        }
        drop(started_tx);

        for _ in 0..inner.servers.len() {
            if started_rx.recv().await.is_none() {
                break;
            }
        }

        if let Err(err) = inner.hooks.run(HookStage::AfterStart, &group_ctx).await {
            // Servers keep running; the caller decides whether to stop them.
            group.detach();
            return Err(err);
        }
        tracing::info!(id = %info.id, name = %info.name, "Application started");

        let token = group.token();
        let watched = inner.signals.clone();
        let shutdown = inner.shutdown.clone();
        group.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Ok(()),
                received = signals::wait_for_any(&watched) => match received {
                    Ok(signal) => {
                        tracing::info!(signal = %signal, "Received shutdown signal");
                        shutdown.stop().await
                    }
                    Err(err) => Err(Error::config(format!("failed to install signal handler: {err}"))),
                },
            }
        });

        let result = match group.wait().await {
            Err(err) if err.is_cancellation() => Ok(()),
            other => other,
        };
        match &result {
            Ok(()) => tracing::info!(id = %info.id, name = %info.name, "Application stopped"),
            Err(err) => tracing::error!(id = %info.id, name = %info.name, error = %err, "Application stopped with error"),
        }
        result
    }
}
