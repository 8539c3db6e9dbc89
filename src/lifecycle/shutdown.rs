//! Shutdown coordination for the application.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{Error, HookStage};
use crate::lifecycle::app::AppInfo;
use crate::lifecycle::hooks::Hooks;

/// Cloneable handle that stops the application it was taken from.
///
/// Stopping runs the before-stop hooks, cancels the root token (which makes
/// every server stop) and then runs the after-stop hooks. Repeated calls
/// after a completed stop return `Ok(())` without running anything again.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    root: CancellationToken,
    hooks: Arc<Hooks>,
    info: Arc<AppInfo>,
    stop_timeout: Duration,
    // Serializes concurrent stop calls.
    lock: Mutex<()>,
}

impl ShutdownHandle {
    pub(crate) fn new(
        root: CancellationToken,
        hooks: Arc<Hooks>,
        info: Arc<AppInfo>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                root,
                hooks,
                info,
                stop_timeout,
                lock: Mutex::new(()),
            }),
        }
    }

    pub async fn stop(&self) -> Result<(), Error> {
        let inner = &self.inner;
        let _guard = inner.lock.lock().await;
        if inner.root.is_cancelled() {
            tracing::debug!("Application already stopped");
            return Ok(());
        }

        tracing::info!(id = %inner.info.id, name = %inner.info.name, "Stopping application");
        let ctx = Context::from_token(inner.root.clone()).with_app(Arc::clone(&inner.info));
        inner.hooks.run(HookStage::BeforeStop, &ctx).await?;

        inner.root.cancel();

        // The root is cancelled by now; give cleanup hooks their own bounded scope.
        let cleanup = Context::new()
            .with_app(Arc::clone(&inner.info))
            .with_timeout(inner.stop_timeout);
        inner.hooks.run(HookStage::AfterStop, &cleanup).await
    }

    /// True once the root token has been cancelled, by `stop` or by the parent.
    pub fn is_stopped(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    /// Resolves once the application has been told to stop.
    pub async fn stopped(&self) {
        self.inner.root.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::hooks::hook;
    use parking_lot::Mutex as PlMutex;

    fn info() -> Arc<AppInfo> {
        Arc::new(AppInfo {
            id: "id-1".into(),
            name: "svc".into(),
            version: "1.0.0".into(),
            metadata: Default::default(),
        })
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let runs = Arc::new(PlMutex::new(0u32));
        let mut hooks = Hooks::default();
        let counter = Arc::clone(&runs);
        hooks.push(
            HookStage::AfterStop,
            hook(move |ctx: Context| {
                let counter = Arc::clone(&counter);
                async move {
                    assert!(!ctx.is_done());
                    *counter.lock() += 1;
                    Ok::<_, Error>(())
                }
            }),
        );
        let root = CancellationToken::new();
        let handle = ShutdownHandle::new(root.clone(), Arc::new(hooks), info(), Duration::from_secs(1));

        handle.stop().await.unwrap();
        handle.clone().stop().await.unwrap();
        assert!(root.is_cancelled());
        assert!(handle.is_stopped());
        assert_eq!(*runs.lock(), 1);
    }

    #[tokio::test]
    async fn failing_before_stop_keeps_running() {
        let mut hooks = Hooks::default();
        hooks.push(HookStage::BeforeStop, hook(|_ctx| async { Err("busy") }));
        let root = CancellationToken::new();
        let handle = ShutdownHandle::new(root.clone(), Arc::new(hooks), info(), Duration::from_secs(1));

        let err = handle.stop().await.unwrap_err();
        assert!(matches!(err, Error::Hook { stage: HookStage::BeforeStop, .. }));
        assert!(!root.is_cancelled());
    }
}
