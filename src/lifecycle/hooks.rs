//! Lifecycle hooks.

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;

use crate::context::Context;
use crate::error::{BoxError, Error, HookStage};
use crate::middleware::BoxFuture;

pub type Hook = Arc<dyn Fn(Context) -> BoxFuture<Result<(), BoxError>> + Send + Sync>;

/// Wrap an async function as a hook.
pub fn hook<F, Fut, E>(f: F) -> Hook
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    Arc::new(move |ctx| f(ctx).map(|res| res.map_err(Into::into)).boxed())
}

/// Hooks per stage, run in registration order.
#[derive(Clone, Default)]
pub struct Hooks {
    before_start: Vec<Hook>,
    after_start: Vec<Hook>,
    before_stop: Vec<Hook>,
    after_stop: Vec<Hook>,
}

impl Hooks {
    pub fn push(&mut self, stage: HookStage, hook: Hook) {
        self.stage_mut(stage).push(hook);
    }

    pub fn get(&self, stage: HookStage) -> &[Hook] {
        match stage {
            HookStage::BeforeStart => &self.before_start,
            HookStage::AfterStart => &self.after_start,
            HookStage::BeforeStop => &self.before_stop,
            HookStage::AfterStop => &self.after_stop,
        }
    }

    fn stage_mut(&mut self, stage: HookStage) -> &mut Vec<Hook> {
        match stage {
            HookStage::BeforeStart => &mut self.before_start,
            HookStage::AfterStart => &mut self.after_start,
            HookStage::BeforeStop => &mut self.before_stop,
            HookStage::AfterStop => &mut self.after_stop,
        }
    }

    /// Run the hooks of `stage` sequentially; the first failure aborts the rest.
    pub async fn run(&self, stage: HookStage, ctx: &Context) -> Result<(), Error> {
        for (index, hook) in self.get(stage).iter().enumerate() {
            tracing::debug!(stage = %stage, index, "Running lifecycle hook");
            if let Err(source) = hook(ctx.clone()).await {
                tracing::error!(stage = %stage, index, error = %source, "Lifecycle hook failed");
                return Err(Error::Hook { stage, source });
            }
        }
        Ok(())
    }
}
