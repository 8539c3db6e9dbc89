//! A group of tasks sharing one cancellation scope.

use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Tasks are spawned onto the runtime and joined together. The first task to
/// fail cancels the group's token; `wait` returns that first error once every
/// task has finished.
pub struct TaskGroup {
    token: CancellationToken,
    tasks: JoinSet<Result<(), Error>>,
}

impl TaskGroup {
    /// A group whose token is a child of `parent`.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    pub async fn wait(mut self) -> Result<(), Error> {
        let mut first = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = joined.unwrap_or_else(|err| Err(Error::TaskPanicked(err.to_string())));
            if let Err(err) = result {
                if first.is_none() {
                    self.token.cancel();
                    first = Some(err);
                } else {
                    tracing::debug!(error = %err, "Suppressed error after group failure");
                }
            }
        }
        self.token.cancel();
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Let the tasks keep running unobserved.
    pub fn detach(mut self) {
        self.tasks.detach_all();
    }
}
