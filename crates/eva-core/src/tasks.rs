use std::borrow::Cow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// An owned background worker.
#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait up to `grace` for the task to exit on its own, then abort it.
    /// Returns true when the task completed without being aborted.
    pub async fn shutdown_with_grace(self, grace: Duration) -> bool {
        let Self { name, mut handle } = self;
        if grace.is_zero() {
            handle.abort();
            return match handle.await {
                Ok(()) => true,
                Err(err) => {
                    debug!(task = %name, ?err, "task join after abort failed");
                    false
                }
            };
        }

        let sleeper = tokio::time::sleep(grace);
        tokio::pin!(sleeper);
        tokio::select! {
            res = &mut handle => match res {
                Ok(()) => true,
                Err(err) => {
                    debug!(task = %name, ?err, "task exited with error");
                    false
                }
            },
            _ = &mut sleeper => {
                handle.abort();
                if let Err(err) = handle.await {
                    debug!(task = %name, ?err, "task join after abort failed");
                }
                false
            }
        }
    }
}
