//! Background work submission
//!
//! Fire-and-forget work (provisioning runs, tunnel reloads) goes through a
//! runner instead of bare `tokio::spawn`, so tests can switch to inline mode
//! and observe the completed effects synchronously.

use std::future::Future;

/// How submitted work is executed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Spawn,
    Inline,
}

/// Executor for fire-and-forget work items
#[derive(Clone, Debug)]
pub struct BackgroundRunner {
    mode: Mode,
}

impl BackgroundRunner {
    /// Production mode: work runs on a detached tokio task.
    pub fn spawning() -> Self {
        Self { mode: Mode::Spawn }
    }

    /// Test mode: `submit` awaits the work item before returning.
    pub fn inline() -> Self {
        Self { mode: Mode::Inline }
    }

    pub async fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.mode {
            Mode::Spawn => {
                tokio::spawn(task);
            }
            Mode::Inline => task.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn inline_mode_completes_before_submit_returns() {
        let runner = BackgroundRunner::inline();
        let done = Arc::new(AtomicBool::new(false));

        let flag = done.clone();
        runner
            .submit(async move {
                flag.store(true, Ordering::SeqCst);
            })
            .await;

        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn spawn_mode_runs_detached() {
        let runner = BackgroundRunner::spawning();
        let (tx, rx) = tokio::sync::oneshot::channel();

        runner
            .submit(async move {
                let _ = tx.send(());
            })
            .await;

        rx.await.expect("task did not run");
    }
}
