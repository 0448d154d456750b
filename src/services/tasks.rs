use std::future::Future;

use tokio_util::task::TaskTracker;

/// Submit-and-forget background work. Failures are logged, never returned.
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    tracker: TaskTracker,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tracker.spawn(async move {
            if let Err(e) = fut.await {
                tracing::warn!(task = name, "background task failed: {:#}", e);
            }
        });
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for everything submitted so far, including tasks those tasks
    /// submit. The queue stays usable afterwards.
    pub async fn idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Wait for outstanding tasks before the process exits.
    pub async fn shutdown(&self) {
        let pending = self.pending();
        if pending > 0 {
            tracing::info!(pending, "waiting for background tasks");
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_idle_waits_for_nested_tasks() {
        let queue = TaskQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let inner_queue = queue.clone();
        let inner_hits = hits.clone();
        queue.submit("outer", async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            inner_queue.submit("inner", async move {
                inner_hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        queue.idle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let queue = TaskQueue::new();
        queue.submit("failing", async { anyhow::bail!("boom") });
        queue.idle().await;

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        queue.submit("after", async move {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        queue.idle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
