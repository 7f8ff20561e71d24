//! Supervised fire-and-forget tasks.
//!
//! Work spawned here never reports back to its caller: errors are logged and
//! panics are caught by a watcher task, so nothing leaks into the scheduler
//! loop.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Clone, Default)]
pub struct BackgroundTasks {
    running: Arc<AtomicUsize>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of spawned tasks that have not finished yet.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn `fut` detached. The returned handle belongs to the watcher and
    /// resolves once the task finished, failed or panicked.
    pub fn spawn<F, E>(&self, name: &'static str, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let running = self.running.clone();
        running.fetch_add(1, Ordering::SeqCst);
        debug!(task = name, "Background task started");

        let inner = tokio::spawn(fut);
        tokio::spawn(async move {
            match inner.await {
                Ok(Ok(())) => debug!(task = name, "Background task finished"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Background task failed"),
                Err(e) if e.is_panic() => error!(task = name, error = %e, "Background task panicked"),
                Err(e) => warn!(task = name, error = %e, "Background task cancelled"),
            }
            running.fetch_sub(1, Ordering::SeqCst);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failures_are_contained() {
        let tasks = BackgroundTasks::new();

        let ok = tasks.spawn("ok", async { Ok::<(), String>(()) });
        let failed = tasks.spawn("failed", async { Err::<(), _>("boom".to_string()) });
        let panicked = tasks.spawn::<_, String>("panicked", async { panic!("background panic") });

        assert!(ok.await.is_ok());
        assert!(failed.await.is_ok());
        assert!(panicked.await.is_ok());
        assert_eq!(tasks.running(), 0);
    }
}
