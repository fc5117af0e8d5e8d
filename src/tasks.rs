//! Detached background work.
//!
//! Work spawned here outlives the request that started it: it runs under
//! its own timeouts and is never cancelled when the response is sent.

use std::future::Future;
use std::time::Duration;

use tokio_util::task::TaskTracker;

use crate::error::{AppError, Result};

/// Runs named background tasks, logging panics instead of propagating them.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `task`. A panic inside it is logged with `name` and does not
    /// affect any other task.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.tracker.spawn(task);
        self.tracker.spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(task = name, "💥 Background task panicked: {}", e);
                } else {
                    tracing::warn!(task = name, "Background task cancelled: {}", e);
                }
            }
        });
    }

    /// Waits until every task spawned so far has finished.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stops accepting work and waits up to `grace` for in-flight tasks.
    pub async fn shutdown(&self, grace: Duration) {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            tracing::info!("⏳ Waiting for {} background tasks", pending);
        }
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                "⚠️ {} background tasks still running after {:?}",
                self.tracker.len(),
                grace
            );
        }
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub factor: u32,
    /// Deadline for each individual attempt.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Used for background session persistence.
    pub const PERSISTENCE: RetryPolicy = RetryPolicy {
        attempts: 3,
        base: Duration::from_secs(1),
        factor: 2,
        attempt_timeout: Duration::from_secs(10),
    };

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base * self.factor.saturating_pow(attempt.saturating_sub(1))
    }

    /// Runs `op` until it succeeds or the attempts are used up, returning
    /// the last error.
    pub async fn run<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut last_error = AppError::Internal(format!("{}: no attempt made", name));

        for attempt in 1..=attempts {
            let outcome = match tokio::time::timeout(self.attempt_timeout, op(attempt)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(AppError::Internal(format!(
                    "{}: attempt timed out after {:?}",
                    name, self.attempt_timeout
                ))),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(op = name, attempt, "✅ Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(op = name, attempt, attempts, "⚠️ Attempt failed: {}", e);
                    last_error = e;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.delay(attempt)).await;
            }
        }

        Err(last_error)
    }
}
