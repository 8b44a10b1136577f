//! Bounded, cancellable waits on platform tasks

use super::Fault;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Limit and cancellation applied to every platform task of one request
#[derive(Debug, Clone)]
pub struct TaskContext {
    limit: Duration,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(limit: Duration) -> Self {
        Self::with_cancel(limit, CancellationToken::new())
    }

    pub fn with_cancel(limit: Duration, cancel: CancellationToken) -> Self {
        Self { limit, cancel }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Await a platform task, giving up on timeout or cancellation
    pub async fn wait<T, F>(&self, task: F) -> Result<T, Fault>
    where
        F: Future<Output = Result<T, Fault>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Fault::Cancelled),
            result = tokio::time::timeout(self.limit, task) => {
                result.unwrap_or_else(|_| Err(Fault::Timeout(self.limit)))
            }
        }
    }

    /// Sleep for `duration` unless cancelled first
    pub async fn sleep(&self, duration: Duration) -> Result<(), Fault> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Fault::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_task_result() {
        let ctx = TaskContext::new(Duration::from_secs(1));
        let value = ctx.wait(async { Ok::<_, Fault>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let ctx = TaskContext::new(Duration::from_millis(10));
        let result = ctx
            .wait(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Fault>(())
            })
            .await;
        assert!(matches!(result, Err(Fault::Timeout(_))));
    }

    #[tokio::test]
    async fn test_wait_observes_cancellation() {
        let ctx = TaskContext::new(Duration::from_secs(5));
        ctx.cancel_token().cancel();
        let result = ctx.wait(async { Ok::<_, Fault>(()) }).await;
        assert_eq!(result, Err(Fault::Cancelled));
    }
}
