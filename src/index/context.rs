// Per-operation context: deadline and cancellation signal
//
// Every index operation runs under an OpContext. When the deadline passes or
// the paired CancelHandle fires, the in-flight future is dropped and the
// operation resolves to a cancellation error instead.

use super::error::{IndexError, IndexResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Fires the cancellation signal of the context it was created with
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl OpContext {
    /// Context without deadline or cancellation
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::default().with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Attach a cancellation signal and return the handle that fires it
    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel = Some(rx);
        (self, CancelHandle { tx })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn check(&self) -> IndexResult<()> {
        if self.cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Err(IndexError::Cancelled);
        }
        if self.deadline.is_some_and(|d| d <= Instant::now()) {
            return Err(IndexError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the context is cancelled, or the deadline passes
    pub async fn run<F, T>(&self, fut: F) -> IndexResult<T>
    where
        F: Future<Output = IndexResult<T>>,
    {
        self.check()?;

        let cancelled = async {
            match self.cancel.clone() {
                Some(mut rx) => {
                    let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
                    if closed {
                        // Handle dropped without firing: never cancels
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };

        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(IndexError::Cancelled),
            _ = expired => Err(IndexError::DeadlineExceeded),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_context_passes_result_through() {
        let ctx = OpContext::background();
        let res = ctx.run(async { Ok::<_, IndexError>(42) }).await;
        assert_eq!(res.unwrap(), 42);
        assert!(ctx.remaining().is_none());
    }

    #[tokio::test]
    async fn test_already_cancelled_context_short_circuits() {
        let (ctx, handle) = OpContext::background().cancellable();
        handle.cancel();

        let res = ctx.run(async { Ok::<_, IndexError>(()) }).await;
        assert!(matches!(res, Err(IndexError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_future() {
        let (ctx, handle) = OpContext::background().cancellable();

        let task = tokio::spawn(async move {
            ctx.run(async {
                std::future::pending::<()>().await;
                Ok::<_, IndexError>(())
            })
            .await
        });

        tokio::task::yield_now().await;
        handle.cancel();

        let res = task.await.unwrap();
        assert!(matches!(res, Err(IndexError::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_cancel() {
        let (ctx, handle) = OpContext::background().cancellable();
        drop(handle);

        let res = ctx.run(async { Ok::<_, IndexError>("done") }).await;
        assert_eq!(res.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let ctx = OpContext::with_timeout(Duration::from_millis(20));

        let res = ctx
            .run(async {
                std::future::pending::<()>().await;
                Ok::<_, IndexError>(())
            })
            .await;

        assert!(matches!(res, Err(IndexError::DeadlineExceeded)));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_with_deadline_keeps_earliest() {
        let now = Instant::now();
        let ctx = OpContext::background()
            .with_deadline(now + Duration::from_secs(10))
            .with_deadline(now + Duration::from_secs(1));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }
}
