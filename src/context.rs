//! Cancellation and deadline carried through a reconcile pass.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::StoreError;

/// Caller-supplied cancellation token plus an optional deadline.
///
/// Every store call a reconcile pass makes goes through [`ReconcileContext::guard`],
/// so a cancelled or overdue pass stops at its next store call.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for ReconcileContext {
    fn default() -> Self {
        Self::background()
    }
}

impl ReconcileContext {
    /// Never cancelled, no deadline.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Deadline `timeout` from now. An earlier existing deadline wins.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run a store call, aborting it on cancellation or deadline.
    pub async fn guard<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        if self.deadline.is_some_and(|d| d <= Instant::now()) {
            return Err(StoreError::DeadlineExceeded);
        }

        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, call)
                    .await
                    .unwrap_or(Err(StoreError::DeadlineExceeded)),
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StoreError::Cancelled),
            result = bounded => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_passes_result_through() {
        let ctx = ReconcileContext::background();
        let value = ctx.guard(async { Ok::<_, StoreError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_guard_stops_at_deadline() {
        let ctx = ReconcileContext::background().with_timeout(Duration::from_millis(20));
        let err = ctx
            .guard(std::future::pending::<Result<(), StoreError>>())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_guard_stops_on_cancel() {
        let token = CancellationToken::new();
        let ctx = ReconcileContext::new(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let err = ctx
            .guard(std::future::pending::<Result<(), StoreError>>())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_context_never_starts_call() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = ReconcileContext::new(token);
        let err = ctx
            .guard(async { Ok::<_, StoreError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }

    #[test]
    fn test_earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = ReconcileContext::background()
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(10));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }
}
