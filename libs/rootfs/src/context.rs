//! Caller-side request context: an optional deadline and cancel signal.
//!
//! The context only bounds how long a caller waits. Builds started on behalf
//! of a caller run under their own timeout and are never stopped by it.

use std::future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::BuildError;

/// Deadline and cancellation for one `produce_image` call.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Sender half of a cancellable [`RequestContext`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation to every clone of the paired context.
    pub fn cancel(&self) {
        // send_replace succeeds even when no receiver is waiting.
        self.tx.send_replace(true);
    }
}

impl RequestContext {
    /// A context that never expires and cannot be cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Expire `timeout` from now. An earlier existing deadline is kept.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Expire at `deadline`. An earlier existing deadline is kept.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Cancel this context when `signal` becomes `true`.
    pub fn with_cancel_signal(mut self, signal: watch::Receiver<bool>) -> Self {
        self.cancel = Some(signal);
        self
    }

    /// Attach a fresh cancel signal and return its sender.
    pub fn cancellable(self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (self.with_cancel_signal(rx), CancelHandle { tx })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once the caller has given up, with the matching error.
    ///
    /// Never resolves for a background context.
    pub async fn done(&self) -> BuildError {
        let cancelled = async {
            if let Some(mut rx) = self.cancel.clone() {
                // A dropped sender can no longer cancel.
                if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
                    return;
                }
            }
            future::pending::<()>().await
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancelled => BuildError::Cancelled,
            _ = expired => BuildError::DeadlineExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_never_done() {
        let ctx = RequestContext::background();
        let waited = tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_timeout_yields_deadline_exceeded() {
        let ctx = RequestContext::background().with_timeout(Duration::from_millis(10));
        assert!(matches!(ctx.done().await, BuildError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_cancel_yields_cancelled() {
        let (ctx, handle) = RequestContext::background().cancellable();
        assert!(!ctx.is_cancelled());
        handle.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.done().await, BuildError::Cancelled));
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_cancel() {
        let (ctx, handle) = RequestContext::background().cancellable();
        drop(handle);
        let waited = tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = RequestContext::background()
            .with_deadline(now + Duration::from_secs(5))
            .with_deadline(now + Duration::from_secs(60));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(5)));
    }
}
