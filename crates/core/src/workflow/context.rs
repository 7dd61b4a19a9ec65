use crate::types::RunId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Returned by [`StepContext::sleep`] when the context is cancelled first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("context canceled")]
pub struct Cancelled;

/// Cancellable context handed to a step implementation.
///
/// The token is a child of the run's token: it is cancelled when any step in
/// the run fails or the caller cancels the run. Cancellation is cooperative;
/// an implementation that never checks the context keeps running until it
/// returns or its timeout elapses.
#[derive(Debug, Clone)]
pub struct StepContext {
    step: Arc<str>,
    run_id: RunId,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl StepContext {
    pub(crate) fn new(
        step: Arc<str>,
        run_id: RunId,
        token: CancellationToken,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            step,
            run_id,
            token,
            // A timeout too large to represent is no deadline at all.
            deadline: timeout.and_then(|t| Instant::now().checked_add(t)),
        }
    }

    /// Context for calling an implementation outside of a runner, e.g. in tests.
    pub fn detached(step: impl Into<String>) -> Self {
        Self::new(
            Arc::from(step.into()),
            RunId::new(),
            CancellationToken::new(),
            None,
        )
    }

    pub fn step_name(&self) -> &str {
        &self.step
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Instant after which the runner abandons this step, if it has a
    /// representable timeout.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once the run is cancelled or the step deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the run has been cancelled or the step deadline expires.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Sleep for `duration`, returning early with [`Cancelled`] if the
    /// context is cancelled in the meantime.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes() {
        let ctx = StepContext::detached("poll");
        assert_eq!(ctx.sleep(Duration::from_secs(30)).await, Ok(()));
        assert_eq!(ctx.step_name(), "poll");
        assert!(ctx.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_cancel() {
        let ctx = StepContext::detached("poll");
        let token = ctx.token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        assert_eq!(ctx.sleep(Duration::from_secs(3600)).await, Err(Cancelled));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_from_timeout() {
        let start = Instant::now();
        let ctx = StepContext::new(
            Arc::from("build"),
            RunId::new(),
            CancellationToken::new(),
            Some(Duration::from_secs(10)),
        );
        assert_eq!(ctx.deadline(), Some(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_unrepresentable_timeout_has_no_deadline() {
        let ctx = StepContext::new(
            Arc::from("forever"),
            RunId::new(),
            CancellationToken::new(),
            Some(Duration::MAX),
        );
        assert!(ctx.deadline().is_none());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_context() {
        let start = Instant::now();
        let ctx = StepContext::new(
            Arc::from("build"),
            RunId::new(),
            CancellationToken::new(),
            Some(Duration::from_secs(5)),
        );
        assert!(!ctx.is_cancelled());

        ctx.cancelled().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(ctx.is_cancelled());
        assert!(!ctx.token().is_cancelled());
        assert_eq!(ctx.sleep(Duration::from_secs(1)).await, Err(Cancelled));
    }
}
