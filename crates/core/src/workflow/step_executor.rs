//! Invocation of a single step implementation: timeout enforcement and
//! panic capture at the task boundary.

use super::context::StepContext;
use super::step::StepFn;
use crate::error::{RunError, StepPanicError};
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Once;
use std::time::Duration;
use tokio::time::timeout;

thread_local! {
    // Set while a step future is being polled on this thread.
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Chains a panic hook that records the backtrace of panics raised inside a
/// step. Panics elsewhere in the process go to the previous hook untouched.
fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if CAPTURING.with(Cell::get) {
                let backtrace = Backtrace::force_capture().to_string();
                LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            } else {
                previous(info);
            }
        }));
    });
}

struct CaptureGuard {
    was_capturing: bool,
}

impl CaptureGuard {
    fn enter() -> Self {
        Self {
            was_capturing: CAPTURING.with(|c| c.replace(true)),
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        CAPTURING.with(|c| c.set(self.was_capturing));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Polls `future`, turning a panic into `Err(message, backtrace)`.
async fn catch_panic<F>(future: F) -> Result<F::Output, (String, String)>
where
    F: Future,
{
    install_panic_hook();

    let mut caught = pin!(AssertUnwindSafe(future).catch_unwind());
    let result = futures::future::poll_fn(|cx| {
        let _guard = CaptureGuard::enter();
        caught.as_mut().poll(cx)
    })
    .await;

    result.map_err(|payload| {
        let backtrace = LAST_BACKTRACE
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_else(|| "<backtrace unavailable>".to_string());
        (panic_message(payload.as_ref()), backtrace)
    })
}

/// Runs one step implementation to completion.
///
/// Indicator steps (no implementation) succeed immediately. A timeout is
/// enforced by abandoning the implementation future once it elapses and
/// cancelling the step's context.
pub(crate) async fn execute_step(
    name: &str,
    step_timeout: Option<Duration>,
    implementation: Option<StepFn>,
    ctx: StepContext,
) -> Result<(), RunError> {
    let Some(implementation) = implementation else {
        return Ok(());
    };

    // Clones of the context handed to spawned work must see the deadline.
    let token = ctx.token().clone();
    let invocation = catch_panic(async move { implementation(ctx).await });

    let result = match step_timeout {
        Some(limit) => match timeout(limit, invocation).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(step = %name, "Step timed out after {:?}", limit);
                token.cancel();
                return Err(RunError::DeadlineExceeded {
                    step: name.to_string(),
                    timeout: limit,
                });
            }
        },
        None => invocation.await,
    };

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(RunError::failed(name, error)),
        Err((message, backtrace)) => {
            tracing::error!(step = %name, "Step panicked: {}", message);
            Err(RunError::Panicked(StepPanicError {
                step: name.to_string(),
                message,
                backtrace,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn implementation<F, Fut>(f: F) -> Option<StepFn>
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Some(Arc::new(move |ctx| f(ctx).boxed()))
    }

    #[tokio::test]
    async fn test_indicator_succeeds() {
        let result = execute_step("join", None, None, StepContext::detached("join")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_error_is_attributed() {
        let f = implementation(|_| async { Err(anyhow::anyhow!("boom")) });
        let err = execute_step("b", None, f, StepContext::detached("b"))
            .await
            .unwrap_err();

        assert_eq!(err.step(), Some("b"));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let f = implementation(|_| async { panic!("oops") });
        let err = execute_step("p", None, f, StepContext::detached("p"))
            .await
            .unwrap_err();

        let panic = err.panic().expect("panic error");
        assert_eq!(panic.step, "p");
        assert_eq!(panic.message, "oops");
        assert!(!panic.backtrace.is_empty());
        assert!(err.to_string().contains("stack trace"));
    }

    #[tokio::test]
    async fn test_formatted_panic_message() {
        let f = implementation(|_| async {
            let n = 3;
            panic!("bad count {n}")
        });
        let err = execute_step("p", None, f, StepContext::detached("p"))
            .await
            .unwrap_err();
        assert_eq!(err.panic().unwrap().message, "bad count 3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_abandons_step() {
        let f = implementation(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let err = execute_step(
            "slow",
            Some(Duration::from_secs(1)),
            f,
            StepContext::detached("slow"),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RunError::DeadlineExceeded { .. }));
        assert!(err.to_string().contains("deadline exceeded"));
    }

    #[tokio::test]
    async fn test_unbounded_timeout_runs_to_completion() {
        let f = implementation(|ctx: StepContext| async move {
            assert!(ctx.deadline().is_none());
            Ok(())
        });
        let ctx = StepContext::new(
            Arc::from("forever"),
            crate::types::RunId::new(),
            tokio_util::sync::CancellationToken::new(),
            Some(Duration::MAX),
        );
        execute_step("forever", Some(Duration::MAX), f, ctx)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_context_clones() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let f = implementation(move |ctx: StepContext| {
            let tx = tx.lock().unwrap().take();
            async move {
                let watcher = ctx.clone();
                tokio::spawn(async move {
                    watcher.token().cancelled().await;
                    if let Some(tx) = tx {
                        let _ = tx.send(());
                    }
                });
                ctx.sleep(Duration::from_secs(3600)).await?;
                anyhow::Ok(())
            }
        });
        let err = execute_step(
            "hang",
            Some(Duration::from_secs(1)),
            f,
            StepContext::detached("hang"),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RunError::DeadlineExceeded { .. }));
        rx.await.unwrap();
    }
}
