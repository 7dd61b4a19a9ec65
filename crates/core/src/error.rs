//! Error types produced while validating and running a step graph.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The dependency relation contains a cycle.
///
/// `chain` starts at the step that was re-encountered, follows `depends_on`
/// edges, and repeats that step at the end to close the loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle detected: {}", .chain.join(" -> "))]
pub struct CycleError {
    pub chain: Vec<String>,
}

impl CycleError {
    /// Distinct step names forming the cycle, in chain order.
    pub fn steps(&self) -> &[String] {
        let end = self.chain.len().saturating_sub(1);
        &self.chain[..end]
    }
}

/// A step implementation panicked.
#[derive(Debug, Clone, Error)]
#[error("step {step:?} panicked: {message}\n\nstack trace:\n{backtrace}")]
pub struct StepPanicError {
    pub step: String,
    pub message: String,
    pub backtrace: String,
}

/// Errors returned by the runner.
///
/// The first three variants are validation failures reported before any step
/// runs. The rest describe how an individual step reached the `failed` state.
#[derive(Debug, Clone, Error)]
pub enum RunError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("duplicate step name {name:?}")]
    DuplicateStep { name: String },

    #[error("step {step:?} depends on {dependency:?}, which is not part of this run")]
    UnknownDependency { step: String, dependency: String },

    #[error(transparent)]
    Panicked(#[from] StepPanicError),

    #[error("step {step:?} failed: {error:#}")]
    Failed {
        step: String,
        error: Arc<anyhow::Error>,
    },

    #[error("step {step:?} failed: context deadline exceeded after {timeout:?}")]
    DeadlineExceeded { step: String, timeout: Duration },

    #[error("step {step:?} did not run: dependency {dependency:?} failed: {cause}")]
    DependencyFailed {
        step: String,
        dependency: String,
        cause: Arc<RunError>,
    },

    #[error("step {step:?} did not run: run was canceled")]
    Canceled { step: String },
}

impl RunError {
    pub(crate) fn failed(step: &str, error: anyhow::Error) -> Self {
        RunError::Failed {
            step: step.to_string(),
            error: Arc::new(error),
        }
    }

    /// Name of the step this error is attributed to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            RunError::Cycle(_) | RunError::DuplicateStep { .. } => None,
            RunError::UnknownDependency { step, .. }
            | RunError::Failed { step, .. }
            | RunError::DeadlineExceeded { step, .. }
            | RunError::DependencyFailed { step, .. }
            | RunError::Canceled { step } => Some(step),
            RunError::Panicked(panic) => Some(&panic.step),
        }
    }

    /// True for malformed-graph errors reported before execution starts.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RunError::Cycle(_) | RunError::DuplicateStep { .. } | RunError::UnknownDependency { .. }
        )
    }

    /// True when the step itself failed rather than one of its dependencies
    /// or the surrounding run.
    pub fn is_origin(&self) -> bool {
        matches!(
            self,
            RunError::Panicked(_) | RunError::Failed { .. } | RunError::DeadlineExceeded { .. }
        )
    }

    /// Follows dependency failures down to the error that started them.
    pub fn root_cause(&self) -> &RunError {
        let mut current = self;
        while let RunError::DependencyFailed { cause, .. } = current {
            current = cause;
        }
        current
    }

    /// The panic behind this error, looking through dependency failures.
    pub fn panic(&self) -> Option<&StepPanicError> {
        match self.root_cause() {
            RunError::Panicked(panic) => Some(panic),
            _ => None,
        }
    }

    pub fn is_panic(&self) -> bool {
        self.panic().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_display() {
        let err = CycleError {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
        assert_eq!(err.steps(), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_dependency_failure_root_cause() {
        let root = RunError::failed("b", anyhow::anyhow!("boom"));
        let wrapped = RunError::DependencyFailed {
            step: "d".into(),
            dependency: "c".into(),
            cause: Arc::new(RunError::DependencyFailed {
                step: "c".into(),
                dependency: "b".into(),
                cause: Arc::new(root),
            }),
        };

        assert_eq!(wrapped.step(), Some("d"));
        assert_eq!(wrapped.root_cause().step(), Some("b"));
        assert!(wrapped.to_string().contains("boom"));
        assert!(!wrapped.is_origin());
        assert!(!wrapped.is_panic());
    }

    #[test]
    fn test_failed_keeps_context_chain() {
        let err = anyhow::anyhow!("connection reset").context("trigger build");
        let err = RunError::failed("build", err);
        assert_eq!(
            err.to_string(),
            "step \"build\" failed: trigger build: connection reset"
        );
    }

    #[test]
    fn test_validation_errors() {
        assert!(RunError::DuplicateStep { name: "a".into() }.is_validation());
        assert!(RunError::from(CycleError { chain: vec![] }).is_validation());
        assert!(!RunError::Canceled { step: "a".into() }.is_validation());
    }
}
