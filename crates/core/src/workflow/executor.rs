use super::context::StepContext;
use super::step::{StepFn, StepGraph, StepRef};
use super::step_executor::execute_step;
use crate::error::RunError;
use crate::events::{Event, EventSink, EventType};
use crate::report::{RunReport, StepRecord};
use crate::types::{RunId, StepStatus};
use chrono::Utc;
use futures::future::{join_all, try_join_all};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Published state of one step; `Finished` is its completion signal.
#[derive(Debug, Clone)]
enum Signal {
    Waiting,
    Running,
    Finished(Result<(), RunError>),
}

impl Signal {
    fn is_finished(&self) -> bool {
        matches!(self, Signal::Finished(_))
    }

    fn is_waiting(&self) -> bool {
        matches!(self, Signal::Waiting)
    }
}

/// Executes a set of steps concurrently, one task per step, in dependency order.
///
/// A step starts once every dependency has succeeded. When any step fails,
/// the run's cancellation token is cancelled: steps still waiting on
/// dependencies give up, and running implementations may observe it through
/// their [`StepContext`]. The run always waits for every task to finish.
#[derive(Debug, Clone, Default)]
pub struct Runner {
    events: EventSink,
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send run and step events to `sender` as the run progresses.
    pub fn with_events(mut self, sender: mpsc::UnboundedSender<Event>) -> Self {
        self.events = EventSink::new(sender);
        self
    }

    /// Run `steps` and return the first failure, if any.
    pub async fn execute(&self, graph: &StepGraph, steps: &[StepRef]) -> Result<(), RunError> {
        self.execute_with_cancel(CancellationToken::new(), graph, steps)
            .await
    }

    /// Like [`Runner::execute`], stopping early when `cancel` is cancelled.
    pub async fn execute_with_cancel(
        &self,
        cancel: CancellationToken,
        graph: &StepGraph,
        steps: &[StepRef],
    ) -> Result<(), RunError> {
        self.run(cancel, graph, steps).await?.into_result()
    }

    /// Validate and run `steps`, returning the full report.
    ///
    /// A malformed execution set (duplicate names, dependencies outside the
    /// set, cycles) is rejected with `Err` before any step runs. Otherwise
    /// the report is returned once every step has reached a terminal state,
    /// with [`RunReport::first_error`] describing the failure if there was one.
    ///
    /// # Panics
    ///
    /// Panics if a handle in `steps` was not issued by `graph`.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        graph: &StepGraph,
        steps: &[StepRef],
    ) -> Result<RunReport, RunError> {
        validate(graph, steps)?;

        let run_id = RunId::new();
        let started_at = Utc::now();
        let clock = Instant::now();
        let run_token = cancel.child_token();
        let span = tracing::info_span!("run", run_id = %run_id);

        span.in_scope(|| tracing::info!("Starting run with {} steps", steps.len()));
        self.events.emit(
            run_id,
            EventType::RunStarted {
                steps: steps.iter().map(|s| graph.name(*s).to_string()).collect(),
            },
        );

        let slots: HashMap<StepRef, usize> =
            steps.iter().enumerate().map(|(i, s)| (*s, i)).collect();
        let (senders, receivers): (Vec<_>, Vec<_>) =
            steps.iter().map(|_| watch::channel(Signal::Waiting)).unzip();
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();

        let mut handles = Vec::with_capacity(steps.len());
        for (step_ref, signal) in steps.iter().zip(senders) {
            let step = graph.get(*step_ref);
            let dependencies = step
                .depends_on()
                .iter()
                .map(|dep| Dependency {
                    name: graph.name(*dep).to_string(),
                    signal: receivers[slots[dep]].clone(),
                })
                .collect();

            let task = StepTask {
                name: Arc::from(step.name()),
                timeout: step.timeout(),
                implementation: step.implementation().cloned(),
                dependencies,
                signal,
                run_id,
                run_token: run_token.clone(),
                events: self.events.clone(),
                failures: failures_tx.clone(),
            };
            handles.push(tokio::spawn(task.run().instrument(span.clone())));
        }
        drop(failures_tx);
        drop(receivers);

        let mut records = Vec::with_capacity(steps.len());
        let mut aborted = Vec::new();
        for (slot, joined) in join_all(handles).await.into_iter().enumerate() {
            match joined {
                Ok(record) => records.push(record),
                Err(join_error) => {
                    let name = graph.name(steps[slot]);
                    let error =
                        RunError::failed(name, anyhow::anyhow!("step task aborted: {join_error}"));
                    let mut record = StepRecord::waiting(name);
                    record.status = StepStatus::Failed;
                    record.error = Some(error.clone());
                    record.finished_at = Some(Utc::now());
                    records.push(record);
                    aborted.push(error);
                }
            }
        }

        // Every sender is gone once the tasks are joined.
        let mut failures = Vec::new();
        while let Ok(error) = failures_rx.try_recv() {
            failures.push(error);
        }
        failures.extend(aborted);
        let first_error = first_error(failures);

        let duration_ms = clock.elapsed().as_millis() as u64;
        span.in_scope(|| match &first_error {
            None => tracing::info!("Run completed in {}ms", duration_ms),
            Some(e) => tracing::error!("Run failed after {}ms: {}", duration_ms, e),
        });
        self.events.emit(
            run_id,
            EventType::RunFinished {
                succeeded: first_error.is_none(),
                duration_ms,
            },
        );

        Ok(RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            steps: records,
            first_error,
        })
    }
}

/// Rejects malformed execution sets before anything is spawned.
fn validate(graph: &StepGraph, steps: &[StepRef]) -> Result<(), RunError> {
    let mut names = HashSet::new();
    for step in steps {
        let name = graph.name(*step);
        if !names.insert(name) {
            return Err(RunError::DuplicateStep {
                name: name.to_string(),
            });
        }
    }

    let members: HashSet<StepRef> = steps.iter().copied().collect();
    for step in steps {
        for dep in graph.get(*step).depends_on() {
            if !members.contains(dep) {
                return Err(RunError::UnknownDependency {
                    step: graph.name(*step).to_string(),
                    dependency: graph.name(*dep).to_string(),
                });
            }
        }
    }

    // All dependencies are members, so this only walks the execution set.
    graph.transitive_dependencies_of(steps)?;
    Ok(())
}

/// Failures arrive in completion order. Prefer the first one that started in
/// a step itself over dependency failures and cancellations it caused.
fn first_error(failures: Vec<RunError>) -> Option<RunError> {
    let index = failures.iter().position(RunError::is_origin).unwrap_or(0);
    failures.into_iter().nth(index)
}

struct Dependency {
    name: String,
    signal: watch::Receiver<Signal>,
}

/// Everything one step's task owns. Only this task writes the step's record
/// and completion signal.
struct StepTask {
    name: Arc<str>,
    timeout: Option<Duration>,
    implementation: Option<StepFn>,
    dependencies: Vec<Dependency>,
    signal: watch::Sender<Signal>,
    run_id: RunId,
    run_token: CancellationToken,
    events: EventSink,
    failures: mpsc::UnboundedSender<RunError>,
}

impl StepTask {
    async fn run(mut self) -> StepRecord {
        let mut record = StepRecord::waiting(&*self.name);

        let outcome = match self.wait_for_dependencies().await {
            Err(error) => {
                tracing::info!(step = %self.name, "Skipping step: {}", error);
                self.events.emit(
                    self.run_id,
                    EventType::StepSkipped {
                        step: self.name.to_string(),
                        dependency: match &error {
                            RunError::DependencyFailed { dependency, .. } => Some(dependency.clone()),
                            _ => None,
                        },
                        reason: error.to_string(),
                    },
                );
                Err(error)
            }
            Ok(()) => {
                self.signal.send_replace(Signal::Running);
                record.status = StepStatus::Running;
                record.started_at = Some(Utc::now());
                tracing::info!(step = %self.name, "Executing step");
                self.events.emit(
                    self.run_id,
                    EventType::StepStarted {
                        step: self.name.to_string(),
                    },
                );

                let clock = Instant::now();
                let ctx = StepContext::new(
                    self.name.clone(),
                    self.run_id,
                    self.run_token.child_token(),
                    self.timeout,
                );
                let result =
                    execute_step(&self.name, self.timeout, self.implementation.take(), ctx).await;
                let duration_ms = clock.elapsed().as_millis() as u64;

                match &result {
                    Ok(()) => {
                        tracing::info!(step = %self.name, "Step completed in {}ms", duration_ms);
                        self.events.emit(
                            self.run_id,
                            EventType::StepSucceeded {
                                step: self.name.to_string(),
                                duration_ms,
                            },
                        );
                    }
                    Err(error) => {
                        tracing::error!(step = %self.name, "Step failed: {}", error);
                        self.events.emit(
                            self.run_id,
                            EventType::StepFailed {
                                step: self.name.to_string(),
                                error: error.to_string(),
                                duration_ms,
                            },
                        );
                    }
                }
                result
            }
        };

        record.finished_at = Some(Utc::now());
        let failed = match &outcome {
            Ok(()) => {
                record.status = StepStatus::Succeeded;
                false
            }
            Err(error) => {
                record.status = StepStatus::Failed;
                record.error = Some(error.clone());
                let _ = self.failures.send(error.clone());
                true
            }
        };

        // Release dependents before cancelling, so they attribute the
        // failure to this step rather than to the cancellation.
        self.signal.send_replace(Signal::Finished(outcome));
        if failed {
            self.run_token.cancel();
        }

        record
    }

    /// Waits until every dependency succeeded.
    ///
    /// Steps without dependencies never wait. Steps with dependencies give up
    /// as soon as one dependency fails or the run is cancelled.
    async fn wait_for_dependencies(&self) -> Result<(), RunError> {
        if self.dependencies.is_empty() {
            return Ok(());
        }

        let waits = self.dependencies.iter().map(|dep| async move {
            let mut signal = dep.signal.clone();
            let outcome = signal
                .wait_for(Signal::is_finished)
                .await
                .map(|value| (*value).clone());

            match outcome {
                Ok(Signal::Finished(Ok(()))) => Ok(()),
                Ok(Signal::Finished(Err(cause))) => Err((dep, cause)),
                // The owning task went away without reporting.
                Ok(_) | Err(_) => Err((
                    dep,
                    RunError::Canceled {
                        step: dep.name.clone(),
                    },
                )),
            }
        });

        tokio::select! {
            biased;
            waited = try_join_all(waits) => match waited {
                Ok(_) => Ok(()),
                Err((dep, cause)) => Err(self.dependency_failed(dep, cause)),
            },
            _ = self.run_token.cancelled() => Err(self.interrupted().await),
        }
    }

    fn dependency_failed(&self, dep: &Dependency, cause: RunError) -> RunError {
        RunError::DependencyFailed {
            step: self.name.to_string(),
            dependency: dep.name.clone(),
            cause: Arc::new(cause),
        }
    }

    /// The run was cancelled while waiting: blame a dependency whose failure
    /// started in a step, otherwise the cancellation itself.
    ///
    /// Dependencies that are still waiting give up promptly under the same
    /// cancellation, so their outcome is awaited. This keeps the chain back
    /// to the failing step intact for transitive dependents. Running
    /// dependencies are not awaited.
    async fn interrupted(&self) -> RunError {
        for dep in &self.dependencies {
            let mut signal = dep.signal.clone();
            let settled = signal
                .wait_for(|s| !s.is_waiting())
                .await
                .map(|value| (*value).clone());

            if let Ok(Signal::Finished(Err(cause))) = settled {
                if cause.root_cause().is_origin() {
                    return self.dependency_failed(dep, cause);
                }
            }
        }

        RunError::Canceled {
            step: self.name.to_string(),
        }
    }
}
