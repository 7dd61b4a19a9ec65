//! Per-step run records and the report returned once a run finishes.

use crate::error::RunError;
use crate::types::{RunId, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

fn serialize_error<S: Serializer>(error: &Option<RunError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

/// Terminal state of one step in a run.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<RunError>,
    /// Set only if the step reached `running`.
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub(crate) fn waiting(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Waiting,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// True if the step failed without its implementation ever being invoked.
    pub fn never_ran(&self) -> bool {
        self.status == StepStatus::Failed && self.started_at.is_none()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Outcome of one run, with a record for every step in the execution set in
/// the order the steps were passed to the runner.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    #[serde(serialize_with = "serialize_error")]
    pub first_error: Option<RunError>,
}

impl RunReport {
    pub fn record(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.name == name)
    }

    pub fn status_of(&self, name: &str) -> Option<StepStatus> {
        self.record(name).map(|r| r.status)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps
            .iter()
            .filter(|r| r.status == StepStatus::Succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|r| r.status == StepStatus::Failed)
    }

    pub fn never_ran(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|r| r.never_ran())
    }

    pub fn is_success(&self) -> bool {
        self.first_error.is_none()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn into_result(self) -> Result<(), RunError> {
        match self.first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
