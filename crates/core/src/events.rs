use crate::types::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

/// An event emitted while a run progresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        steps: Vec<String>,
    },
    RunFinished {
        succeeded: bool,
        duration_ms: u64,
    },

    // Step lifecycle events
    StepStarted {
        step: String,
    },
    StepSucceeded {
        step: String,
        duration_ms: u64,
    },
    StepFailed {
        step: String,
        error: String,
        duration_ms: u64,
    },
    /// The step never ran because a dependency failed or the run was cancelled.
    /// `dependency` names the failed dependency; it is `None` when the run
    /// was cancelled.
    StepSkipped {
        step: String,
        dependency: Option<String>,
        reason: String,
    },
}

/// Best-effort event delivery; a dropped receiver never affects the run.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink {
    sender: Option<UnboundedSender<Event>>,
}

impl EventSink {
    pub(crate) fn new(sender: UnboundedSender<Event>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub(crate) fn emit(&self, run_id: RunId, event_type: EventType) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Event::new(run_id, event_type));
        }
    }
}
