// Core step graph and coordinator for Cascade

pub mod error;
pub mod events;
pub mod report;
pub mod types;
pub mod workflow;

pub use error::{CycleError, RunError, StepPanicError};
pub use events::{Event, EventType};
pub use report::{RunReport, StepRecord};
pub use types::*;
pub use workflow::{Cancelled, Runner, Step, StepContext, StepGraph, StepRef};

/// Re-exported so callers can cancel runs without depending on `tokio-util`.
pub use tokio_util::sync::CancellationToken;
