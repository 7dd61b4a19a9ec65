pub mod context;
pub mod dag;
pub mod executor;
pub mod step;
mod step_executor;

pub use context::{Cancelled, StepContext};
pub use executor::Runner;
pub use step::{Step, StepFn, StepFuture, StepGraph, StepRef};
