//! Release process expressed as a resumable cascade step graph.

pub mod dry_run;
pub mod graph;
pub mod progress;
pub mod service;

pub use dry_run::{DryRunOptions, DryRunService, Operation};
pub use graph::{build_release_graph, names, ReleaseContext, ReleaseGraph, ReleaseSettings};
pub use progress::{BuildRecord, ProgressError, ProgressStore, ReleaseProgress};
pub use service::{BuildId, BuildState, PullRequestSpec, ReleaseService};
