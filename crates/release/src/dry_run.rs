//! In-memory [`ReleaseService`] that simulates the remote systems.
//!
//! State lives only as long as the service, but a resumed release polls
//! builds and pull requests recorded by an earlier process. Those are adopted
//! as if they had just been started.

use crate::service::{BuildId, BuildState, PullRequestSpec, ReleaseService};
use anyhow::{bail, Result};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Service operations, used to count and inject failures into calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ResolveCommit,
    TriggerBuild,
    BuildStatus,
    CreatePullRequest,
    PullRequestMerged,
    CreateTag,
    PublishAnnouncement,
}

/// Behaviour knobs for [`DryRunService`]
#[derive(Debug, Clone)]
pub struct DryRunOptions {
    /// Status polls a build reports as running before it finishes
    pub build_polls: u32,
    /// Merge-status polls before a pull request reports merged
    pub merge_polls: u32,
    /// Builds for this platform finish as failed
    pub failing_platform: Option<String>,
}

impl Default for DryRunOptions {
    fn default() -> Self {
        Self {
            build_polls: 2,
            merge_polls: 1,
            failing_platform: None,
        }
    }
}

#[derive(Debug)]
struct Build {
    platform: String,
    polls: u32,
}

#[derive(Debug, Default)]
struct DryRunState {
    calls: HashMap<Operation, usize>,
    fail_on: Option<Operation>,
    next_build: u64,
    builds: HashMap<BuildId, Build>,
    pull_requests: HashMap<u64, u32>,
    tags: Vec<(String, String)>,
    announcements: Vec<String>,
}

/// Simulated build system and repository host
#[derive(Debug, Default)]
pub struct DryRunService {
    options: DryRunOptions,
    state: Mutex<DryRunState>,
}

impl DryRunService {
    pub fn new(options: DryRunOptions) -> Self {
        Self {
            options,
            state: Mutex::new(DryRunState::default()),
        }
    }

    /// Make every call to `operation` fail until cleared with `None`
    pub async fn fail_on(&self, operation: Option<Operation>) {
        self.state.lock().await.fail_on = operation;
    }

    /// Number of calls made to `operation`, including failed ones
    pub async fn calls(&self, operation: Operation) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    pub async fn tags(&self) -> Vec<(String, String)> {
        self.state.lock().await.tags.clone()
    }

    pub async fn announcements(&self) -> Vec<String> {
        self.state.lock().await.announcements.clone()
    }

    /// Count the call and apply any injected failure
    fn enter(state: &mut DryRunState, operation: Operation) -> Result<()> {
        *state.calls.entry(operation).or_default() += 1;
        if state.fail_on == Some(operation) {
            bail!("injected failure in {:?}", operation);
        }
        Ok(())
    }
}

/// Platform encoded in a build id issued by [`DryRunService::trigger_build`]
fn platform_of(build: &BuildId) -> String {
    build
        .0
        .rsplit_once("-build-")
        .map(|(platform, _)| platform.to_string())
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl ReleaseService for DryRunService {
    async fn resolve_commit(&self, branch: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        Self::enter(&mut state, Operation::ResolveCommit)?;
        tracing::info!("[dry-run] Resolving head of {}", branch);
        Ok(format!("{:040x}", branch.len() as u64 * 0x9e37_79b9))
    }

    async fn trigger_build(&self, platform: &str, commit: &str) -> Result<BuildId> {
        let mut state = self.state.lock().await;
        Self::enter(&mut state, Operation::TriggerBuild)?;
        state.next_build += 1;
        let id = BuildId::new(format!("{}-build-{}", platform, state.next_build));
        state.builds.insert(
            id.clone(),
            Build {
                platform: platform.to_string(),
                polls: 0,
            },
        );
        tracing::info!("[dry-run] Triggered {} for {} at {}", id, platform, commit);
        Ok(id)
    }

    async fn build_status(&self, build: &BuildId) -> Result<BuildState> {
        let mut state = self.state.lock().await;
        Self::enter(&mut state, Operation::BuildStatus)?;
        let entry = state.builds.entry(build.clone()).or_insert_with(|| {
            tracing::info!("[dry-run] Adopting build {} from an earlier run", build);
            Build {
                platform: platform_of(build),
                polls: 0,
            }
        });

        entry.polls += 1;
        if entry.polls <= self.options.build_polls {
            return Ok(BuildState::Running);
        }
        if self.options.failing_platform.as_deref() == Some(entry.platform.as_str()) {
            return Ok(BuildState::Failed);
        }
        Ok(BuildState::Succeeded)
    }

    async fn create_pull_request(&self, spec: &PullRequestSpec) -> Result<u64> {
        let mut state = self.state.lock().await;
        Self::enter(&mut state, Operation::CreatePullRequest)?;
        let number = 100 + state.pull_requests.len() as u64;
        state.pull_requests.insert(number, 0);
        tracing::info!("[dry-run] Opened #{} from {}: {}", number, spec.branch, spec.title);
        Ok(number)
    }

    async fn pull_request_merged(&self, number: u64) -> Result<bool> {
        let mut state = self.state.lock().await;
        Self::enter(&mut state, Operation::PullRequestMerged)?;
        let polls = state.pull_requests.entry(number).or_insert_with(|| {
            tracing::info!("[dry-run] Adopting pull request #{} from an earlier run", number);
            0
        });

        *polls += 1;
        Ok(*polls > self.options.merge_polls)
    }

    async fn create_tag(&self, tag: &str, commit: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::enter(&mut state, Operation::CreateTag)?;
        if state.tags.iter().any(|(t, _)| t == tag) {
            bail!("tag {} already exists", tag);
        }
        state.tags.push((tag.to_string(), commit.to_string()));
        Ok(())
    }

    async fn publish_announcement(&self, version: &str, tag: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::enter(&mut state, Operation::PublishAnnouncement)?;
        state
            .announcements
            .push(format!("Released {} ({})", version, tag));
        Ok(())
    }
}
