use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Identifier of a build started on the remote build system
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildId(pub String);

impl BuildId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a remote build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// Pull request to open against the image repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestSpec {
    pub branch: String,
    pub title: String,
    pub body: String,
}

/// Remote operations the release steps call out to.
///
/// Implementations talk to whatever hosts the builds and repositories; the
/// step graph only depends on this capability set.
#[async_trait::async_trait]
pub trait ReleaseService: Send + Sync {
    /// Resolve the head commit of a branch
    async fn resolve_commit(&self, branch: &str) -> Result<String>;

    /// Start a build of `commit` for one platform
    async fn trigger_build(&self, platform: &str, commit: &str) -> Result<BuildId>;

    /// Poll a previously started build
    async fn build_status(&self, build: &BuildId) -> Result<BuildState>;

    /// Open a pull request and return its number
    async fn create_pull_request(&self, spec: &PullRequestSpec) -> Result<u64>;

    /// Check whether a pull request has been merged
    async fn pull_request_merged(&self, number: u64) -> Result<bool>;

    /// Tag `commit` in the source repository
    async fn create_tag(&self, tag: &str, commit: &str) -> Result<()>;

    /// Publish the release announcement
    async fn publish_announcement(&self, version: &str, tag: &str) -> Result<()>;
}
