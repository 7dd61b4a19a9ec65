use crate::progress::{BuildRecord, ProgressStore, ReleaseProgress};
use crate::service::{BuildState, PullRequestSpec, ReleaseService};
use anyhow::{bail, Context, Result};
use cascade_core::{CycleError, StepContext, StepGraph, StepRef};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Names of the fixed steps in the release graph
pub mod names {
    pub const RESOLVE_COMMIT: &str = "resolve-commit";
    pub const BUILDS_COMPLETE: &str = "builds-complete";
    pub const UPDATE_IMAGES: &str = "update-images";
    pub const WAIT_IMAGES_MERGED: &str = "wait-images-merged";
    pub const TAG_RELEASE: &str = "tag-release";
    pub const ANNOUNCE: &str = "announce";
    pub const RELEASE_COMPLETE: &str = "release-complete";

    pub fn build(platform: &str) -> String {
        format!("build-{platform}")
    }

    pub fn wait_build(platform: &str) -> String {
        format!("wait-build-{platform}")
    }
}

/// Knobs for the release graph
#[derive(Debug, Clone)]
pub struct ReleaseSettings {
    pub branch: String,
    pub platforms: Vec<String>,
    /// Delay between status polls
    pub poll_interval: Duration,
    /// Limit for steps that make a single remote call
    pub step_timeout: Option<Duration>,
    /// Limit for waiting on one build
    pub build_timeout: Option<Duration>,
    /// Limit for waiting on the image pull request
    pub merge_timeout: Option<Duration>,
}

impl Default for ReleaseSettings {
    fn default() -> Self {
        Self {
            branch: "main".to_string(),
            platforms: vec!["linux-amd64".to_string(), "windows-amd64".to_string()],
            poll_interval: Duration::from_secs(30),
            step_timeout: Some(Duration::from_secs(120)),
            build_timeout: Some(Duration::from_secs(4 * 60 * 60)),
            merge_timeout: None,
        }
    }
}

/// State shared by every release step: the service, the progress record and
/// where to persist it.
#[derive(Clone)]
pub struct ReleaseContext {
    service: Arc<dyn ReleaseService>,
    progress: Arc<Mutex<ReleaseProgress>>,
    store: Option<ProgressStore>,
    settings: Arc<ReleaseSettings>,
}

impl ReleaseContext {
    pub fn new(
        service: Arc<dyn ReleaseService>,
        progress: ReleaseProgress,
        settings: ReleaseSettings,
    ) -> Self {
        Self {
            service,
            progress: Arc::new(Mutex::new(progress)),
            store: None,
            settings: Arc::new(settings),
        }
    }

    /// Persist the progress record after every change
    pub fn with_store(mut self, store: ProgressStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn settings(&self) -> &ReleaseSettings {
        &self.settings
    }

    pub async fn snapshot(&self) -> ReleaseProgress {
        self.progress.lock().await.clone()
    }

    async fn read<T>(&self, f: impl FnOnce(&ReleaseProgress) -> T) -> T {
        f(&*self.progress.lock().await)
    }

    /// Apply a change to the progress record and persist it
    async fn record(&self, f: impl FnOnce(&mut ReleaseProgress)) -> Result<()> {
        let mut progress = self.progress.lock().await;
        f(&mut *progress);
        progress.updated_at = Some(chrono::Utc::now());
        if let Some(store) = &self.store {
            store
                .save(&progress)
                .await
                .context("Failed to persist release progress")?;
        }
        Ok(())
    }

    async fn commit(&self) -> Result<String> {
        self.read(|p| p.commit.clone())
            .await
            .context("commit has not been resolved")
    }

    async fn resolve_commit(&self) -> Result<()> {
        if let Some(commit) = self.read(|p| p.commit.clone()).await {
            tracing::debug!("Commit already resolved: {}", commit);
            return Ok(());
        }

        let commit = self
            .service
            .resolve_commit(&self.settings.branch)
            .await
            .with_context(|| format!("Failed to resolve head of {}", self.settings.branch))?;
        tracing::info!("Releasing commit {}", commit);
        self.record(|p| p.commit = Some(commit)).await
    }

    async fn trigger_build(&self, platform: &str) -> Result<()> {
        if let Some(build) = self.read(|p| p.builds.get(platform).cloned()).await {
            tracing::debug!("Build for {} already triggered: {}", platform, build.build_id);
            return Ok(());
        }

        let commit = self.commit().await?;
        let build_id = self
            .service
            .trigger_build(platform, &commit)
            .await
            .with_context(|| format!("Failed to trigger build for {}", platform))?;
        tracing::info!("Triggered build {} for {}", build_id, platform);

        let platform = platform.to_string();
        self.record(move |p| {
            p.builds.insert(
                platform,
                BuildRecord {
                    build_id,
                    passed: false,
                },
            );
        })
        .await
    }

    async fn wait_build(&self, platform: &str, step: &StepContext) -> Result<()> {
        let build = self
            .read(|p| p.builds.get(platform).cloned())
            .await
            .with_context(|| format!("No build recorded for {}", platform))?;
        if build.passed {
            return Ok(());
        }

        loop {
            let state = self
                .service
                .build_status(&build.build_id)
                .await
                .with_context(|| format!("Failed to poll build {}", build.build_id))?;

            match state {
                BuildState::Succeeded => break,
                BuildState::Failed => {
                    // Forget the build so a retry triggers a fresh one.
                    let failed = platform.to_string();
                    self.record(move |p| {
                        p.builds.remove(&failed);
                    })
                    .await?;
                    bail!("build {} for {} failed", build.build_id, platform);
                }
                BuildState::Queued | BuildState::Running => {
                    tracing::debug!("Build {} is {:?}", build.build_id, state);
                    step.sleep(self.settings.poll_interval).await?;
                }
            }
        }

        tracing::info!("Build {} for {} succeeded", build.build_id, platform);
        let platform = platform.to_string();
        self.record(move |p| {
            if let Some(record) = p.builds.get_mut(&platform) {
                record.passed = true;
            }
        })
        .await
    }

    async fn update_images(&self) -> Result<()> {
        if let Some(number) = self.read(|p| p.images_pull_request).await {
            tracing::debug!("Image update already proposed in #{}", number);
            return Ok(());
        }

        let (version, builds) = self
            .read(|p| {
                let builds: Vec<String> = p
                    .builds
                    .iter()
                    .map(|(platform, b)| format!("- {}: {}", platform, b.build_id))
                    .collect();
                (p.version.clone(), builds)
            })
            .await;

        let spec = PullRequestSpec {
            branch: format!("release/{}-images", version),
            title: format!("Update images to {}", version),
            body: builds.join("\n"),
        };
        let number = self
            .service
            .create_pull_request(&spec)
            .await
            .context("Failed to open image update pull request")?;
        tracing::info!("Opened image update pull request #{}", number);
        self.record(|p| p.images_pull_request = Some(number)).await
    }

    async fn wait_images_merged(&self, step: &StepContext) -> Result<()> {
        let (number, merged) = self
            .read(|p| (p.images_pull_request, p.images_merged))
            .await;
        if merged {
            return Ok(());
        }
        let number = number.context("image update pull request has not been opened")?;

        while !self
            .service
            .pull_request_merged(number)
            .await
            .with_context(|| format!("Failed to check pull request #{}", number))?
        {
            step.sleep(self.settings.poll_interval).await?;
        }

        tracing::info!("Pull request #{} merged", number);
        self.record(|p| p.images_merged = true).await
    }

    async fn tag_release(&self) -> Result<()> {
        if self.read(|p| p.tag.is_some()).await {
            return Ok(());
        }

        let commit = self.commit().await?;
        let tag = format!("v{}", self.read(|p| p.version.clone()).await);
        self.service
            .create_tag(&tag, &commit)
            .await
            .with_context(|| format!("Failed to create tag {}", tag))?;
        tracing::info!("Tagged {} as {}", commit, tag);
        self.record(|p| p.tag = Some(tag)).await
    }

    async fn announce(&self) -> Result<()> {
        let (version, tag, announced) = self
            .read(|p| (p.version.clone(), p.tag.clone(), p.announced))
            .await;
        if announced {
            return Ok(());
        }
        let tag = tag.context("release has not been tagged")?;

        self.service
            .publish_announcement(&version, &tag)
            .await
            .context("Failed to publish announcement")?;
        tracing::info!("Announced release {}", version);
        self.record(|p| p.announced = true).await
    }
}

/// The release step graph and the step that marks it finished
pub struct ReleaseGraph {
    pub graph: StepGraph,
    pub complete: StepRef,
}

impl ReleaseGraph {
    /// Every step needed to reach `release-complete`, dependencies first
    pub fn steps(&self) -> Result<Vec<StepRef>, CycleError> {
        self.graph.transitive_dependencies(self.complete)
    }
}

fn add_step<F, Fut>(
    graph: &mut StepGraph,
    ctx: &ReleaseContext,
    name: impl Into<String>,
    timeout: Option<Duration>,
    depends_on: &[StepRef],
    body: F,
) -> StepRef
where
    F: Fn(ReleaseContext, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let ctx = ctx.clone();
    graph.step(name, timeout, move |step| body(ctx.clone(), step), depends_on)
}

/// Build the release process graph.
///
/// ```text
/// resolve-commit -> build-<p> -> wait-build-<p> -> builds-complete
/// builds-complete -> tag-release ---------------------------> announce -> release-complete
/// builds-complete -> update-images -> wait-images-merged ---^
/// ```
pub fn build_release_graph(ctx: &ReleaseContext) -> ReleaseGraph {
    let settings = ctx.settings().clone();
    let mut graph = StepGraph::new();

    let resolve = add_step(
        &mut graph,
        ctx,
        names::RESOLVE_COMMIT,
        settings.step_timeout,
        &[],
        |ctx, _| async move { ctx.resolve_commit().await },
    );

    let mut waits = Vec::with_capacity(settings.platforms.len());
    for platform in &settings.platforms {
        let p = platform.clone();
        let trigger = add_step(
            &mut graph,
            ctx,
            names::build(platform),
            settings.step_timeout,
            &[resolve],
            move |ctx, _| {
                let p = p.clone();
                async move { ctx.trigger_build(&p).await }
            },
        );

        let p = platform.clone();
        waits.push(add_step(
            &mut graph,
            ctx,
            names::wait_build(platform),
            settings.build_timeout,
            &[trigger],
            move |ctx, step| {
                let p = p.clone();
                async move { ctx.wait_build(&p, &step).await }
            },
        ));
    }
    let builds = graph.indicator(names::BUILDS_COMPLETE, &waits);

    let tag = add_step(
        &mut graph,
        ctx,
        names::TAG_RELEASE,
        settings.step_timeout,
        &[builds],
        |ctx, _| async move { ctx.tag_release().await },
    );

    let images = add_step(
        &mut graph,
        ctx,
        names::UPDATE_IMAGES,
        settings.step_timeout,
        &[builds],
        |ctx, _| async move { ctx.update_images().await },
    );
    let merged = add_step(
        &mut graph,
        ctx,
        names::WAIT_IMAGES_MERGED,
        settings.merge_timeout,
        &[images],
        |ctx, step| async move { ctx.wait_images_merged(&step).await },
    );

    let announce = add_step(
        &mut graph,
        ctx,
        names::ANNOUNCE,
        settings.step_timeout,
        &[tag, merged],
        |ctx, _| async move { ctx.announce().await },
    );
    let complete = graph.indicator(names::RELEASE_COMPLETE, &[announce]);

    ReleaseGraph { graph, complete }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dry_run::{DryRunOptions, DryRunService, Operation};
    use cascade_core::{CancellationToken, Runner, StepStatus};
    use tempfile::TempDir;

    const MUTATING: [Operation; 4] = [
        Operation::TriggerBuild,
        Operation::CreatePullRequest,
        Operation::CreateTag,
        Operation::PublishAnnouncement,
    ];

    fn settings() -> ReleaseSettings {
        ReleaseSettings {
            poll_interval: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn context(service: &Arc<DryRunService>, progress: ReleaseProgress) -> ReleaseContext {
        ReleaseContext::new(service.clone(), progress, settings())
    }

    async fn counts(service: &DryRunService) -> Vec<usize> {
        let mut counts = Vec::new();
        for op in MUTATING {
            counts.push(service.calls(op).await);
        }
        counts
    }

    async fn run(ctx: &ReleaseContext) -> cascade_core::RunReport {
        let release = build_release_graph(ctx);
        let steps = release.steps().unwrap();
        Runner::new()
            .run(CancellationToken::new(), &release.graph, &steps)
            .await
            .unwrap()
    }

    #[test]
    fn test_plan_order() {
        let service = Arc::new(DryRunService::default());
        let release = build_release_graph(&context(&service, ReleaseProgress::new("1.0.0")));
        let steps = release.steps().unwrap();
        let order: Vec<&str> = steps.iter().map(|s| release.graph.name(*s)).collect();

        assert_eq!(order.first(), Some(&names::RESOLVE_COMMIT));
        assert_eq!(order.last(), Some(&names::RELEASE_COMPLETE));
        assert_eq!(order.len(), release.graph.len());

        let pos = |name: &str| order.iter().position(|n| *n == name).unwrap();
        assert!(pos("wait-build-linux-amd64") < pos(names::BUILDS_COMPLETE));
        assert!(pos(names::WAIT_IMAGES_MERGED) < pos(names::ANNOUNCE));
        assert!(pos(names::TAG_RELEASE) < pos(names::ANNOUNCE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_release() {
        let service = Arc::new(DryRunService::default());
        let ctx = context(&service, ReleaseProgress::new("1.2.3"));

        let report = run(&ctx).await;
        assert!(report.is_success(), "{:?}", report.first_error);

        let progress = ctx.snapshot().await;
        assert!(progress.is_complete());
        assert_eq!(progress.tag.as_deref(), Some("v1.2.3"));
        assert!(progress.images_merged);
        assert_eq!(progress.builds.len(), 2);
        assert!(progress.builds.values().all(|b| b.passed));
        assert_eq!(counts(&service).await, vec![2, 1, 1, 1]);
        assert_eq!(service.announcements().await, vec!["Released 1.2.3 (v1.2.3)"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_is_idempotent() {
        let service = Arc::new(DryRunService::default());
        let ctx = context(&service, ReleaseProgress::new("1.2.3"));
        assert!(run(&ctx).await.is_success());

        let before = counts(&service).await;
        let polls = service.calls(Operation::BuildStatus).await;

        let report = run(&ctx).await;
        assert!(report.is_success());
        assert_eq!(counts(&service).await, before);
        assert_eq!(service.calls(Operation::BuildStatus).await, polls);
        assert_eq!(service.calls(Operation::ResolveCommit).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_build_blocks_release() {
        let service = Arc::new(DryRunService::new(DryRunOptions {
            failing_platform: Some("windows-amd64".into()),
            ..Default::default()
        }));
        let ctx = context(&service, ReleaseProgress::new("1.2.3"));

        let report = run(&ctx).await;
        let err = report.first_error.clone().unwrap();
        assert_eq!(err.step(), Some("wait-build-windows-amd64"));
        assert!(err.to_string().contains("failed"));

        for name in [names::BUILDS_COMPLETE, names::TAG_RELEASE, names::ANNOUNCE] {
            assert!(report.record(name).unwrap().never_ran(), "{name}");
        }
        assert_eq!(service.calls(Operation::TriggerBuild).await, 2);
        assert_eq!(service.calls(Operation::CreateTag).await, 0);
        let progress = ctx.snapshot().await;
        assert!(progress.tag.is_none());
        assert!(!progress.builds.contains_key("windows-amd64"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_build_retriggered_by_new_process() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::new(dir.path().join("release.json"));

        let failing = Arc::new(DryRunService::new(DryRunOptions {
            failing_platform: Some("windows-amd64".into()),
            ..Default::default()
        }));
        let progress = store.load_or_new("3.0.0").await.unwrap();
        let ctx = context(&failing, progress).with_store(store.clone());
        let report = run(&ctx).await;
        assert_eq!(
            report.first_error.as_ref().unwrap().step(),
            Some("wait-build-windows-amd64")
        );

        let saved = store.load().await.unwrap().unwrap();
        assert!(saved.commit.is_some());
        assert!(!saved.builds.contains_key("windows-amd64"));

        // A new process with a fresh service and the same progress file.
        let service = Arc::new(DryRunService::default());
        let ctx = context(&service, saved).with_store(store.clone());
        let report = run(&ctx).await;
        assert!(report.is_success(), "{:?}", report.first_error);

        assert_eq!(service.calls(Operation::ResolveCommit).await, 0);
        // Only the failed platform is built again.
        assert_eq!(service.calls(Operation::TriggerBuild).await, 1);
        assert!(store.load().await.unwrap().unwrap().is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_failure_from_disk() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::new(dir.path().join("release.json"));
        let service = Arc::new(DryRunService::default());
        service.fail_on(Some(Operation::PublishAnnouncement)).await;

        let progress = store.load_or_new("2.0.0").await.unwrap();
        let ctx = context(&service, progress).with_store(store.clone());
        let report = run(&ctx).await;
        assert_eq!(report.first_error.as_ref().unwrap().step(), Some(names::ANNOUNCE));
        assert_eq!(report.status_of(names::TAG_RELEASE), Some(StepStatus::Succeeded));

        // A new process: reload the record from disk and run again.
        service.fail_on(None).await;
        let progress = store.load_or_new("2.0.0").await.unwrap();
        assert_eq!(progress.tag.as_deref(), Some("v2.0.0"));
        assert!(!progress.announced);

        let ctx = context(&service, progress).with_store(store.clone());
        assert!(run(&ctx).await.is_success());

        assert_eq!(service.calls(Operation::TriggerBuild).await, 2);
        assert_eq!(service.calls(Operation::CreateTag).await, 1);
        assert_eq!(service.calls(Operation::PublishAnnouncement).await, 2);
        assert!(store.load().await.unwrap().unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_step_without_recorded_commit_fails() {
        let service = Arc::new(DryRunService::default());
        let ctx = context(&service, ReleaseProgress::new("1.0.0"));

        let err = ctx.trigger_build("linux-amd64").await.unwrap_err();
        assert!(err.to_string().contains("commit has not been resolved"));
        assert_eq!(service.calls(Operation::TriggerBuild).await, 0);
    }

    #[tokio::test]
    async fn test_recorded_step_skips_service() {
        let service = Arc::new(DryRunService::default());
        let mut progress = ReleaseProgress::new("1.0.0");
        progress.commit = Some("abc".into());
        progress.tag = Some("v1.0.0".into());
        let ctx = context(&service, progress);

        ctx.resolve_commit().await.unwrap();
        ctx.tag_release().await.unwrap();
        assert_eq!(service.calls(Operation::ResolveCommit).await, 0);
        assert_eq!(service.calls(Operation::CreateTag).await, 0);
    }
}
