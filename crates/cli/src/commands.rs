use crate::config::CliConfig;
use anyhow::{bail, Context, Result};
use cascade_core::{CancellationToken, RunReport, Runner, StepGraph, StepRef};
use cascade_release::{
    build_release_graph, DryRunService, ProgressStore, ReleaseContext, ReleaseProgress,
};
use std::path::Path;
use std::sync::Arc;

/// One line per step: position, name, timeout and dependencies
fn describe(graph: &StepGraph, steps: &[StepRef]) -> Vec<String> {
    steps
        .iter()
        .enumerate()
        .map(|(i, step_ref)| {
            let step = graph.get(*step_ref);
            let kind = if step.is_indicator() { " (indicator)" } else { "" };
            let timeout = step
                .timeout()
                .map(|t| format!(" [timeout {}s]", t.as_secs()))
                .unwrap_or_default();
            let deps: Vec<&str> = step.depends_on().iter().map(|d| graph.name(*d)).collect();
            let deps = if deps.is_empty() {
                String::new()
            } else {
                format!(" <- {}", deps.join(", "))
            };
            format!("{:>3}. {}{}{}{}", i + 1, step.name(), kind, timeout, deps)
        })
        .collect()
}

fn summarize(report: &RunReport) -> Vec<String> {
    report
        .steps
        .iter()
        .map(|record| {
            let duration = record
                .duration()
                .map(|d| format!("{}ms", d.num_milliseconds()))
                .unwrap_or_else(|| "-".to_string());
            let note = if record.never_ran() { " (never ran)" } else { "" };
            format!(
                "{:<28} {:<10} {:>8}{}",
                record.name,
                record.status.to_string(),
                duration,
                note
            )
        })
        .collect()
}

fn plan_lines(config: &CliConfig) -> Result<Vec<String>> {
    // The graph is only inspected, so no service call is ever made.
    let ctx = ReleaseContext::new(
        Arc::new(DryRunService::default()),
        ReleaseProgress::new("plan"),
        config.release_settings(),
    );
    let release = build_release_graph(&ctx);
    let steps = release.steps().context("Release graph is invalid")?;
    Ok(describe(&release.graph, &steps))
}

pub fn plan(config: &CliConfig) -> Result<()> {
    for line in plan_lines(config)? {
        println!("{}", line);
    }
    Ok(())
}

pub async fn run(
    config: &CliConfig,
    version: &str,
    progress_path: &Path,
    fail_platform: Option<String>,
) -> Result<()> {
    let store = ProgressStore::new(progress_path);
    let progress = store
        .load_or_new(version)
        .await
        .context("Failed to load release progress")?;
    if progress.is_complete() {
        tracing::info!("Release {} is already complete", version);
    }

    let service = Arc::new(DryRunService::new(config.dry_run_options(fail_platform)));
    let ctx = ReleaseContext::new(service, progress, config.release_settings()).with_store(store);
    let release = build_release_graph(&ctx);
    let steps = release.steps().context("Release graph is invalid")?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling release run");
            on_interrupt.cancel();
        }
    });

    let report = Runner::new()
        .run(cancel, &release.graph, &steps)
        .await
        .context("Release graph was rejected")?;

    for line in summarize(&report) {
        println!("{}", line);
    }
    println!("progress saved to {}", progress_path.display());

    if let Some(error) = report.first_error {
        bail!("release {} failed: {}", version, error);
    }
    Ok(())
}

pub async fn status(progress_path: &Path) -> Result<()> {
    let store = ProgressStore::new(progress_path);
    let Some(progress) = store.load().await? else {
        bail!("no progress recorded at {}", progress_path.display());
    };

    println!("{}", serde_json::to_string_pretty(&progress)?);
    Ok(())
}
