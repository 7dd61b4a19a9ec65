use anyhow::{Context, Result};
use cascade_release::{DryRunOptions, ReleaseSettings};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub release: ReleaseConfig,

    #[serde(default)]
    pub dry_run: DryRunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    #[serde(default = "default_branch")]
    pub branch: String,

    #[serde(default = "default_platforms")]
    pub platforms: Vec<String>,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// 0 disables the timeout
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,

    #[serde(default)]
    pub merge_timeout_secs: u64,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_platforms() -> Vec<String> {
    vec!["linux-amd64".to_string(), "windows-amd64".to_string()]
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_step_timeout_secs() -> u64 {
    120
}

fn default_build_timeout_secs() -> u64 {
    4 * 60 * 60
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            branch: default_branch(),
            platforms: default_platforms(),
            poll_interval_secs: default_poll_interval_secs(),
            step_timeout_secs: default_step_timeout_secs(),
            build_timeout_secs: default_build_timeout_secs(),
            merge_timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunConfig {
    #[serde(default = "default_build_polls")]
    pub build_polls: u32,

    #[serde(default = "default_merge_polls")]
    pub merge_polls: u32,
}

fn default_build_polls() -> u32 {
    2
}

fn default_merge_polls() -> u32 {
    1
}

impl Default for DryRunConfig {
    fn default() -> Self {
        Self {
            build_polls: default_build_polls(),
            merge_polls: default_merge_polls(),
        }
    }
}

fn timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl CliConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Platforms given on the command line replace the configured ones
    pub fn override_platforms(&mut self, platforms: Vec<String>) {
        if !platforms.is_empty() {
            self.release.platforms = platforms;
        }
    }

    pub fn release_settings(&self) -> ReleaseSettings {
        let release = &self.release;
        ReleaseSettings {
            branch: release.branch.clone(),
            platforms: release.platforms.clone(),
            poll_interval: Duration::from_secs(release.poll_interval_secs),
            step_timeout: timeout(release.step_timeout_secs),
            build_timeout: timeout(release.build_timeout_secs),
            merge_timeout: timeout(release.merge_timeout_secs),
        }
    }

    pub fn dry_run_options(&self, failing_platform: Option<String>) -> DryRunOptions {
        DryRunOptions {
            build_polls: self.dry_run.build_polls,
            merge_polls: self.dry_run.merge_polls,
            failing_platform,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = CliConfig::load(&dir.path().join("cascade.toml")).unwrap();

        let settings = config.release_settings();
        assert_eq!(settings.branch, "main");
        assert_eq!(settings.platforms.len(), 2);
        assert_eq!(settings.step_timeout, Some(Duration::from_secs(120)));
        assert_eq!(settings.merge_timeout, None);
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cascade.toml");
        std::fs::write(
            &path,
            r#"
[release]
branch = "release-branch.1.22"
platforms = ["linux-arm64"]
step_timeout_secs = 0

[dry_run]
build_polls = 5
"#,
        )
        .unwrap();

        let config = CliConfig::load(&path).unwrap();
        let settings = config.release_settings();
        assert_eq!(settings.branch, "release-branch.1.22");
        assert_eq!(settings.platforms, ["linux-arm64"]);
        assert_eq!(settings.step_timeout, None);
        assert_eq!(settings.poll_interval, Duration::from_secs(30));

        let options = config.dry_run_options(None);
        assert_eq!(options.build_polls, 5);
        assert_eq!(options.merge_polls, 1);
    }

    #[test]
    fn test_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cascade.toml");
        std::fs::write(&path, "[release]\nplatforms = 3\n").unwrap();

        let err = CliConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_platform_override() {
        let mut config = CliConfig::default();
        config.override_platforms(Vec::new());
        assert_eq!(config.release_settings().platforms.len(), 2);

        config.override_platforms(vec!["linux-arm64".into()]);
        assert_eq!(config.release_settings().platforms, ["linux-arm64"]);
    }
}
