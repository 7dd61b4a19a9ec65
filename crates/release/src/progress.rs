//! The persisted record of how far a release has progressed.
//!
//! Each step reads this record before calling out to the service and writes
//! its own output into it, so re-running the graph after a crash or a failed
//! step skips the work that already happened.

use crate::service::BuildId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build_id: BuildId,
    /// Set once the build has been observed to succeed
    #[serde(default)]
    pub passed: bool,
}

/// Release progress. Every field (or, for `builds`, every key) is written by
/// exactly one step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseProgress {
    pub version: String,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub builds: BTreeMap<String, BuildRecord>,
    #[serde(default)]
    pub images_pull_request: Option<u64>,
    #[serde(default)]
    pub images_merged: bool,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub announced: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ReleaseProgress {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.announced
    }
}

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("failed to access progress file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse progress file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode progress: {0}")]
    Encode(serde_json::Error),

    #[error("progress file is for version {found}, not {expected}")]
    VersionMismatch { expected: String, found: String },
}

/// JSON file holding a [`ReleaseProgress`]
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record, or `None` if the file does not exist yet
    pub async fn load(&self) -> Result<Option<ReleaseProgress>, ProgressError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ProgressError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| ProgressError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    /// Resume the record for `version`, or start a fresh one
    pub async fn load_or_new(&self, version: &str) -> Result<ReleaseProgress, ProgressError> {
        match self.load().await? {
            Some(progress) if progress.version != version => Err(ProgressError::VersionMismatch {
                expected: version.to_string(),
                found: progress.version,
            }),
            Some(progress) => {
                tracing::info!("Resuming release {} from {}", version, self.path.display());
                Ok(progress)
            }
            None => Ok(ReleaseProgress::new(version)),
        }
    }

    /// Write the record through a temporary file so a crash never leaves a
    /// truncated file behind
    pub async fn save(&self, progress: &ReleaseProgress) -> Result<(), ProgressError> {
        let io_error = |source: std::io::Error| ProgressError::Io {
            path: self.path.clone(),
            source,
        };

        let json = serde_json::to_vec_pretty(progress).map_err(ProgressError::Encode)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_error)?;
        Ok(())
    }
}
