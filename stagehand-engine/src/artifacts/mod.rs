// Artifacts Module
// Retains job outputs per (project, job, ref) for a bounded retention window

pub mod clock;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use store::FsArtifactStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Files of one artifact, keyed by relative path
pub type ArtifactFiles = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Never published, or past its retention window
    #[error("no artifacts for {0}")]
    NotFound(String),

    #[error("artifact storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("invalid artifact path '{0}'")]
    InvalidPath(String),

    #[error("invalid retention: {0}")]
    InvalidRetention(String),
}

impl ArtifactError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ArtifactError::NotFound(_))
    }
}

/// Address of one published artifact version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub project: String,
    pub job: String,
    pub git_ref: String,
    pub version: u64,
}

impl fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}#{}",
            self.project, self.job, self.git_ref, self.version
        )
    }
}

/// Stored metadata for an artifact version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub handle: ArtifactHandle,
    pub files: Vec<String>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ArtifactRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Storage for job artifacts
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Publish files as a new version of `(job, ref)`
    async fn publish(
        &self,
        job: &str,
        git_ref: &str,
        files: ArtifactFiles,
        retention: Duration,
    ) -> Result<ArtifactHandle, ArtifactError>;

    /// Read an artifact's files; expired artifacts are `NotFound`
    async fn fetch(&self, handle: &ArtifactHandle) -> Result<ArtifactFiles, ArtifactError>;

    /// Newest unexpired version of `(job, ref)`
    async fn latest(&self, job: &str, git_ref: &str) -> Result<ArtifactHandle, ArtifactError>;

    /// Every stored record, expired ones included, oldest first
    async fn list(&self) -> Result<Vec<ArtifactRecord>, ArtifactError>;

    /// Delete expired versions, returning how many were removed
    async fn reap_expired(&self) -> Result<usize, ArtifactError>;
}

/// Run `reap_expired` on an interval until cancelled
pub fn spawn_reaper(
    store: Arc<dyn ArtifactStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match store.reap_expired().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "reaped expired artifacts"),
                    Err(e) => tracing::warn!(error = %e, "artifact reaper failed"),
                },
            }
        }
        tracing::debug!("artifact reaper stopped");
    })
}
