//! Where the reconciler reads the current release set from.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use flotilla_id::AppId;
use tracing::debug;

use crate::error::SchedulerError;
use crate::release::Release;

/// Supplies the releases that should currently be running.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// The current release of every app.
    ///
    /// An error means the release set is unknown, not empty.
    async fn releases(&self) -> Result<Vec<Release>, SchedulerError>;
}

/// A release set held in memory.
#[derive(Clone, Default)]
pub struct StaticReleases {
    releases: Arc<RwLock<Vec<Release>>>,
}

impl StaticReleases {
    pub fn new(releases: Vec<Release>) -> Self {
        Self {
            releases: Arc::new(RwLock::new(releases)),
        }
    }

    /// Replace the release of `release.app`, or add it.
    pub fn upsert(&self, release: Release) {
        let mut releases = self.releases.write().unwrap_or_else(|e| e.into_inner());
        match releases.iter_mut().find(|r| r.app.id == release.app.id) {
            Some(existing) => *existing = release,
            None => releases.push(release),
        }
    }

    /// Drop an app's release; its jobs become undesired.
    pub fn remove(&self, app: &AppId) {
        self.releases
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|r| &r.app.id != app);
    }
}

#[async_trait]
impl ReleaseSource for StaticReleases {
    async fn releases(&self) -> Result<Vec<Release>, SchedulerError> {
        Ok(self
            .releases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

/// A JSON array of releases on disk, re-read on every call.
#[derive(Debug, Clone)]
pub struct FileReleases {
    path: PathBuf,
}

impl FileReleases {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReleaseSource for FileReleases {
    async fn releases(&self) -> Result<Vec<Release>, SchedulerError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| SchedulerError::Releases(format!("{}: {e}", self.path.display())))?;

        let releases: Vec<Release> = serde_json::from_slice(&bytes)
            .map_err(|e| SchedulerError::Releases(format!("{}: {e}", self.path.display())))?;

        let mut apps: Vec<&AppId> = releases.iter().map(|r| &r.app.id).collect();
        apps.sort();
        if let Some(pair) = apps.windows(2).find(|w| w[0] == w[1]) {
            return Err(SchedulerError::Releases(format!(
                "{}: app {} has more than one release",
                self.path.display(),
                pair[0]
            )));
        }

        debug!(path = %self.path.display(), count = releases.len(), "Loaded releases");
        Ok(releases)
    }
}
