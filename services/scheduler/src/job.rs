//! Job model.
//!
//! A [`Job`] is one instance of one process type of one app. Jobs are
//! immutable values; a new desired state produces new jobs.

use std::collections::BTreeMap;

use flotilla_id::JobName;
use flotilla_reconcile::SpecHash;
use serde::{Deserialize, Serialize};

use crate::release::Image;

/// A unit of work: what to run, and under which name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: JobName,
    pub environment: BTreeMap<String, String>,
    pub command: String,
    pub image: Image,
}

impl Job {
    /// Hash of everything that affects the running container.
    ///
    /// The name is excluded: two instances of the same process share a spec.
    pub fn spec_hash(&self) -> SpecHash {
        spec_hash(&self.image, &self.command, &self.environment)
    }
}

/// Observed lifecycle state of a scheduled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Submitted, placement not confirmed.
    Pending,
    Running,
    Failed,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job together with its observed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobState {
    pub job: Job,
    pub state: State,
}

/// The subset of a job a backend needs to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: JobName,
    pub image: Image,
    pub command: String,
    pub env: BTreeMap<String, String>,
}

impl Container {
    /// Same value as [`Job::spec_hash`] for the job this came from.
    pub fn spec_hash(&self) -> SpecHash {
        spec_hash(&self.image, &self.command, &self.env)
    }
}

impl From<&Job> for Container {
    fn from(job: &Job) -> Self {
        Self {
            name: job.name.clone(),
            image: job.image.clone(),
            command: job.command.clone(),
            env: job.environment.clone(),
        }
    }
}

fn spec_hash(image: &Image, command: &str, env: &BTreeMap<String, String>) -> SpecHash {
    SpecHash::from_json(&serde_json::json!({
        "image": image.to_string(),
        "command": command,
        "environment": env,
    }))
}
