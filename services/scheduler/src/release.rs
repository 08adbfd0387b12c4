//! Release model.
//!
//! Releases are produced elsewhere (API, build pipeline); the scheduler only
//! reads them. A release pins an app's config, its built slug and the
//! formation to run.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use flotilla_id::{AppId, ProcessType};
use serde::{Deserialize, Serialize};

/// A container image reference, `repo:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Image {
    pub repo: String,
    pub tag: String,
}

impl Image {
    pub fn new(repo: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repo, self.tag)
    }
}

/// Error parsing an image reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid image reference '{0}': expected repo:tag")]
pub struct InvalidImage(pub String);

impl FromStr for Image {
    type Err = InvalidImage;

    /// Splits on the last `:` that comes after the last `/`, so registry
    /// ports (`registry:5000/acme`) stay part of the repo.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name_start = s.rfind('/').map_or(0, |i| i + 1);
        let Some(colon) = s[name_start..].rfind(':').map(|i| i + name_start) else {
            return Err(InvalidImage(s.to_string()));
        };

        let (repo, tag) = (&s[..colon], &s[colon + 1..]);
        if repo.is_empty() || tag.is_empty() {
            return Err(InvalidImage(s.to_string()));
        }
        Ok(Self::new(repo, tag))
    }
}

impl Serialize for Image {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Image {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub id: AppId,
    #[serde(default)]
    pub name: Option<String>,
}

/// Config vars of an app at a release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// A built artifact: the image and the commands it declares per process type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slug {
    pub image: Image,
    #[serde(default)]
    pub process_types: BTreeMap<ProcessType, String>,
}

/// Desired instance count of one process type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessFormation {
    pub count: u32,
}

/// Desired instance count per process type.
pub type Formation = BTreeMap<ProcessType, ProcessFormation>;

/// What should be running for one app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub version: u32,
    pub app: App,
    #[serde(default)]
    pub config: Config,
    pub slug: Slug,
    #[serde(default)]
    pub formation: Formation,
}
