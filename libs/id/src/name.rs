//! Job names.

use std::fmt;
use std::str::FromStr;

use crate::types::{AppId, ProcessType};
use crate::IdError;

/// The unique name of one instance of one process type of an app.
///
/// Formatted as `{app}.{process_type}.{instance}` with a 1-based instance
/// index. The same triple always yields the same name, and a name is only
/// reused after the previous holder has been unscheduled.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobName {
    app: AppId,
    process_type: ProcessType,
    instance: u32,
}

impl JobName {
    /// Human-readable kind, used in error messages.
    pub const KIND: &'static str = "job name";

    /// Builds a job name. `instance` must be at least 1.
    pub fn new(app: AppId, process_type: ProcessType, instance: u32) -> Result<Self, IdError> {
        if instance == 0 {
            return Err(IdError::InvalidInstance("0".to_string()));
        }

        Ok(Self {
            app,
            process_type,
            instance,
        })
    }

    /// Parses a job name of the form `app.type.N`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let mut parts = s.split('.');
        let (Some(app), Some(process_type), Some(instance), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(IdError::format(
                Self::KIND,
                format!("'{s}' is not of the form app.type.N"),
            ));
        };

        // Reject "+1", "01" and friends so formatting is the exact inverse.
        let canonical = instance.chars().all(|c| c.is_ascii_digit()) && !instance.starts_with('0');
        let index: u32 = match instance.parse() {
            Ok(n) if canonical && n > 0 => n,
            _ => return Err(IdError::InvalidInstance(instance.to_string())),
        };

        Self::new(AppId::parse(app)?, ProcessType::parse(process_type)?, index)
    }

    pub fn app(&self) -> &AppId {
        &self.app
    }

    pub fn process_type(&self) -> &ProcessType {
        &self.process_type
    }

    /// The 1-based instance index.
    pub fn instance(&self) -> u32 {
        self.instance
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.app, self.process_type, self.instance)
    }
}

impl FromStr for JobName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for JobName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for JobName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
