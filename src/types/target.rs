// ABOUTME: Dyno names and the resolved remote-access target.
// ABOUTME: A target pairs an app with one of its running dynos.

use super::app_name::{AppName, AppNameError};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DynoNameError {
    #[error("dyno name cannot be empty")]
    Empty,

    #[error("dyno name exceeds maximum length of 64 characters")]
    TooLong,

    #[error("invalid character in dyno name: '{0}'")]
    InvalidChar(char),
}

/// Name of a single dyno, e.g. `web.1` or `run.4821`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DynoName(String);

impl DynoName {
    pub fn new(value: &str) -> Result<Self, DynoNameError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DynoNameError::Empty);
        }

        if trimmed.len() > 64 {
            return Err(DynoNameError::TooLong);
        }

        // Valid characters: alphanumeric, hyphen, underscore, dot
        for c in trimmed.chars() {
            if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.' {
                return Err(DynoNameError::InvalidChar(c));
            }
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The primary web dyno.
impl Default for DynoName {
    fn default() -> Self {
        Self("web.1".to_string())
    }
}

impl fmt::Display for DynoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error(transparent)]
    App(#[from] AppNameError),

    #[error(transparent)]
    Dyno(#[from] DynoNameError),
}

/// The workload instance a remote-access invocation connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    app: AppName,
    dyno: DynoName,
}

impl Target {
    pub fn new(app: AppName, dyno: DynoName) -> Self {
        Self { app, dyno }
    }

    /// Validate raw app and dyno names in one step.
    pub fn parse(app: &str, dyno: &str) -> Result<Self, TargetError> {
        Ok(Self {
            app: AppName::new(app)?,
            dyno: DynoName::new(dyno)?,
        })
    }

    pub fn app(&self) -> &AppName {
        &self.app
    }

    pub fn dyno(&self) -> &DynoName {
        &self.dyno
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.dyno, self.app)
    }
}

impl From<TargetError> for crate::error::Error {
    fn from(err: TargetError) -> Self {
        crate::error::Error::InvalidTarget(err.to_string())
    }
}
