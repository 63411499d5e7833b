//! Error types for the coordination core
//!
//! Business errors (`NotFound`, `InvalidState`, `TooEarly`, `NotAuthorized`)
//! are returned to callers as-is. `DependencyFailure` and `StoreUnavailable`
//! abort the transition that raised them. Recorder trouble never becomes an
//! `Error` at the lifecycle level; it is reported as a [`Degradation`].
//!
//! [`Degradation`]: crate::lifecycle::Degradation

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error taxonomy shared by the lifecycle and the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    InvalidInput,
    TooEarly,
    NotAuthorized,
    DependencyFailure,
    DependencyDegraded,
    StoreUnavailable,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::InvalidState => "invalid-state",
            ErrorKind::InvalidInput => "invalid-input",
            ErrorKind::TooEarly => "too-early",
            ErrorKind::NotAuthorized => "not-authorized",
            ErrorKind::DependencyFailure => "dependency-failure",
            ErrorKind::DependencyDegraded => "dependency-degraded",
            ErrorKind::StoreUnavailable => "store-unavailable",
        }
    }

    /// Expected business outcomes, as opposed to infrastructure failures
    pub fn is_business(self) -> bool {
        matches!(
            self,
            ErrorKind::NotFound
                | ErrorKind::InvalidState
                | ErrorKind::InvalidInput
                | ErrorKind::TooEarly
                | ErrorKind::NotAuthorized
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected lifecycle transitions
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidState {
    #[error("Course is already running")]
    AlreadyActive,

    #[error("Course is already completed")]
    AlreadyCompleted,

    #[error("Course is not active")]
    NotActive,

    #[error("Cannot join a completed course")]
    CourseCompleted,

    #[error("Course has not been started")]
    NotStarted,
}

impl InvalidState {
    pub fn code(self) -> &'static str {
        match self {
            InvalidState::AlreadyActive => "already-active",
            InvalidState::AlreadyCompleted => "already-completed",
            InvalidState::NotActive => "not-active",
            InvalidState::CourseCompleted => "course-completed",
            InvalidState::NotStarted => "not-started",
        }
    }
}

/// Hard failures of the media router or room registry
#[derive(Error, Debug)]
pub enum DependencyError {
    #[error("Router allocation failed: {0}")]
    RouterAllocation(String),

    #[error("Transport creation failed: {0}")]
    Transport(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// CourseStore failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Duplicate session: {0}")]
    Duplicate(String),

    #[error("Session not found: {0}")]
    Missing(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Recorder and recording coordinator failures
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Recording is already active for session {0}")]
    AlreadyRecording(String),

    #[error("No active recording for session {0}")]
    NoActiveRecording(String),

    #[error("Recording is {actual}, expected {expected}")]
    WrongState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Encoder process error: {0}")]
    Process(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Recording supervisor is gone")]
    SupervisorGone,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(#[from] InvalidState),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Too early: course can start at {earliest}")]
    TooEarly { earliest: DateTime<Utc> },

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Dependency failure: {0}")]
    DependencyFailure(#[from] DependencyError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Missing(id) => Error::NotFound(format!("course {}", id)),
            StoreError::Duplicate(id) => {
                Error::InvalidInput(format!("course {} already exists", id))
            }
            other => Error::StoreUnavailable(other),
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::TooEarly { .. } => ErrorKind::TooEarly,
            Error::NotAuthorized(_) => ErrorKind::NotAuthorized,
            Error::DependencyFailure(_) => ErrorKind::DependencyFailure,
            Error::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
        }
    }

    /// Most specific machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidState(state) => state.code(),
            other => other.kind().as_str(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = Error::from(InvalidState::AlreadyActive);
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.code(), "already-active");

        let err = Error::from(StoreError::Unavailable("offline".into()));
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert!(!err.kind().is_business());

        let err = Error::from(StoreError::Missing("course_1".into()));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_too_early_message_carries_time() {
        let earliest = Utc::now();
        let err = Error::TooEarly { earliest };
        assert!(err.to_string().contains(&earliest.to_string()));
        assert!(err.kind().is_business());
    }
}
