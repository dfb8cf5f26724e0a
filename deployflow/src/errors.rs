//! Error types for the deployflow orchestrator.
//!
//! The public taxonomy covers conflicts, missing records,
//! illegal state transitions and stage failures. Everything else is an
//! infrastructure error (storage, serialization, configuration).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::core::{FailureCause, RunId, StageName};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DeployflowError>;

/// The main error type for deployflow operations.
#[derive(Debug, Error)]
pub enum DeployflowError {
    /// An invariant would be violated (concurrent run, conflicting decision).
    #[error("{0}")]
    Conflict(#[from] ConflictError),

    /// A run, artifact or approval does not exist.
    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    /// The operation is illegal in the current state.
    #[error("{0}")]
    InvalidState(#[from] InvalidStateError),

    /// A collaborator reported a stage failure.
    #[error("{0}")]
    StageFailure(#[from] StageFailureError),

    /// Input validation failed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The durable store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DeployflowError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Returns true for errors the caller must resolve by re-reading state.
    ///
    /// These are never retried automatically.
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::InvalidState(_) | Self::Validation(_))
    }

    /// Stable machine-readable error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "Conflict",
            Self::NotFound(_) => "NotFound",
            Self::InvalidState(_) => "InvalidState",
            Self::StageFailure(_) => "StageFailure",
            Self::Validation(_) => "Validation",
            Self::Storage(_) => "Storage",
            Self::Serialization(_) => "Serialization",
            Self::Io(_) => "Io",
            Self::Config(_) => "Config",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        if let Self::StageFailure(failure) = self {
            map.insert("run_id".to_string(), serde_json::json!(failure.run_id.to_string()));
            map.insert("stage".to_string(), serde_json::json!(failure.stage.to_string()));
            map.insert(
                "cause".to_string(),
                serde_json::to_value(&failure.cause).unwrap_or(serde_json::Value::Null),
            );
        }

        map
    }
}

/// Error raised when an operation would break a uniqueness invariant.
#[derive(Debug, Clone, Error)]
#[error("Conflict on {subject}: {message}")]
pub struct ConflictError {
    /// What the conflict is about (a pipeline id, an approval).
    pub subject: String,
    /// Additional message.
    pub message: String,
}

impl ConflictError {
    /// Creates a new conflict error.
    #[must_use]
    pub fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// The kind of record that was not found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A pipeline run.
    Run,
    /// A stored artifact.
    Artifact,
    /// An approval request.
    Approval,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::Artifact => write!(f, "artifact"),
            Self::Approval => write!(f, "approval"),
        }
    }
}

/// Error raised when a record does not exist.
#[derive(Debug, Clone, Error)]
#[error("{kind} not found: {id}")]
pub struct NotFoundError {
    /// The kind of record.
    pub kind: ResourceKind,
    /// The identifier looked up.
    pub id: String,
}

impl NotFoundError {
    /// Creates a new not-found error.
    #[must_use]
    pub fn new(kind: ResourceKind, id: impl ToString) -> Self {
        Self {
            kind,
            id: id.to_string(),
        }
    }

    /// Not-found error for a run.
    #[must_use]
    pub fn run(run_id: RunId) -> Self {
        Self::new(ResourceKind::Run, run_id)
    }
}

/// Error raised when an operation is illegal in the current state.
#[derive(Debug, Clone, Error)]
#[error("Cannot {operation} {subject} in state '{state}'")]
pub struct InvalidStateError {
    /// The attempted operation.
    pub operation: String,
    /// The subject of the operation (usually a run id).
    pub subject: String,
    /// The state the subject was in.
    pub state: String,
}

impl InvalidStateError {
    /// Creates a new invalid state error.
    #[must_use]
    pub fn new(
        operation: impl Into<String>,
        subject: impl ToString,
        state: impl ToString,
    ) -> Self {
        Self {
            operation: operation.into(),
            subject: subject.to_string(),
            state: state.to_string(),
        }
    }
}

/// Error describing a failed stage of a run.
#[derive(Debug, Clone, Error)]
#[error("Stage {stage} of run {run_id} failed: {cause}")]
pub struct StageFailureError {
    /// The run that failed.
    pub run_id: RunId,
    /// The stage that failed.
    pub stage: StageName,
    /// What went wrong.
    pub cause: FailureCause,
}

impl StageFailureError {
    /// Creates a new stage failure error.
    #[must_use]
    pub fn new(run_id: RunId, stage: StageName, cause: FailureCause) -> Self {
        Self { run_id, stage, cause }
    }
}
