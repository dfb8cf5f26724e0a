//! Stage results appended to a run's history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{ArtifactId, DeployHandle, StageName, StageOutcome};

/// Why a stage failed.
///
/// Attached for observability; the orchestrator only branches on the
/// outcome, except to tell an alarm rollback apart from a failed rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// A source, build or backend collaborator returned an error.
    Collaborator {
        /// The collaborator's error message.
        message: String,
    },
    /// The stage exceeded its time budget.
    Timeout {
        /// The budget in milliseconds.
        after_ms: u64,
    },
    /// The stage input artifact could not be loaded.
    MissingArtifact {
        /// The artifact that was referenced.
        artifact_id: Option<ArtifactId>,
    },
    /// The backend reported the rollout as failed.
    DeploymentFailed {
        /// The backend's message.
        message: String,
    },
    /// The backend reported the rollout as stopped.
    DeploymentStopped {
        /// The backend's message.
        message: String,
    },
    /// The rollout finished but its health check was in alarm.
    DeploymentInAlarm,
    /// Recording the stage result failed.
    Storage {
        /// The storage error message.
        message: String,
    },
}

impl FailureCause {
    /// Creates a collaborator failure.
    #[must_use]
    pub fn collaborator(message: impl Into<String>) -> Self {
        Self::Collaborator {
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collaborator { message } => write!(f, "collaborator error: {message}"),
            Self::Timeout { after_ms } => write!(f, "timed out after {after_ms}ms"),
            Self::MissingArtifact { artifact_id: Some(id) } => {
                write!(f, "input artifact {id} is missing")
            }
            Self::MissingArtifact { artifact_id: None } => write!(f, "no input artifact"),
            Self::DeploymentFailed { message } => write!(f, "deployment failed: {message}"),
            Self::DeploymentStopped { message } => write!(f, "deployment stopped: {message}"),
            Self::DeploymentInAlarm => write!(f, "deployment in alarm"),
            Self::Storage { message } => write!(f, "storage error: {message}"),
        }
    }
}

/// Outcome of one stage execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: StageName,
    /// Artifact consumed by the stage.
    pub input_artifact_ref: Option<ArtifactId>,
    /// Artifact produced by the stage.
    pub output_artifact_ref: Option<ArtifactId>,
    /// Stage outcome.
    pub outcome: StageOutcome,
    /// When the stage started.
    pub started_at: DateTime<Utc>,
    /// When the stage ended.
    pub ended_at: DateTime<Utc>,
    /// Failure cause if the stage failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCause>,
    /// Rollout handle if the stage touched the provisioning backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_handle: Option<DeployHandle>,
    /// Whether a rollback was already requested for this stage.
    #[serde(default)]
    pub rollback_attempted: bool,
}

impl StageResult {
    /// Creates a successful stage result ending now.
    #[must_use]
    pub fn success(
        stage_name: StageName,
        input_artifact_ref: Option<ArtifactId>,
        output_artifact_ref: Option<ArtifactId>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            stage_name,
            input_artifact_ref,
            output_artifact_ref,
            outcome: StageOutcome::Success,
            started_at,
            ended_at: Utc::now(),
            failure: None,
            deploy_handle: None,
            rollback_attempted: false,
        }
    }

    /// Creates a failed stage result ending now.
    #[must_use]
    pub fn failure(
        stage_name: StageName,
        input_artifact_ref: Option<ArtifactId>,
        cause: FailureCause,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            stage_name,
            input_artifact_ref,
            output_artifact_ref: None,
            outcome: StageOutcome::Failure,
            started_at,
            ended_at: Utc::now(),
            failure: Some(cause),
            deploy_handle: None,
            rollback_attempted: false,
        }
    }

    /// Creates the Approve result for a decided approval request.
    #[must_use]
    pub fn approval(approved: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            stage_name: StageName::Approve,
            input_artifact_ref: None,
            output_artifact_ref: None,
            outcome: if approved {
                StageOutcome::Success
            } else {
                StageOutcome::Rejected
            },
            started_at,
            ended_at: Utc::now(),
            failure: None,
            deploy_handle: None,
            rollback_attempted: false,
        }
    }

    /// Attaches the rollout handle.
    #[must_use]
    pub fn with_deploy_handle(mut self, handle: DeployHandle) -> Self {
        self.deploy_handle = Some(handle);
        self
    }

    /// Marks that a rollback has already been requested.
    #[must_use]
    pub fn with_rollback_attempted(mut self) -> Self {
        self.rollback_attempted = true;
        self
    }

    /// Returns the duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == StageOutcome::Success
    }

    /// Returns true if the stage failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.outcome == StageOutcome::Failure
    }

    /// Returns true if the rollout must still be reverted.
    #[must_use]
    pub fn needs_rollback(&self) -> bool {
        self.is_failure() && self.deploy_handle.is_some() && !self.rollback_attempted
    }
}
