//! Run status, stage names and outcome enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stage of the fixed deployment sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageName {
    /// Fetch the commit into an artifact.
    Source,
    /// Build the source artifact.
    Build,
    /// Wait for a human decision.
    Approve,
    /// Roll the build artifact out through the provisioning backend.
    Deploy,
}

impl StageName {
    /// The stage sequence every run follows.
    pub const SEQUENCE: [Self; 4] = [Self::Source, Self::Build, Self::Approve, Self::Deploy];

    /// Returns the stage after this one, or `None` after Deploy.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Source => Some(Self::Build),
            Self::Build => Some(Self::Approve),
            Self::Approve => Some(Self::Deploy),
            Self::Deploy => None,
        }
    }

    /// The stage whose output artifact this stage consumes.
    #[must_use]
    pub const fn input_stage(self) -> Option<Self> {
        match self {
            Self::Source | Self::Approve => None,
            Self::Build => Some(Self::Source),
            Self::Deploy => Some(Self::Build),
        }
    }

    /// Returns true if the stage changes state outside the orchestrator.
    #[must_use]
    pub const fn mutates_external_state(self) -> bool {
        matches!(self, Self::Deploy)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "Source"),
            Self::Build => write!(f, "Build"),
            Self::Approve => write!(f, "Approve"),
            Self::Deploy => write!(f, "Deploy"),
        }
    }
}

/// The lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet started.
    Pending,
    /// A stage is scheduled or executing.
    Running,
    /// Suspended at the Approve stage.
    AwaitingApproval,
    /// Deploy completed.
    Succeeded,
    /// A stage failed.
    Failed,
    /// Stopped by an operator or rejected at approval.
    Stopped,
    /// A rollout was reverted because the deployment went into alarm.
    RolledBack,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::AwaitingApproval => write!(f, "awaiting_approval"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

impl RunStatus {
    /// Returns true if the status is a sink.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Stopped | Self::RolledBack
        )
    }

    /// Returns true if the run will not move without external input.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || matches!(self, Self::AwaitingApproval)
    }

    /// The notification emitted when a run enters this status, if any.
    #[must_use]
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            Self::AwaitingApproval => Some(EventType::ApprovalRequested),
            Self::Succeeded => Some(EventType::Succeeded),
            Self::Failed | Self::RolledBack => Some(EventType::Failed),
            Self::Stopped => Some(EventType::Stopped),
            _ => None,
        }
    }
}

/// The outcome of one stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// The stage completed.
    Success,
    /// The stage failed.
    Failure,
    /// The approval was rejected.
    Rejected,
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// The decision on an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Not decided yet.
    Pending,
    /// Deploy may proceed.
    Approved,
    /// Deploy must not happen.
    Rejected,
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// The kind of notification published for a run.
///
/// Every terminal status notifies; `ApprovalRequested` is the only
/// notification for a run that is still active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// The run reached the approval gate.
    ApprovalRequested,
    /// The run deployed successfully.
    Succeeded,
    /// The run failed or was rolled back.
    Failed,
    /// The run was stopped or rejected.
    Stopped,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApprovalRequested => write!(f, "APPROVAL_REQUESTED"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}
