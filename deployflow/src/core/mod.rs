//! Core domain model types for deployflow.
//!
//! This module contains the records the orchestrator persists:
//! - Identifiers for runs, artifacts and rollouts
//! - Run status, stage and outcome enums
//! - Runs, stage results, approval requests and notification events

mod approval;
mod event;
mod ids;
mod run;
mod stage_result;
mod status;

pub use approval::{ApprovalRequest, Resolution};
pub use event::NotificationEvent;
pub use ids::{ArtifactId, DeployHandle, DeploymentId, RunId};
pub use run::{Run, RunTarget};
pub use stage_result::{FailureCause, StageResult};
pub use status::{ApprovalDecision, EventType, RunStatus, StageName, StageOutcome};
