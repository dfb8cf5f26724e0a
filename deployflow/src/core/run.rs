//! The run record and its state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ArtifactId, DeployHandle, RunId, RunStatus, StageName, StageResult};
use crate::errors::InvalidStateError;

/// One execution of a pipeline.
///
/// Status changes go through [`Run::transition`], which refuses to leave a
/// terminal status. History is append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier.
    pub run_id: RunId,
    /// Pipeline this run belongs to.
    pub pipeline_id: String,
    /// Commit being shipped.
    pub commit_ref: String,
    /// Stage currently scheduled, executing or suspended.
    pub current_stage: StageName,
    /// Lifecycle status.
    pub status: RunStatus,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run last changed.
    pub updated_at: DateTime<Utc>,
    /// Completed stages, in execution order.
    #[serde(default)]
    pub stage_history: Vec<StageResult>,
    /// Latest rollout handle, once Deploy has touched the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_handle: Option<DeployHandle>,
}

impl Run {
    /// Creates a pending run positioned at Source.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, commit_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            pipeline_id: pipeline_id.into(),
            commit_ref: commit_ref.into(),
            current_stage: StageName::Source,
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
            stage_history: Vec::new(),
            deploy_handle: None,
        }
    }

    /// Moves the run to `status`.
    ///
    /// Terminal statuses are sinks: leaving one is an error.
    pub fn transition(&mut self, status: RunStatus) -> Result<(), InvalidStateError> {
        if self.status.is_terminal() {
            return Err(InvalidStateError::new(
                format!("move to '{status}'"),
                self.run_id,
                self.status,
            ));
        }
        self.status = status;
        self.touch();
        Ok(())
    }

    /// Positions the run at `stage`.
    pub fn move_to(&mut self, stage: StageName) {
        self.current_stage = stage;
        self.touch();
    }

    /// Appends a stage result to the history.
    pub fn record(&mut self, result: StageResult) {
        if let Some(handle) = &result.deploy_handle {
            self.deploy_handle = Some(handle.clone());
        }
        self.stage_history.push(result);
        self.touch();
    }

    /// Returns the recorded result for `stage`, if any.
    #[must_use]
    pub fn result_for(&self, stage: StageName) -> Option<&StageResult> {
        self.stage_history.iter().find(|r| r.stage_name == stage)
    }

    /// Returns the artifact `stage` should consume.
    #[must_use]
    pub fn input_for(&self, stage: StageName) -> Option<ArtifactId> {
        stage
            .input_stage()
            .and_then(|producer| self.result_for(producer))
            .and_then(|r| r.output_artifact_ref)
    }

    /// Returns the last recorded stage result.
    #[must_use]
    pub fn last_result(&self) -> Option<&StageResult> {
        self.stage_history.last()
    }

    /// Stage names in history order.
    #[must_use]
    pub fn history_stages(&self) -> Vec<StageName> {
        self.stage_history.iter().map(|r| r.stage_name).collect()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// The identity a stage executes on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTarget {
    /// The run.
    pub run_id: RunId,
    /// The run's pipeline.
    pub pipeline_id: String,
    /// The commit being shipped.
    pub commit_ref: String,
}

impl From<&Run> for RunTarget {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id,
            pipeline_id: run.pipeline_id.clone(),
            commit_ref: run.commit_ref.clone(),
        }
    }
}
