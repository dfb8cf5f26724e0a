//! Approval requests for the manual gate before Deploy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ApprovalDecision, RunId};
use crate::errors::{ConflictError, DeployflowError};

/// What happened when a decision was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The decision was recorded.
    Recorded,
    /// The same decision had already been recorded.
    Unchanged,
}

/// A request for a human decision on a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// The run waiting on this request.
    pub run_id: RunId,
    /// When the request was opened.
    pub requested_at: DateTime<Utc>,
    /// Current decision.
    pub decision: ApprovalDecision,
    /// Who decided, once decided.
    pub decided_by: Option<String>,
    /// When the decision was recorded.
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// Opens a pending request for `run_id`.
    #[must_use]
    pub fn open(run_id: RunId) -> Self {
        Self {
            run_id,
            requested_at: Utc::now(),
            decision: ApprovalDecision::Pending,
            decided_by: None,
            decided_at: None,
        }
    }

    /// Returns true while no decision has been recorded.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.decision == ApprovalDecision::Pending
    }

    /// Records `decision`, exactly once.
    ///
    /// Repeating the recorded decision is a no-op; contradicting it is a
    /// conflict. `Pending` is not a decision.
    pub fn resolve(
        &mut self,
        decision: ApprovalDecision,
        decided_by: impl Into<String>,
    ) -> Result<Resolution, DeployflowError> {
        if decision == ApprovalDecision::Pending {
            return Err(DeployflowError::validation(
                "approval decision must be approved or rejected",
            ));
        }

        match self.decision {
            ApprovalDecision::Pending => {
                self.decision = decision;
                self.decided_by = Some(decided_by.into());
                self.decided_at = Some(Utc::now());
                Ok(Resolution::Recorded)
            }
            recorded if recorded == decision => Ok(Resolution::Unchanged),
            recorded => Err(ConflictError::new(
                format!("approval for run {}", self.run_id),
                format!("already {recorded}, cannot change to {decision}"),
            )
            .into()),
        }
    }
}
