//! Notification events published when a run reaches the approval gate or
//! finishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EventType, Run, RunId};

/// A pipeline state change delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Unique event identifier, stable across redeliveries.
    pub event_id: Uuid,
    /// The run that changed state.
    pub run_id: RunId,
    /// The run's pipeline.
    pub pipeline_id: String,
    /// What happened.
    pub event_type: EventType,
    /// Event details.
    pub payload: serde_json::Value,
    /// When the event was emitted.
    pub emitted_at: DateTime<Utc>,
}

impl NotificationEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(
        run_id: RunId,
        pipeline_id: impl Into<String>,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            run_id,
            pipeline_id: pipeline_id.into(),
            event_type,
            payload,
            emitted_at: Utc::now(),
        }
    }

    /// Builds the event for a run that just entered its current status.
    ///
    /// Returns `None` if the status does not notify.
    #[must_use]
    pub fn for_run(run: &Run) -> Option<Self> {
        let event_type = run.status.event_type()?;
        let last = run.last_result();

        let payload = serde_json::json!({
            "status": run.status,
            "commit_ref": run.commit_ref,
            "stage": run.current_stage,
            "outcome": last.map(|r| r.outcome),
            "failure": last.and_then(|r| r.failure.as_ref()).map(ToString::to_string),
            "stages_completed": run.stage_history.len(),
            "deployment_id": run.deploy_handle.as_ref().map(|h| h.deployment_id.to_string()),
        });

        Some(Self::new(run.run_id, run.pipeline_id.clone(), event_type, payload))
    }
}
