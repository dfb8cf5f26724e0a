//! Run triggers.
//!
//! A trigger source (a push webhook, a polling loop) only has to send
//! [`Trigger`]s into a channel; [`PipelineOrchestrator::serve_triggers`]
//! turns each one into a run.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::errors::DeployflowError;
use crate::orchestrator::PipelineOrchestrator;

/// A request to run a pipeline for a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Pipeline to run.
    pub pipeline_id: String,
    /// Commit to ship.
    pub commit_ref: String,
}

impl Trigger {
    /// Creates a trigger.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, commit_ref: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            commit_ref: commit_ref.into(),
        }
    }
}

/// Creates a bounded trigger channel.
#[must_use]
pub fn channel(buffer: usize) -> (mpsc::Sender<Trigger>, mpsc::Receiver<Trigger>) {
    mpsc::channel(buffer)
}

impl PipelineOrchestrator {
    /// Starts a run for every trigger received until the channel closes or
    /// the orchestrator shuts down.
    ///
    /// Triggers for a pipeline that already has an active run are dropped.
    /// Returns the number of runs started.
    pub async fn serve_triggers(&self, mut triggers: mpsc::Receiver<Trigger>) -> usize {
        let mut started = 0;

        while let Some(trigger) = triggers.recv().await {
            if self.is_shutting_down() {
                warn!(pipeline_id = %trigger.pipeline_id, "Shutting down; trigger dropped");
                break;
            }
            match self.start_run(&trigger.pipeline_id, &trigger.commit_ref).await {
                Ok(run) => {
                    started += 1;
                    info!(
                        run_id = %run.run_id,
                        pipeline_id = %trigger.pipeline_id,
                        commit_ref = %trigger.commit_ref,
                        "Trigger started run"
                    );
                }
                Err(DeployflowError::Conflict(e)) => {
                    warn!(
                        pipeline_id = %trigger.pipeline_id,
                        commit_ref = %trigger.commit_ref,
                        reason = %e,
                        "Trigger dropped"
                    );
                }
                Err(e) => {
                    error!(
                        pipeline_id = %trigger.pipeline_id,
                        commit_ref = %trigger.commit_ref,
                        error = %e,
                        "Trigger failed"
                    );
                }
            }
        }

        started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchMode;
    use crate::core::RunStatus;
    use crate::testing::HarnessBuilder;

    #[tokio::test]
    async fn test_serve_triggers_starts_runs_and_drops_conflicts() {
        let harness = HarnessBuilder::new().with_dispatch(DispatchMode::Manual).build();
        let (tx, rx) = channel(8);

        tx.send(Trigger::new("web", "abc123")).await.unwrap();
        tx.send(Trigger::new("web", "def456")).await.unwrap();
        tx.send(Trigger::new("api", "abc123")).await.unwrap();
        tx.send(Trigger::new("bad id!", "abc123")).await.unwrap();
        drop(tx);

        let started = harness.orchestrator.serve_triggers(rx).await;
        assert_eq!(started, 2);

        let web = harness.orchestrator.list_runs("web").await.unwrap();
        assert_eq!(web.len(), 1);
        assert_eq!(web[0].commit_ref, "abc123");
        assert_eq!(web[0].status, RunStatus::Running);
    }

    #[test]
    fn test_trigger_deserialize() {
        let trigger: Trigger =
            serde_json::from_str(r#"{"pipeline_id": "web", "commit_ref": "main"}"#).unwrap();
        assert_eq!(trigger, Trigger::new("web", "main"));
    }
}
