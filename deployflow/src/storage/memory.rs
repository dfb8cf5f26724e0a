//! In-memory run store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::RunStore;
use crate::core::{ApprovalRequest, Run, RunId, StageResult};
use crate::errors::Result;
use crate::executor::StageResultCache;

/// Run store backed by maps. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, Run>>,
    approvals: RwLock<HashMap<RunId, ApprovalRequest>>,
    stage_results: RwLock<HashMap<String, StageResult>>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save_run(&self, run: &Run) -> Result<()> {
        self.runs.write().insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: RunId) -> Result<Option<Run>> {
        Ok(self.runs.read().get(&run_id).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self.runs.read().values().cloned().collect();
        runs.sort_by_key(|r| (r.created_at, r.run_id));
        Ok(runs)
    }

    async fn save_approval(&self, request: &ApprovalRequest) -> Result<()> {
        self.approvals.write().insert(request.run_id, request.clone());
        Ok(())
    }

    async fn load_approval(&self, run_id: RunId) -> Result<Option<ApprovalRequest>> {
        Ok(self.approvals.read().get(&run_id).cloned())
    }
}

#[async_trait]
impl StageResultCache for InMemoryRunStore {
    async fn get_result(&self, key: &str) -> Result<Option<StageResult>> {
        Ok(self.stage_results.read().get(key).cloned())
    }

    async fn put_result(&self, key: &str, result: &StageResult) -> Result<()> {
        self.stage_results
            .write()
            .insert(key.to_string(), result.clone());
        Ok(())
    }
}
