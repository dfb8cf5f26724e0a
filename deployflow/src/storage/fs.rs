//! Filesystem-backed run store.
//!
//! File I/O runs on tokio's blocking pool.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{run_blocking, write_atomic, RunStore};
use crate::core::{ApprovalRequest, Run, RunId, StageResult};
use crate::errors::Result;
use crate::executor::StageResultCache;

/// Run store persisted as one JSON document per record.
///
/// Layout under the root directory:
/// - `runs/<run_id>.json`
/// - `approvals/<run_id>.json`
/// - `stage_results/<idempotency key>.json`
#[derive(Debug, Clone)]
pub struct FsRunStore {
    runs_dir: PathBuf,
    approvals_dir: PathBuf,
    results_dir: PathBuf,
}

impl FsRunStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let store = Self {
            runs_dir: root.join("runs"),
            approvals_dir: root.join("approvals"),
            results_dir: root.join("stage_results"),
        };
        fs::create_dir_all(&store.runs_dir)?;
        fs::create_dir_all(&store.approvals_dir)?;
        fs::create_dir_all(&store.results_dir)?;
        Ok(store)
    }

    fn run_path(&self, run_id: RunId) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.json"))
    }

    fn approval_path(&self, run_id: RunId) -> PathBuf {
        self.approvals_dir.join(format!("{run_id}.json"))
    }

    fn result_path(&self, key: &str) -> PathBuf {
        self.results_dir.join(format!("{key}.json"))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_runs(dir: &Path) -> Result<Vec<Run>> {
    let mut runs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(run) = read_json::<Run>(&path)? {
            runs.push(run);
        }
    }
    runs.sort_by_key(|r| (r.created_at, r.run_id));
    Ok(runs)
}

#[async_trait]
impl RunStore for FsRunStore {
    async fn save_run(&self, run: &Run) -> Result<()> {
        let json = serde_json::to_vec_pretty(run)?;
        let path = self.run_path(run.run_id);
        run_blocking(move || write_atomic(&path, &json)).await
    }

    async fn load_run(&self, run_id: RunId) -> Result<Option<Run>> {
        let path = self.run_path(run_id);
        run_blocking(move || read_json(&path)).await
    }

    async fn list_runs(&self) -> Result<Vec<Run>> {
        let dir = self.runs_dir.clone();
        run_blocking(move || read_runs(&dir)).await
    }

    async fn save_approval(&self, request: &ApprovalRequest) -> Result<()> {
        let json = serde_json::to_vec_pretty(request)?;
        let path = self.approval_path(request.run_id);
        run_blocking(move || write_atomic(&path, &json)).await
    }

    async fn load_approval(&self, run_id: RunId) -> Result<Option<ApprovalRequest>> {
        let path = self.approval_path(run_id);
        run_blocking(move || read_json(&path)).await
    }
}

#[async_trait]
impl StageResultCache for FsRunStore {
    async fn get_result(&self, key: &str) -> Result<Option<StageResult>> {
        let path = self.result_path(key);
        run_blocking(move || read_json(&path)).await
    }

    async fn put_result(&self, key: &str, result: &StageResult) -> Result<()> {
        let json = serde_json::to_vec_pretty(result)?;
        let path = self.result_path(key);
        run_blocking(move || write_atomic(&path, &json)).await
    }
}
