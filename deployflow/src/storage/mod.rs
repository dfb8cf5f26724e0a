//! Durable storage for runs and approval requests.
//!
//! The orchestrator writes every state change through a [`RunStore`] before
//! acting on it, so a restarted process can pick up where it left off.

mod fs;
mod memory;

pub use fs::FsRunStore;
pub use memory::InMemoryRunStore;

use async_trait::async_trait;
use std::io::Write;
use std::path::Path;

use crate::core::{ApprovalRequest, Run, RunId};
use crate::errors::{DeployflowError, Result};

/// Storage backend for run and approval records.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Inserts or replaces a run.
    async fn save_run(&self, run: &Run) -> Result<()>;

    /// Loads a run by id.
    async fn load_run(&self, run_id: RunId) -> Result<Option<Run>>;

    /// Lists all runs, oldest first.
    async fn list_runs(&self) -> Result<Vec<Run>>;

    /// Inserts or replaces an approval request.
    async fn save_approval(&self, request: &ApprovalRequest) -> Result<()>;

    /// Loads the approval request for a run.
    async fn load_approval(&self, run_id: RunId) -> Result<Option<ApprovalRequest>>;
}

/// Runs blocking filesystem work on tokio's blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DeployflowError::storage(format!("filesystem task did not complete: {e}")))?
}

/// Writes `data` to `path` atomically.
///
/// The bytes go to a temporary file in the same directory which is then
/// renamed over `path`, so readers never observe a partial write.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| DeployflowError::storage(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| DeployflowError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("record.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_run_blocking_propagates_errors() {
        let value = run_blocking(|| Ok(7)).await.unwrap();
        assert_eq!(value, 7);

        let err = run_blocking::<(), _>(|| Err(DeployflowError::storage("disk full")))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployflowError::Storage(_)));
    }

    #[tokio::test]
    async fn test_run_blocking_reports_panics_as_storage_errors() {
        let err = run_blocking::<(), _>(|| panic!("disk controller reset"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployflowError::Storage(_)));
    }
}
