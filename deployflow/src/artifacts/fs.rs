//! Filesystem-backed artifact store.
//!
//! File I/O runs on tokio's blocking pool.

use async_trait::async_trait;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{Artifact, ArtifactStore};
use crate::core::{ArtifactId, StageName};
use crate::errors::{DeployflowError, NotFoundError, ResourceKind, Result};
use crate::storage::{run_blocking, write_atomic};

/// Artifact store persisted under a root directory.
///
/// Layout:
/// - `<root>/blobs/<first 2 hex chars>/<remaining hex chars>` holds payloads
///   keyed by checksum, so identical payloads are written once.
/// - `<root>/meta/<artifact_id>.json` holds the artifact record.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    blobs_dir: PathBuf,
    meta_dir: PathBuf,
}

impl FsArtifactStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let blobs_dir = root.join("blobs");
        let meta_dir = root.join("meta");
        fs::create_dir_all(&blobs_dir)?;
        fs::create_dir_all(&meta_dir)?;
        Ok(Self { blobs_dir, meta_dir })
    }

    /// Fails with `Storage` unless `checksum` is a SHA-256 hex digest.
    fn blob_path(&self, checksum: &str) -> Result<PathBuf> {
        if checksum.len() != 64 || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DeployflowError::storage(format!(
                "malformed artifact checksum '{checksum}'"
            )));
        }
        Ok(self.blobs_dir.join(&checksum[..2]).join(&checksum[2..]))
    }

    fn meta_path(&self, artifact_id: &ArtifactId) -> PathBuf {
        self.meta_dir.join(format!("{artifact_id}.json"))
    }

    fn write(&self, artifact: &Artifact) -> Result<()> {
        let blob = self.blob_path(&artifact.checksum)?;
        if !blob.exists() {
            write_atomic(&blob, &artifact.bytes)?;
        }
        let meta = serde_json::to_vec_pretty(artifact)?;
        write_atomic(&self.meta_path(&artifact.artifact_id), &meta)
    }

    fn load(&self, artifact_id: &ArtifactId) -> Result<Artifact> {
        let meta = fs::read(self.meta_path(artifact_id)).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                NotFoundError::new(ResourceKind::Artifact, artifact_id).into()
            } else {
                DeployflowError::Io(e)
            }
        })?;

        let mut artifact: Artifact = serde_json::from_slice(&meta)?;
        artifact.bytes = fs::read(self.blob_path(&artifact.checksum)?)?;

        if !artifact.verify() {
            return Err(DeployflowError::storage(format!(
                "artifact {artifact_id} payload does not match checksum {}",
                artifact.checksum
            )));
        }
        Ok(artifact)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, bytes: Vec<u8>, producing_stage: StageName) -> Result<Artifact> {
        let store = self.clone();
        let artifact = run_blocking(move || {
            let artifact = Artifact::new(bytes, producing_stage);
            store.write(&artifact)?;
            Ok(artifact)
        })
        .await?;

        tracing::debug!(
            artifact_id = %artifact.artifact_id,
            checksum = %artifact.checksum,
            size = artifact.size,
            "Stored artifact"
        );
        Ok(artifact)
    }

    async fn get(&self, artifact_id: &ArtifactId) -> Result<Artifact> {
        let store = self.clone();
        let artifact_id = *artifact_id;
        run_blocking(move || store.load(&artifact_id)).await
    }

    async fn exists(&self, artifact_id: &ArtifactId) -> Result<bool> {
        let path = self.meta_path(artifact_id);
        run_blocking(move || Ok(path.exists())).await
    }
}
