//! In-memory artifact store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{Artifact, ArtifactStore};
use crate::core::{ArtifactId, StageName};
use crate::errors::{NotFoundError, ResourceKind, Result};

/// Artifact store backed by a map. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    artifacts: RwLock<HashMap<ArtifactId, Artifact>>,
}

impl InMemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.read().len()
    }

    /// Returns true if nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.read().is_empty()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, bytes: Vec<u8>, producing_stage: StageName) -> Result<Artifact> {
        let artifact = Artifact::new(bytes, producing_stage);
        self.artifacts
            .write()
            .insert(artifact.artifact_id, artifact.clone());
        Ok(artifact)
    }

    async fn get(&self, artifact_id: &ArtifactId) -> Result<Artifact> {
        self.artifacts
            .read()
            .get(artifact_id)
            .cloned()
            .ok_or_else(|| NotFoundError::new(ResourceKind::Artifact, artifact_id).into())
    }

    async fn exists(&self, artifact_id: &ArtifactId) -> Result<bool> {
        Ok(self.artifacts.read().contains_key(artifact_id))
    }
}
