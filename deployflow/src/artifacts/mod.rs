//! Content-addressed artifact storage.
//!
//! Artifacts are immutable byte payloads produced by the Source and Build
//! stages. Every `put` gets a fresh [`ArtifactId`]; payload bytes are
//! addressed by their SHA-256 checksum, so identical outputs share storage.

mod fs;
mod memory;

pub use fs::FsArtifactStore;
pub use memory::InMemoryArtifactStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::{ArtifactId, StageName};
use crate::errors::Result;

/// Computes the hex-encoded SHA-256 checksum of `data`.
#[must_use]
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// An immutable stage output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique artifact identifier.
    pub artifact_id: ArtifactId,
    /// The stage that produced the artifact.
    pub producing_stage: StageName,
    /// Hex SHA-256 of the payload.
    pub checksum: String,
    /// Payload size in bytes.
    pub size: u64,
    /// When the artifact was stored.
    pub created_at: DateTime<Utc>,
    /// The payload. Not part of the metadata record.
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl Artifact {
    /// Builds a new artifact record for `bytes`.
    #[must_use]
    pub fn new(bytes: Vec<u8>, producing_stage: StageName) -> Self {
        Self {
            artifact_id: ArtifactId::new(),
            producing_stage,
            checksum: checksum(&bytes),
            size: bytes.len() as u64,
            created_at: Utc::now(),
            bytes,
        }
    }

    /// Returns true if the payload still matches its checksum.
    #[must_use]
    pub fn verify(&self) -> bool {
        checksum(&self.bytes) == self.checksum
    }
}

/// Storage backend for artifacts.
///
/// Artifacts are never mutated or deleted through this interface; retention
/// is handled outside the orchestrator.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `bytes` and returns the new artifact.
    async fn put(&self, bytes: Vec<u8>, producing_stage: StageName) -> Result<Artifact>;

    /// Loads an artifact with its payload.
    ///
    /// Fails with `NotFound` if the artifact does not exist.
    async fn get(&self, artifact_id: &ArtifactId) -> Result<Artifact>;

    /// Checks whether an artifact exists without loading the payload.
    async fn exists(&self, artifact_id: &ArtifactId) -> Result<bool>;
}
