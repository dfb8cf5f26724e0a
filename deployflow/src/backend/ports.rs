//! Source and build collaborators.
//!
//! Stages only receive the collaborator they need: Source talks to version
//! control, Build talks to the build system.

use async_trait::async_trait;

use crate::artifacts::Artifact;
use crate::core::RunTarget;

/// Fetches the code for a commit.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Returns a snapshot of the target's commit as bytes.
    async fn fetch(&self, target: &RunTarget) -> anyhow::Result<Vec<u8>>;
}

/// Builds a source snapshot into a deployable bundle.
#[async_trait]
pub trait BuildProvider: Send + Sync {
    /// Builds `source` and returns the bundle bytes.
    async fn build(&self, target: &RunTarget, source: &Artifact) -> anyhow::Result<Vec<u8>>;
}
