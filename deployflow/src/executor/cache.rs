//! Idempotency cache for stage executions.
//!
//! A stage that already produced a terminal result for a run is never
//! executed again; the cached result is returned instead.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::core::{RunId, StageName, StageResult};
use crate::errors::Result;

/// Storage for terminal stage results keyed by run and stage.
#[async_trait]
pub trait StageResultCache: Send + Sync {
    /// Gets a cached result by key.
    async fn get_result(&self, key: &str) -> Result<Option<StageResult>>;

    /// Stores a result under key.
    async fn put_result(&self, key: &str, result: &StageResult) -> Result<()>;
}

/// Generates the idempotency key for a `(run, stage)` pair.
#[must_use]
pub fn idempotency_key(run_id: RunId, stage: StageName) -> String {
    let combined = format!("{run_id}:{stage}");
    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    let result = hasher.finalize();
    format!("idem-{}", hex::encode(&result[..16]))
}
