//! Recording collaborators and fault-injecting stores for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::artifacts::Artifact;
use crate::backend::{
    BuildProvider, DeployError, DeployRequest, HealthStatus, ProvisioningBackend, SourceProvider,
};
use crate::core::{ApprovalRequest, DeployHandle, Run, RunId, RunStatus, RunTarget, StageResult};
use crate::errors::{DeployflowError, Result};
use crate::executor::StageResultCache;
use crate::storage::{InMemoryRunStore, RunStore};

/// A source provider that returns fixed bytes and counts fetches.
#[derive(Debug)]
pub struct StaticSourceProvider {
    snapshot: Vec<u8>,
    error: Option<String>,
    delay: Option<Duration>,
    fetches: Mutex<Vec<RunTarget>>,
}

impl StaticSourceProvider {
    /// Creates a provider returning `snapshot` for every commit.
    #[must_use]
    pub fn new(snapshot: Vec<u8>) -> Self {
        Self {
            snapshot,
            error: None,
            delay: None,
            fetches: Mutex::new(Vec::new()),
        }
    }

    /// Creates a provider whose fetches fail with `message`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(Vec::new())
        }
    }

    /// Delays every fetch by `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns the number of fetches.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().len()
    }

    /// Returns the fetched targets.
    #[must_use]
    pub fn fetched(&self) -> Vec<RunTarget> {
        self.fetches.lock().clone()
    }
}

impl Default for StaticSourceProvider {
    fn default() -> Self {
        Self::new(b"source snapshot".to_vec())
    }
}

#[async_trait]
impl SourceProvider for StaticSourceProvider {
    async fn fetch(&self, target: &RunTarget) -> anyhow::Result<Vec<u8>> {
        self.fetches.lock().push(target.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.error {
            Some(message) => Err(anyhow::anyhow!("{message}")),
            None => Ok(self.snapshot.clone()),
        }
    }
}

/// A build provider that prefixes its input and counts builds.
#[derive(Debug, Default)]
pub struct RecordingBuildProvider {
    error: Option<String>,
    builds: Mutex<usize>,
}

impl RecordingBuildProvider {
    /// Creates a provider whose builds succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider whose builds fail with `message`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            builds: Mutex::new(0),
        }
    }

    /// Returns the number of builds.
    #[must_use]
    pub fn build_count(&self) -> usize {
        *self.builds.lock()
    }
}

#[async_trait]
impl BuildProvider for RecordingBuildProvider {
    async fn build(&self, _target: &RunTarget, source: &Artifact) -> anyhow::Result<Vec<u8>> {
        *self.builds.lock() += 1;
        if let Some(message) = &self.error {
            anyhow::bail!("{message}");
        }
        let mut bundle = b"bundle:".to_vec();
        bundle.extend_from_slice(&source.bytes);
        Ok(bundle)
    }
}

/// A provisioning backend that records deploys and rollbacks.
#[derive(Debug)]
pub struct RecordingBackend {
    deploy_error: Option<DeployError>,
    health: HealthStatus,
    delay: Option<Duration>,
    deployed: Mutex<Vec<DeployHandle>>,
    rolled_back: Mutex<Vec<DeployHandle>>,
}

impl RecordingBackend {
    /// Creates a backend whose deploys succeed and stay healthy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            deploy_error: None,
            health: HealthStatus::Healthy,
            delay: None,
            deployed: Mutex::new(Vec::new()),
            rolled_back: Mutex::new(Vec::new()),
        }
    }

    /// Makes every deploy fail with `error`.
    #[must_use]
    pub fn with_deploy_error(mut self, error: DeployError) -> Self {
        self.deploy_error = Some(error);
        self
    }

    /// Sets the health reported after a successful deploy.
    #[must_use]
    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    /// Delays every deploy by `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns the number of deploys started.
    #[must_use]
    pub fn deploy_count(&self) -> usize {
        self.deployed.lock().len()
    }

    /// Returns the number of rollbacks requested.
    #[must_use]
    pub fn rollback_count(&self) -> usize {
        self.rolled_back.lock().len()
    }

    /// Returns the handles that were rolled back.
    #[must_use]
    pub fn rolled_back(&self) -> Vec<DeployHandle> {
        self.rolled_back.lock().clone()
    }
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProvisioningBackend for RecordingBackend {
    async fn deploy(&self, request: &DeployRequest) -> std::result::Result<DeployHandle, DeployError> {
        self.deployed.lock().push(request.handle.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.deploy_error {
            Some(error) => Err(error.clone()),
            None => Ok(request.handle.clone()),
        }
    }

    async fn rollback(&self, handle: &DeployHandle) -> anyhow::Result<()> {
        self.rolled_back.lock().push(handle.clone());
        Ok(())
    }

    async fn health_status(&self, _handle: &DeployHandle) -> anyhow::Result<HealthStatus> {
        Ok(self.health)
    }
}

/// A run store and stage result cache over [`InMemoryRunStore`] whose
/// writes can be made to fail.
#[derive(Debug, Default)]
pub struct FaultyRunStore {
    inner: Arc<InMemoryRunStore>,
    cache_writes_fail: AtomicBool,
    approval_save_failures: AtomicUsize,
    run_save_failures: Mutex<HashMap<RunStatus, usize>>,
}

impl FaultyRunStore {
    /// Wraps `inner`; nothing fails until configured.
    #[must_use]
    pub fn new(inner: Arc<InMemoryRunStore>) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Returns the wrapped store.
    #[must_use]
    pub fn inner(&self) -> &Arc<InMemoryRunStore> {
        &self.inner
    }

    /// Makes every later stage result write fail.
    pub fn fail_cache_writes(&self) {
        self.cache_writes_fail.store(true, Ordering::SeqCst);
    }

    /// Makes the next `times` approval saves fail.
    pub fn fail_approval_saves(&self, times: usize) {
        self.approval_save_failures.store(times, Ordering::SeqCst);
    }

    /// Makes the next `times` saves of a run in `status` fail.
    pub fn fail_run_saves(&self, status: RunStatus, times: usize) {
        self.run_save_failures.lock().insert(status, times);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RunStore for FaultyRunStore {
    async fn save_run(&self, run: &Run) -> Result<()> {
        let fail = match self.run_save_failures.lock().get_mut(&run.status) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if fail {
            return Err(DeployflowError::storage(format!(
                "injected failure saving {} run",
                run.status
            )));
        }
        self.inner.save_run(run).await
    }

    async fn load_run(&self, run_id: RunId) -> Result<Option<Run>> {
        self.inner.load_run(run_id).await
    }

    async fn list_runs(&self) -> Result<Vec<Run>> {
        self.inner.list_runs().await
    }

    async fn save_approval(&self, request: &ApprovalRequest) -> Result<()> {
        if Self::take_failure(&self.approval_save_failures) {
            return Err(DeployflowError::storage("injected failure saving approval"));
        }
        self.inner.save_approval(request).await
    }

    async fn load_approval(&self, run_id: RunId) -> Result<Option<ApprovalRequest>> {
        self.inner.load_approval(run_id).await
    }
}

#[async_trait]
impl StageResultCache for FaultyRunStore {
    async fn get_result(&self, key: &str) -> Result<Option<StageResult>> {
        self.inner.get_result(key).await
    }

    async fn put_result(&self, key: &str, result: &StageResult) -> Result<()> {
        if self.cache_writes_fail.load(Ordering::SeqCst) {
            return Err(DeployflowError::storage("injected failure caching stage result"));
        }
        self.inner.put_result(key, result).await
    }
}
