//! An orchestrator wired to in-memory stores and recording collaborators.

use std::sync::Arc;
use std::time::Duration;

use super::mocks::{FaultyRunStore, RecordingBackend, RecordingBuildProvider, StaticSourceProvider};
use crate::artifacts::InMemoryArtifactStore;
use crate::backend::ProvisioningBackend;
use crate::config::{DispatchMode, ExecutorConfig};
use crate::core::{ApprovalDecision, Run, RunId, RunStatus};
use crate::errors::{InvalidStateError, Result};
use crate::executor::{StageExecutor, StageResultCache};
use crate::notifications::CollectingNotificationSink;
use crate::orchestrator::PipelineOrchestrator;
use crate::storage::{InMemoryRunStore, RunStore};

/// How long harness helpers wait for a run to settle.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder for a [`TestHarness`].
#[derive(Default)]
pub struct HarnessBuilder {
    source: Option<StaticSourceProvider>,
    build: Option<RecordingBuildProvider>,
    backend: Option<RecordingBackend>,
    custom_backend: Option<Arc<dyn ProvisioningBackend>>,
    store: Option<Arc<InMemoryRunStore>>,
    faulty: Option<Arc<FaultyRunStore>>,
    artifacts: Option<Arc<InMemoryArtifactStore>>,
    config: ExecutorConfig,
    dispatch: DispatchMode,
}

impl HarnessBuilder {
    /// Creates a builder with succeeding collaborators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `source` as the source provider.
    #[must_use]
    pub fn with_source(mut self, source: StaticSourceProvider) -> Self {
        self.source = Some(source);
        self
    }

    /// Uses `build` as the build provider.
    #[must_use]
    pub fn with_build(mut self, build: RecordingBuildProvider) -> Self {
        self.build = Some(build);
        self
    }

    /// Uses `backend` as the provisioning backend.
    #[must_use]
    pub fn with_backend(mut self, backend: RecordingBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Uses an arbitrary provisioning backend, such as a mock.
    ///
    /// The harness's [`RecordingBackend`] is then not called.
    #[must_use]
    pub fn with_custom_backend(mut self, backend: Arc<dyn ProvisioningBackend>) -> Self {
        self.custom_backend = Some(backend);
        self
    }

    /// Shares a run store, e.g. to simulate a restart.
    #[must_use]
    pub fn with_store(mut self, store: Arc<InMemoryRunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Routes run and stage result writes through `store`.
    ///
    /// The harness's `store` is then the store `faulty` wraps.
    #[must_use]
    pub fn with_faulty_store(mut self, faulty: Arc<FaultyRunStore>) -> Self {
        self.faulty = Some(faulty);
        self
    }

    /// Shares an artifact store.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Arc<InMemoryArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Sets the executor configuration.
    #[must_use]
    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the dispatch mode.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Builds the harness.
    #[must_use]
    pub fn build(self) -> TestHarness {
        let store: Arc<InMemoryRunStore>;
        let run_store: Arc<dyn RunStore>;
        let cache: Arc<dyn StageResultCache>;
        if let Some(faulty) = self.faulty {
            store = faulty.inner().clone();
            run_store = faulty.clone();
            cache = faulty;
        } else {
            store = self.store.unwrap_or_default();
            run_store = store.clone();
            cache = store.clone();
        }
        let artifacts = self.artifacts.unwrap_or_default();
        let source = Arc::new(self.source.unwrap_or_default());
        let build = Arc::new(self.build.unwrap_or_default());
        let backend = Arc::new(self.backend.unwrap_or_default());
        let sink = Arc::new(CollectingNotificationSink::new());

        let provisioning: Arc<dyn ProvisioningBackend> = match self.custom_backend {
            Some(custom) => custom,
            None => backend.clone(),
        };

        let executor = StageExecutor::new(
            artifacts.clone(),
            source.clone(),
            build.clone(),
            provisioning,
            cache,
        )
        .with_config(self.config);

        let orchestrator = PipelineOrchestrator::from_parts(
            run_store,
            Arc::new(executor),
            sink.clone(),
            self.dispatch,
        );

        TestHarness {
            orchestrator,
            store,
            artifacts,
            source,
            build,
            backend,
            sink,
        }
    }
}

/// A wired orchestrator plus handles on every collaborator.
pub struct TestHarness {
    /// The orchestrator under test.
    pub orchestrator: PipelineOrchestrator,
    /// The run store.
    pub store: Arc<InMemoryRunStore>,
    /// The artifact store.
    pub artifacts: Arc<InMemoryArtifactStore>,
    /// The source provider.
    pub source: Arc<StaticSourceProvider>,
    /// The build provider.
    pub build: Arc<RecordingBuildProvider>,
    /// The provisioning backend.
    pub backend: Arc<RecordingBackend>,
    /// Notifications published by the orchestrator.
    pub sink: Arc<CollectingNotificationSink>,
}

impl TestHarness {
    /// Creates a harness with succeeding collaborators.
    #[must_use]
    pub fn new() -> Self {
        HarnessBuilder::new().build()
    }

    /// Waits for a run to settle, failing after [`SETTLE_TIMEOUT`].
    pub async fn settle(&self, run_id: RunId) -> Result<Run> {
        tokio::time::timeout(SETTLE_TIMEOUT, self.orchestrator.wait_for_settled(run_id))
            .await
            .map_err(|_| InvalidStateError::new("settle", run_id, "timed out"))?
    }

    /// Starts a run and waits until it reaches the approval gate or ends.
    pub async fn start_and_settle(&self, pipeline_id: &str, commit_ref: &str) -> Result<Run> {
        let run = self.orchestrator.start_run(pipeline_id, commit_ref).await?;
        self.settle(run.run_id).await
    }

    /// Runs a pipeline end to end, approving the deploy.
    pub async fn run_approved(&self, pipeline_id: &str, commit_ref: &str) -> Result<Run> {
        let run = self.start_and_settle(pipeline_id, commit_ref).await?;
        if run.status != RunStatus::AwaitingApproval {
            return Ok(run);
        }
        self.orchestrator
            .resolve_approval(run.run_id, ApprovalDecision::Approved, "release-manager")
            .await?;
        self.settle(run.run_id).await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
