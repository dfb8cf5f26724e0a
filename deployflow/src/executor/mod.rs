//! Stage execution.
//!
//! The [`StageExecutor`] runs one stage of a run against its collaborators
//! and turns the outcome into a [`StageResult`]. Collaborator errors and
//! timeouts never escape as `Err`; they become `Failure` results with a
//! [`FailureCause`]. Only storage failures while reading the cache are
//! returned as errors; a result that cannot be cached is still returned.

mod cache;

pub use cache::{idempotency_key, StageResultCache};

use chrono::Utc;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::artifacts::{Artifact, ArtifactStore};
use crate::backend::{
    BuildProvider, DeployError, DeployRequest, HealthStatus, ProvisioningBackend, SourceProvider,
};
use crate::config::ExecutorConfig;
use crate::core::{ArtifactId, DeployHandle, FailureCause, RunTarget, StageName, StageResult};
use crate::errors::{DeployflowError, InvalidStateError, Result};
use crate::observability::SpanTimer;

/// Runs individual stages, at most once per `(run, stage)`.
pub struct StageExecutor {
    artifacts: Arc<dyn ArtifactStore>,
    source: Arc<dyn SourceProvider>,
    build: Arc<dyn BuildProvider>,
    backend: Arc<dyn ProvisioningBackend>,
    cache: Arc<dyn StageResultCache>,
    config: ExecutorConfig,
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl StageExecutor {
    /// Creates an executor over the given collaborators.
    #[must_use]
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        source: Arc<dyn SourceProvider>,
        build: Arc<dyn BuildProvider>,
        backend: Arc<dyn ProvisioningBackend>,
        cache: Arc<dyn StageResultCache>,
    ) -> Self {
        Self {
            artifacts,
            source,
            build,
            backend,
            cache,
            config: ExecutorConfig::default(),
            in_flight: DashMap::new(),
        }
    }

    /// Sets the executor configuration.
    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the executor configuration.
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes `stage` for `target`.
    ///
    /// A stage that already has a recorded result for this run returns that
    /// result without touching any collaborator. Concurrent calls for the
    /// same pair wait for the first one and then read its result.
    ///
    /// Approve is not executable: it is resolved by a human decision.
    pub async fn execute(
        &self,
        stage: StageName,
        target: &RunTarget,
        input: Option<ArtifactId>,
    ) -> Result<StageResult> {
        let key = idempotency_key(target.run_id, stage);
        if let Some(cached) = self.cache.get_result(&key).await? {
            debug!(run_id = %target.run_id, stage = %stage, "Returning cached stage result");
            return Ok(cached);
        }

        let lock = Arc::clone(self.in_flight.entry(key.clone()).or_default().value());
        let result = {
            let _guard = lock.lock().await;
            self.execute_once(stage, target, input, &key).await
        };
        drop(lock);
        self.in_flight.remove_if(&key, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn execute_once(
        &self,
        stage: StageName,
        target: &RunTarget,
        input: Option<ArtifactId>,
        key: &str,
    ) -> Result<StageResult> {
        if let Some(cached) = self.cache.get_result(key).await? {
            return Ok(cached);
        }

        let timer = SpanTimer::start();
        info!(
            run_id = %target.run_id,
            pipeline_id = %target.pipeline_id,
            stage = %stage,
            "Executing stage"
        );

        let result = match stage {
            StageName::Source => self.run_source(target).await,
            StageName::Build => self.run_build(target, input).await,
            StageName::Deploy => self.run_deploy(target, input).await,
            StageName::Approve => {
                return Err(InvalidStateError::new(
                    "execute the Approve stage of",
                    target.run_id,
                    "awaiting a human decision",
                )
                .into())
            }
        };

        let elapsed_ms = timer.elapsed_ms();
        match &result.failure {
            None => info!(
                run_id = %target.run_id,
                stage = %stage,
                outcome = %result.outcome,
                elapsed_ms,
                "Stage completed"
            ),
            Some(cause) => warn!(
                run_id = %target.run_id,
                stage = %stage,
                outcome = %result.outcome,
                cause = %cause,
                elapsed_ms,
                "Stage failed"
            ),
        }

        // The stage has already run; its result is returned even when uncached.
        if let Err(e) = self.cache.put_result(key, &result).await {
            error!(
                run_id = %target.run_id,
                stage = %stage,
                error = %e,
                "Cannot cache stage result"
            );
        }
        Ok(result)
    }

    async fn run_source(&self, target: &RunTarget) -> StageResult {
        let started_at = Utc::now();
        let stage = StageName::Source;

        let bytes = match with_timeout(self.config.source_timeout(), self.source.fetch(target)).await
        {
            Ok(bytes) => bytes,
            Err(cause) => return StageResult::failure(stage, None, cause, started_at),
        };

        match self.artifacts.put(bytes, stage).await {
            Ok(artifact) => StageResult::success(stage, None, Some(artifact.artifact_id), started_at),
            Err(e) => StageResult::failure(stage, None, storage_cause(&e), started_at),
        }
    }

    async fn run_build(&self, target: &RunTarget, input: Option<ArtifactId>) -> StageResult {
        let started_at = Utc::now();
        let stage = StageName::Build;

        let source = match self.load_input(input).await {
            Ok(artifact) => artifact,
            Err(cause) => return StageResult::failure(stage, input, cause, started_at),
        };

        let bytes = match with_timeout(
            self.config.build_timeout(),
            self.build.build(target, &source),
        )
        .await
        {
            Ok(bytes) => bytes,
            Err(cause) => return StageResult::failure(stage, input, cause, started_at),
        };

        match self.artifacts.put(bytes, stage).await {
            Ok(artifact) => {
                StageResult::success(stage, input, Some(artifact.artifact_id), started_at)
            }
            Err(e) => StageResult::failure(stage, input, storage_cause(&e), started_at),
        }
    }

    async fn run_deploy(&self, target: &RunTarget, input: Option<ArtifactId>) -> StageResult {
        let started_at = Utc::now();
        let stage = StageName::Deploy;

        let artifact = match self.load_input(input).await {
            Ok(artifact) => artifact,
            Err(cause) => return StageResult::failure(stage, input, cause, started_at),
        };

        let request = DeployRequest {
            handle: DeployHandle::new(target.run_id, artifact.artifact_id),
            pipeline_id: target.pipeline_id.clone(),
            artifact,
        };
        let timeout = self.config.deploy_timeout();

        let cause = match tokio::time::timeout(timeout, self.backend.deploy(&request)).await {
            Ok(Ok(handle)) => return self.check_health(handle, input, started_at).await,
            Ok(Err(DeployError::Failed(message))) => FailureCause::DeploymentFailed { message },
            Ok(Err(DeployError::Stopped(message))) => FailureCause::DeploymentStopped { message },
            Err(_) => FailureCause::Timeout {
                after_ms: duration_ms(timeout),
            },
        };

        let handle = request.handle;
        let result = StageResult::failure(stage, input, cause.clone(), started_at)
            .with_deploy_handle(handle.clone());

        if self.config.auto_rollback.allows(&cause) {
            self.rollback(&handle).await;
            result.with_rollback_attempted()
        } else {
            result
        }
    }

    async fn check_health(
        &self,
        handle: DeployHandle,
        input: Option<ArtifactId>,
        started_at: chrono::DateTime<Utc>,
    ) -> StageResult {
        let status = match self.backend.health_status(&handle).await {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    run_id = %handle.run_id,
                    deployment_id = %handle.deployment_id,
                    error = %e,
                    "Health check failed, treating deployment as healthy"
                );
                HealthStatus::Healthy
            }
        };

        if status == HealthStatus::Unhealthy {
            let cause = FailureCause::DeploymentInAlarm;
            if self.config.auto_rollback.allows(&cause) {
                self.rollback(&handle).await;
                return StageResult::failure(StageName::Deploy, input, cause, started_at)
                    .with_deploy_handle(handle)
                    .with_rollback_attempted();
            }
            warn!(
                run_id = %handle.run_id,
                deployment_id = %handle.deployment_id,
                "Deployment is in alarm; keeping it because alarm rollback is disabled"
            );
        }

        StageResult::success(StageName::Deploy, input, None, started_at).with_deploy_handle(handle)
    }

    /// Requests a rollback, logging instead of failing.
    ///
    /// Returns true if the backend accepted the rollback.
    pub async fn rollback(&self, handle: &DeployHandle) -> bool {
        info!(
            run_id = %handle.run_id,
            deployment_id = %handle.deployment_id,
            "Rolling back deployment"
        );
        match self.backend.rollback(handle).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    run_id = %handle.run_id,
                    deployment_id = %handle.deployment_id,
                    error = %e,
                    "Rollback failed"
                );
                false
            }
        }
    }

    async fn load_input(&self, input: Option<ArtifactId>) -> std::result::Result<Artifact, FailureCause> {
        let Some(artifact_id) = input else {
            return Err(FailureCause::MissingArtifact { artifact_id: None });
        };
        match self.artifacts.get(&artifact_id).await {
            Ok(artifact) => Ok(artifact),
            Err(DeployflowError::NotFound(_)) => Err(FailureCause::MissingArtifact {
                artifact_id: Some(artifact_id),
            }),
            Err(e) => Err(storage_cause(&e)),
        }
    }
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> std::result::Result<T, FailureCause>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(FailureCause::collaborator(format!("{e:#}"))),
        Err(_) => Err(FailureCause::Timeout {
            after_ms: duration_ms(limit),
        }),
    }
}

fn storage_cause(err: &DeployflowError) -> FailureCause {
    FailureCause::Storage {
        message: err.to_string(),
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
