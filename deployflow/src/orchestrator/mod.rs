//! The pipeline orchestrator.
//!
//! Drives runs through `Source -> Build -> Approve -> Deploy`. The
//! orchestrator owns every [`Run`] record: it enforces one active run per
//! pipeline, applies stage results, gates Deploy on a human approval, rolls
//! back failed rollouts and publishes a notification when a run reaches the
//! approval gate or ends.
//!
//! `advance`, `resolve_approval` and `stop_run` are serialized per run by an
//! async mutex that is never held while a stage executes. The mutex is
//! dropped from the lock table once no caller holds or waits on it. Stages
//! run on
//! spawned tokio tasks unless the orchestrator is in
//! [`DispatchMode::Manual`].

mod builder;
#[cfg(test)]
mod integration_tests;

pub use builder::OrchestratorBuilder;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::DispatchMode;
use crate::core::{
    ApprovalDecision, ApprovalRequest, ArtifactId, FailureCause, NotificationEvent, Resolution,
    Run, RunId, RunStatus, RunTarget, StageName, StageOutcome, StageResult,
};
use crate::errors::{
    ConflictError, DeployflowError, InvalidStateError, NotFoundError, ResourceKind, Result,
};
use crate::executor::StageExecutor;
use crate::notifications::NotificationSink;
use crate::observability::run_span;
use crate::storage::RunStore;
use crate::utils::{validate_commit_ref, validate_pipeline_id};

/// Drives pipeline runs. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn RunStore>,
    executor: Arc<StageExecutor>,
    notifier: Arc<dyn NotificationSink>,
    dispatch: DispatchMode,
    /// Active run per pipeline id.
    active: DashMap<String, RunId>,
    run_locks: DashMap<RunId, Arc<Mutex<()>>>,
    watchers: DashMap<RunId, watch::Sender<RunStatus>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl PipelineOrchestrator {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub(crate) fn from_parts(
        store: Arc<dyn RunStore>,
        executor: Arc<StageExecutor>,
        notifier: Arc<dyn NotificationSink>,
        dispatch: DispatchMode,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                notifier,
                dispatch,
                active: DashMap::new(),
                run_locks: DashMap::new(),
                watchers: DashMap::new(),
                tasks: parking_lot::Mutex::new(Vec::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the stage executor, for callers driving stages in manual mode.
    #[must_use]
    pub fn executor(&self) -> &Arc<StageExecutor> {
        &self.inner.executor
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Starts a run of `pipeline_id` for `commit_ref` and schedules Source.
    ///
    /// # Errors
    ///
    /// - `Validation` if either identifier is malformed.
    /// - `Conflict` if the pipeline already has a non-terminal run.
    /// - `InvalidState` after [`shutdown`](Self::shutdown).
    pub async fn start_run(&self, pipeline_id: &str, commit_ref: &str) -> Result<Run> {
        validate_pipeline_id(pipeline_id)?;
        validate_commit_ref(commit_ref)?;
        if self.is_shutting_down() {
            return Err(InvalidStateError::new("start a run of", pipeline_id, "shutting_down").into());
        }

        let mut run = Run::new(pipeline_id, commit_ref);
        run.transition(RunStatus::Running)?;
        match self.inner.active.entry(pipeline_id.to_string()) {
            Entry::Occupied(active) => {
                return Err(ConflictError::new(
                    format!("pipeline '{pipeline_id}'"),
                    format!("run {} is still active", active.get()),
                )
                .into());
            }
            Entry::Vacant(slot) => {
                slot.insert(run.run_id);
            }
        }

        if let Err(e) = self.inner.store.save_run(&run).await {
            self.release_slot(&run);
            return Err(e);
        }
        self.inner
            .watchers
            .insert(run.run_id, watch::channel(run.status).0);

        info!(
            run_id = %run.run_id,
            pipeline_id = %run.pipeline_id,
            commit_ref = %run.commit_ref,
            "Run started"
        );
        self.schedule(RunTarget::from(&run), StageName::Source, None);
        Ok(run)
    }

    /// Applies the result of the run's current stage.
    ///
    /// Success moves to the next stage (suspending for approval after
    /// Build, succeeding after Deploy). Failure ends the run, rolling back
    /// the rollout first if Deploy touched the backend and no rollback has
    /// been requested yet.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the run does not exist.
    /// - `InvalidState` if the run is not executing, or the result is not
    ///   for its current stage.
    pub async fn advance(&self, run_id: RunId, mut result: StageResult) -> Result<Run> {
        self.apply(run_id, &mut result).await
    }

    /// Applies `result`, recording on it any rollback issued along the way.
    async fn apply(&self, run_id: RunId, result: &mut StageResult) -> Result<Run> {
        let _lock = self.lock_run(run_id).await;

        let mut run = self.load(run_id).await?;
        if run.status != RunStatus::Running {
            return Err(InvalidStateError::new("advance", run_id, run.status).into());
        }
        if result.stage_name != run.current_stage {
            return Err(InvalidStateError::new(
                format!("apply a {} result to", result.stage_name),
                run_id,
                format!("{} at {}", run.status, run.current_stage),
            )
            .into());
        }

        let stage = result.stage_name;
        info!(
            run_id = %run_id,
            pipeline_id = %run.pipeline_id,
            stage = %stage,
            outcome = %result.outcome,
            duration_ms = result.duration_ms(),
            "Applying stage result"
        );

        match result.outcome {
            StageOutcome::Success => {
                run.record(result.clone());
                self.enter_next_stage(run).await
            }
            StageOutcome::Failure => self.fail(run, result).await,
            StageOutcome::Rejected => Err(InvalidStateError::new(
                format!("apply a rejected {stage} result to"),
                run_id,
                run.status,
            )
            .into()),
        }
    }

    /// Records the human decision for a run awaiting approval.
    ///
    /// Approved resumes the run at Deploy; Rejected stops it. Repeating the
    /// recorded decision returns the run unchanged.
    ///
    /// # Errors
    ///
    /// - `Validation` if `decision` is `Pending`.
    /// - `NotFound` if the run or its approval request does not exist.
    /// - `Conflict` if a different decision was already recorded.
    /// - `InvalidState` if the run is not awaiting approval.
    pub async fn resolve_approval(
        &self,
        run_id: RunId,
        decision: ApprovalDecision,
        decided_by: &str,
    ) -> Result<Run> {
        if decision == ApprovalDecision::Pending {
            return Err(DeployflowError::validation(
                "approval decision must be approved or rejected",
            ));
        }

        let _lock = self.lock_run(run_id).await;

        let mut run = self.load(run_id).await?;
        let request = self.inner.store.load_approval(run_id).await?;

        if run.status != RunStatus::AwaitingApproval {
            if let Some(mut decided) = request.filter(|r| !r.is_open()) {
                decided.resolve(decision, decided_by)?;
                return Ok(run);
            }
            return Err(InvalidStateError::new("resolve the approval of", run_id, run.status).into());
        }

        let mut request =
            request.ok_or_else(|| NotFoundError::new(ResourceKind::Approval, run_id))?;
        // Unchanged here means a previous call recorded the decision but did
        // not get to move the run; finish that transition.
        if request.resolve(decision, decided_by)? == Resolution::Recorded {
            self.inner.store.save_approval(&request).await?;
        }

        let approved = decision == ApprovalDecision::Approved;
        info!(
            run_id = %run_id,
            pipeline_id = %run.pipeline_id,
            decision = %decision,
            decided_by = %decided_by,
            "Approval resolved"
        );
        run.record(StageResult::approval(approved, request.requested_at));

        if approved {
            run.move_to(StageName::Deploy);
            run.transition(RunStatus::Running)?;
            self.persist(&run).await?;
            self.schedule(
                RunTarget::from(&run),
                StageName::Deploy,
                run.input_for(StageName::Deploy),
            );
            Ok(run)
        } else {
            run.transition(RunStatus::Stopped)?;
            self.finish(&run).await?;
            Ok(run)
        }
    }

    /// Stops a run. Safe at any point of the run's life.
    ///
    /// A stage still executing completes, but its result is discarded; a
    /// rollout it produced is rolled back.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the run does not exist.
    /// - `InvalidState` if the run already ended.
    pub async fn stop_run(&self, run_id: RunId) -> Result<Run> {
        let _lock = self.lock_run(run_id).await;

        let mut run = self.load(run_id).await?;
        if run.status.is_terminal() {
            return Err(InvalidStateError::new("stop", run_id, run.status).into());
        }

        info!(
            run_id = %run_id,
            pipeline_id = %run.pipeline_id,
            stage = %run.current_stage,
            status = %run.status,
            "Stopping run"
        );
        run.transition(RunStatus::Stopped)?;
        self.finish(&run).await?;
        Ok(run)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Returns a run.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the run does not exist.
    pub async fn get_run(&self, run_id: RunId) -> Result<Run> {
        self.load(run_id).await
    }

    /// Returns the runs of a pipeline, oldest first.
    pub async fn list_runs(&self, pipeline_id: &str) -> Result<Vec<Run>> {
        let runs = self.inner.store.list_runs().await?;
        Ok(runs
            .into_iter()
            .filter(|r| r.pipeline_id == pipeline_id)
            .collect())
    }

    /// Returns the pipeline's non-terminal run, if any.
    pub async fn active_run(&self, pipeline_id: &str) -> Result<Option<Run>> {
        let active = self.inner.active.get(pipeline_id).map(|id| *id.value());
        match active {
            Some(run_id) => self.inner.store.load_run(run_id).await,
            None => Ok(None),
        }
    }

    /// Returns the approval request of a run.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the run never reached the approval gate.
    pub async fn approval(&self, run_id: RunId) -> Result<ApprovalRequest> {
        self.inner
            .store
            .load_approval(run_id)
            .await?
            .ok_or_else(|| NotFoundError::new(ResourceKind::Approval, run_id).into())
    }

    /// Waits until the run is awaiting approval or has ended.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the run does not exist.
    /// - `InvalidState` if the run is executing but not tracked by this
    ///   orchestrator (call [`recover`](Self::recover) first).
    pub async fn wait_for_settled(&self, run_id: RunId) -> Result<Run> {
        let receiver = self.inner.watchers.get(&run_id).map(|tx| tx.subscribe());

        let run = self.load(run_id).await?;
        if run.status.is_settled() {
            return Ok(run);
        }
        let Some(mut receiver) = receiver else {
            return Err(InvalidStateError::new("wait for", run_id, "untracked").into());
        };

        // A closed channel still exposes the final status.
        let _ = receiver.wait_for(RunStatus::is_settled).await;
        self.load(run_id).await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Reloads non-terminal runs after a restart.
    ///
    /// Rebuilds the active-run registry, starts pending runs and
    /// re-dispatches the current stage of executing runs. Stage execution is
    /// idempotent, so a stage that completed before the restart is not
    /// repeated. Returns the number of runs recovered.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;

        for mut run in self.inner.store.list_runs().await? {
            if run.status.is_terminal() {
                continue;
            }

            match self.inner.active.entry(run.pipeline_id.clone()) {
                Entry::Occupied(active) if *active.get() != run.run_id => {
                    error!(
                        run_id = %run.run_id,
                        pipeline_id = %run.pipeline_id,
                        active_run_id = %active.get(),
                        "Pipeline has more than one active run; skipping"
                    );
                    continue;
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(slot) => {
                    slot.insert(run.run_id);
                }
            }

            self.inner
                .watchers
                .entry(run.run_id)
                .or_insert_with(|| watch::channel(run.status).0);

            match run.status {
                RunStatus::Pending => {
                    run.move_to(StageName::Source);
                    run.transition(RunStatus::Running)?;
                    self.persist(&run).await?;
                    self.schedule(RunTarget::from(&run), StageName::Source, None);
                }
                RunStatus::Running => {
                    let stage = run.current_stage;
                    self.schedule(RunTarget::from(&run), stage, run.input_for(stage));
                }
                RunStatus::AwaitingApproval => {
                    if self.inner.store.load_approval(run.run_id).await?.is_none() {
                        self.inner
                            .store
                            .save_approval(&ApprovalRequest::open(run.run_id))
                            .await?;
                    }
                }
                _ => {}
            }

            info!(
                run_id = %run.run_id,
                pipeline_id = %run.pipeline_id,
                status = %run.status,
                stage = %run.current_stage,
                "Recovered run"
            );
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Stops dispatching new stages and waits for in-flight stage tasks.
    ///
    /// Runs whose next stage was not dispatched stay `Running` and are
    /// picked up by [`recover`](Self::recover).
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        loop {
            let handles = std::mem::take(&mut *self.inner.tasks.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Stage task panicked");
                }
            }
        }
        info!("Orchestrator shut down");
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn enter_next_stage(&self, mut run: Run) -> Result<Run> {
        match run.current_stage.next() {
            Some(StageName::Approve) => {
                run.move_to(StageName::Approve);
                run.transition(RunStatus::AwaitingApproval)?;
                self.inner
                    .store
                    .save_approval(&ApprovalRequest::open(run.run_id))
                    .await?;
                self.inner.store.save_run(&run).await?;
                info!(
                    run_id = %run.run_id,
                    pipeline_id = %run.pipeline_id,
                    "Run awaiting approval"
                );
                // Subscribers hear about the gate before waiters wake.
                self.publish(&run).await;
                self.signal(&run);
            }
            Some(next) => {
                run.move_to(next);
                self.persist(&run).await?;
                self.schedule(RunTarget::from(&run), next, run.input_for(next));
            }
            None => {
                run.transition(RunStatus::Succeeded)?;
                self.finish(&run).await?;
            }
        }
        Ok(run)
    }

    async fn fail(&self, mut run: Run, result: &mut StageResult) -> Result<Run> {
        let mut status = RunStatus::Failed;

        if result.stage_name.mutates_external_state() {
            let policy = self.inner.executor.config().auto_rollback;
            let cause = result.failure.clone().unwrap_or_else(|| {
                FailureCause::collaborator("deploy failed without a cause")
            });

            if result.needs_rollback() && policy.allows(&cause) {
                if let Some(handle) = &result.deploy_handle {
                    self.inner.executor.rollback(handle).await;
                }
                result.rollback_attempted = true;
            }
            if cause == FailureCause::DeploymentInAlarm && result.rollback_attempted {
                status = RunStatus::RolledBack;
            }
        }

        error!(
            run_id = %run.run_id,
            pipeline_id = %run.pipeline_id,
            stage = %result.stage_name,
            outcome = %result.outcome,
            cause = ?result.failure,
            rollback_attempted = result.rollback_attempted,
            "Run failed"
        );
        run.record(result.clone());
        run.transition(status)?;
        self.finish(&run).await?;
        Ok(run)
    }

    /// Persists a terminal run, then closes it.
    async fn finish(&self, run: &Run) -> Result<()> {
        self.inner.store.save_run(run).await?;
        self.close(run).await;
        Ok(())
    }

    /// Frees the pipeline of a terminal run, notifies and wakes waiters.
    async fn close(&self, run: &Run) {
        self.release_slot(run);
        self.publish(run).await;
        if let Some((_, tx)) = self.inner.watchers.remove(&run.run_id) {
            tx.send_replace(run.status);
        }

        info!(
            run_id = %run.run_id,
            pipeline_id = %run.pipeline_id,
            status = %run.status,
            stages = ?run.history_stages(),
            "Run finished"
        );
    }

    async fn persist(&self, run: &Run) -> Result<()> {
        self.inner.store.save_run(run).await?;
        self.signal(run);
        Ok(())
    }

    async fn publish(&self, run: &Run) {
        if let Some(event) = NotificationEvent::for_run(run) {
            self.inner.notifier.publish(&event).await;
        }
    }

    fn signal(&self, run: &Run) {
        if let Some(tx) = self.inner.watchers.get(&run.run_id) {
            tx.send_replace(run.status);
        }
    }

    fn release_slot(&self, run: &Run) {
        self.inner
            .active
            .remove_if(&run.pipeline_id, |_, id| *id == run.run_id);
    }

    async fn lock_run(&self, run_id: RunId) -> RunLock<'_> {
        let lock = Arc::clone(self.inner.run_locks.entry(run_id).or_default().value());
        RunLock {
            locks: &self.inner.run_locks,
            run_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn load(&self, run_id: RunId) -> Result<Run> {
        self.inner
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| NotFoundError::run(run_id).into())
    }

    fn schedule(&self, target: RunTarget, stage: StageName, input: Option<ArtifactId>) {
        if self.inner.dispatch == DispatchMode::Manual {
            debug!(run_id = %target.run_id, stage = %stage, "Stage awaiting manual dispatch");
            return;
        }
        if self.is_shutting_down() {
            info!(
                run_id = %target.run_id,
                stage = %stage,
                "Shutting down; stage left for recovery"
            );
            return;
        }

        let span = run_span(&target);
        let this = self.clone();
        let handle = tokio::spawn(this.drive(target, stage, input).instrument(span));

        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Executes one stage and feeds its result back into the run.
    async fn drive(self, target: RunTarget, stage: StageName, input: Option<ArtifactId>) {
        let run_id = target.run_id;
        match self.load(run_id).await {
            Ok(run) if run.status == RunStatus::Running && run.current_stage == stage => {}
            Ok(run) => {
                debug!(run_id = %run_id, stage = %stage, status = %run.status, "Stage no longer scheduled");
                return;
            }
            Err(e) => {
                error!(run_id = %run_id, stage = %stage, error = %e, "Cannot load run");
                return;
            }
        }

        let started_at = Utc::now();
        let mut result = match self.inner.executor.execute(stage, &target, input).await {
            Ok(result) => result,
            Err(e) => {
                error!(run_id = %run_id, stage = %stage, error = %e, "Stage execution errored");
                StageResult::failure(
                    stage,
                    input,
                    FailureCause::Storage {
                        message: e.to_string(),
                    },
                    started_at,
                )
            }
        };

        match self.apply(run_id, &mut result).await {
            Ok(_) => {}
            Err(DeployflowError::InvalidState(e)) => {
                debug!(run_id = %run_id, stage = %stage, reason = %e, "Discarding stage result");
                self.discard(&result).await;
            }
            Err(e) => {
                error!(run_id = %run_id, stage = %stage, error = %e, "Cannot apply stage result");
                self.abandon(run_id, result, &e).await;
            }
        }
    }

    /// Fails a run whose stage result could not be applied.
    ///
    /// A rollout the result carries is rolled back unless that already
    /// happened. The pipeline slot is freed and subscribers are notified
    /// even if the failed run cannot be persisted.
    async fn abandon(&self, run_id: RunId, result: StageResult, err: &DeployflowError) {
        let lock = self.lock_run(run_id).await;
        let mut run = match self.load(run_id).await {
            Ok(run) => run,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Cannot load run to fail it");
                return;
            }
        };
        if run.status.is_terminal() {
            drop(lock);
            self.discard(&result).await;
            return;
        }

        let policy = self.inner.executor.config().auto_rollback;
        let rollback = match &result.deploy_handle {
            Some(_) if result.rollback_attempted => false,
            Some(_) if result.is_success() => true,
            Some(_) => result.failure.as_ref().is_some_and(|c| policy.allows(c)),
            None => false,
        };

        let mut failed = StageResult::failure(
            result.stage_name,
            result.input_artifact_ref,
            FailureCause::Storage {
                message: err.to_string(),
            },
            result.started_at,
        );
        if let Some(handle) = result.deploy_handle {
            if rollback {
                self.inner.executor.rollback(&handle).await;
            }
            failed = failed.with_deploy_handle(handle);
            if rollback || result.rollback_attempted {
                failed = failed.with_rollback_attempted();
            }
        }

        run.move_to(result.stage_name);
        run.record(failed);
        if let Err(e) = run.transition(RunStatus::Failed) {
            error!(run_id = %run_id, error = %e, "Cannot fail run");
            return;
        }
        if let Err(e) = self.inner.store.save_run(&run).await {
            error!(run_id = %run_id, error = %e, "Cannot persist failed run");
        }
        warn!(
            run_id = %run_id,
            pipeline_id = %run.pipeline_id,
            stage = %result.stage_name,
            rollback_attempted = rollback,
            "Run failed after its stage result could not be applied"
        );
        self.close(&run).await;
    }

    /// Rolls back a rollout whose result arrived after the run was stopped.
    async fn discard(&self, result: &StageResult) {
        if result.rollback_attempted {
            return;
        }
        let Some(handle) = &result.deploy_handle else {
            return;
        };
        match self.load(handle.run_id).await {
            Ok(run) if run.status == RunStatus::Stopped => {
                warn!(
                    run_id = %handle.run_id,
                    deployment_id = %handle.deployment_id,
                    "Run was stopped during Deploy; rolling back"
                );
                self.inner.executor.rollback(handle).await;
            }
            Ok(_) => {}
            Err(e) => error!(run_id = %handle.run_id, error = %e, "Cannot load run"),
        }
    }
}

/// Holds a run's mutex; drops the table entry once nobody else wants it.
struct RunLock<'a> {
    locks: &'a DashMap<RunId, Arc<Mutex<()>>>,
    run_id: RunId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RunLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.run_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
