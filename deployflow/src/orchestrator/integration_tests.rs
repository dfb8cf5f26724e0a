//! End-to-end tests for orchestrated pipeline runs.

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::artifacts::InMemoryArtifactStore;
    use crate::backend::{DeployError, HealthStatus, MockProvisioningBackend};
    use crate::config::{AutoRollbackConfig, DispatchMode, ExecutorConfig};
    use crate::core::{
        ApprovalDecision, ArtifactId, DeployHandle, EventType, FailureCause, RunId, RunStatus,
        RunTarget, StageName, StageOutcome, StageResult,
    };
    use crate::errors::DeployflowError;
    use crate::storage::{InMemoryRunStore, RunStore};
    use crate::testing::{
        FaultyRunStore, HarnessBuilder, RecordingBackend, RecordingBuildProvider,
        StaticSourceProvider, TestHarness,
    };

    const PIPELINE: &str = "DevOpsPipeline";

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_happy_path() {
        let harness = TestHarness::new();

        let awaiting = harness.start_and_settle(PIPELINE, "abc123").await.unwrap();
        assert_eq!(awaiting.status, RunStatus::AwaitingApproval);
        assert_eq!(awaiting.current_stage, StageName::Approve);
        assert!(harness.orchestrator.approval(awaiting.run_id).await.unwrap().is_open());

        harness
            .orchestrator
            .resolve_approval(awaiting.run_id, ApprovalDecision::Approved, "alice")
            .await
            .unwrap();
        let run = harness.settle(awaiting.run_id).await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.commit_ref, "abc123");
        assert_eq!(run.history_stages(), StageName::SEQUENCE.to_vec());
        assert!(run.stage_history.iter().all(|r| r.is_success()));
        assert!(run.deploy_handle.is_some());

        assert_eq!(
            harness.sink.event_types_for(run.run_id),
            vec![EventType::ApprovalRequested, EventType::Succeeded]
        );
        let succeeded = &harness.sink.events_of_type(EventType::Succeeded)[0];
        assert_eq!(succeeded.payload["commit_ref"], "abc123");
        assert_eq!(
            succeeded.payload["deployment_id"],
            run.deploy_handle.as_ref().unwrap().deployment_id.to_string()
        );

        assert_eq!(harness.backend.deploy_count(), 1);
        assert_eq!(harness.backend.rollback_count(), 0);
        assert!(harness.orchestrator.active_run(PIPELINE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stage_artifacts_chain() {
        let harness = TestHarness::new();
        let run = harness.run_approved(PIPELINE, "abc123").await.unwrap();

        let source = run.result_for(StageName::Source).unwrap();
        let build = run.result_for(StageName::Build).unwrap();
        let deploy = run.result_for(StageName::Deploy).unwrap();

        assert!(source.input_artifact_ref.is_none());
        assert_eq!(build.input_artifact_ref, source.output_artifact_ref);
        assert_eq!(deploy.input_artifact_ref, build.output_artifact_ref);
        assert!(deploy.output_artifact_ref.is_none());
        assert_eq!(
            run.deploy_handle.as_ref().map(|h| h.artifact_id),
            build.output_artifact_ref
        );
    }

    #[tokio::test]
    async fn test_concurrent_start_run_conflicts() {
        let harness = HarnessBuilder::new().with_dispatch(DispatchMode::Manual).build();

        let attempts: Vec<_> = (0..16)
            .map(|i| {
                let orchestrator = harness.orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator.start_run(PIPELINE, &format!("commit{i}")).await
                })
            })
            .collect();

        let mut started = 0;
        let mut conflicts = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => started += 1,
                Err(DeployflowError::Conflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(started, 1);
        assert_eq!(conflicts, 15);
        assert_eq!(harness.orchestrator.list_runs(PIPELINE).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pipelines_run_independently() {
        let harness = TestHarness::new();

        let web = harness.orchestrator.start_run("web", "abc123").await.unwrap();
        let api = harness.orchestrator.start_run("api", "abc123").await.unwrap();

        assert_eq!(harness.settle(web.run_id).await.unwrap().status, RunStatus::AwaitingApproval);
        assert_eq!(harness.settle(api.run_id).await.unwrap().status, RunStatus::AwaitingApproval);
    }

    #[tokio::test]
    async fn test_new_run_allowed_after_terminal() {
        let harness = TestHarness::new();
        let first = harness.run_approved(PIPELINE, "abc123").await.unwrap();
        assert_eq!(first.status, RunStatus::Succeeded);

        let second = harness.orchestrator.start_run(PIPELINE, "def456").await.unwrap();
        assert_ne!(second.run_id, first.run_id);
        assert_eq!(
            harness.orchestrator.active_run(PIPELINE).await.unwrap().map(|r| r.run_id),
            Some(second.run_id)
        );
    }

    #[tokio::test]
    async fn test_build_failure() {
        let harness = HarnessBuilder::new()
            .with_build(RecordingBuildProvider::failing("compilation failed"))
            .build();

        let run = harness.start_and_settle(PIPELINE, "abc123").await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.history_stages(), vec![StageName::Source, StageName::Build]);
        assert_eq!(
            run.last_result().and_then(|r| r.failure.clone()),
            Some(FailureCause::collaborator("compilation failed"))
        );
        assert_eq!(harness.backend.deploy_count(), 0);
        assert_eq!(harness.backend.rollback_count(), 0);
        assert!(harness.orchestrator.approval(run.run_id).await.is_err());

        let events = harness.sink.events_for(run.run_id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Failed);
    }

    #[tokio::test]
    async fn test_source_failure_is_terminal() {
        let harness = HarnessBuilder::new()
            .with_source(StaticSourceProvider::failing("repository unreachable"))
            .build();

        let run = harness.start_and_settle(PIPELINE, "abc123").await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.history_stages(), vec![StageName::Source]);
        assert_eq!(harness.build.build_count(), 0);
        assert_eq!(harness.sink.events_of_type(EventType::Failed).len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_approval_stops_run() {
        let harness = TestHarness::new();
        let awaiting = harness.start_and_settle(PIPELINE, "abc123").await.unwrap();

        let run = harness
            .orchestrator
            .resolve_approval(awaiting.run_id, ApprovalDecision::Rejected, "bob")
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Stopped);
        assert_eq!(
            run.history_stages(),
            vec![StageName::Source, StageName::Build, StageName::Approve]
        );
        assert_eq!(run.last_result().map(|r| r.outcome), Some(StageOutcome::Rejected));
        assert_eq!(harness.backend.deploy_count(), 0);
        assert_eq!(harness.backend.rollback_count(), 0);

        assert_eq!(
            harness.sink.event_types_for(run.run_id),
            vec![EventType::ApprovalRequested, EventType::Stopped]
        );

        let approval = harness.orchestrator.approval(run.run_id).await.unwrap();
        assert_eq!(approval.decision, ApprovalDecision::Rejected);
        assert_eq!(approval.decided_by.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_deploy_failure_rolls_back_once() {
        let harness = HarnessBuilder::new()
            .with_backend(
                RecordingBackend::new().with_deploy_error(DeployError::Failed("bad AMI".into())),
            )
            .build();

        let run = harness.run_approved(PIPELINE, "abc123").await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.history_stages(), StageName::SEQUENCE.to_vec());
        assert_eq!(harness.backend.rollback_count(), 1);
        assert_eq!(harness.backend.rolled_back(), vec![run.deploy_handle.clone().unwrap()]);

        let deploy = run.last_result().unwrap();
        assert!(deploy.rollback_attempted);
        assert_eq!(harness.sink.events_of_type(EventType::Failed).len(), 1);
    }

    #[tokio::test]
    async fn test_deploy_failure_rollback_with_mock_backend() {
        let mut backend = MockProvisioningBackend::new();
        backend
            .expect_deploy()
            .times(1)
            .returning(|_| Err(DeployError::Stopped("instances terminated".into())));
        backend.expect_rollback().times(1).returning(|_| Ok(()));
        backend.expect_health_status().never();

        let harness = HarnessBuilder::new()
            .with_custom_backend(Arc::new(backend))
            .build();
        let run = harness.run_approved(PIPELINE, "abc123").await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert!(matches!(
            run.last_result().and_then(|r| r.failure.clone()),
            Some(FailureCause::DeploymentStopped { .. })
        ));
    }

    #[tokio::test]
    async fn test_alarm_kept_by_default() {
        let harness = HarnessBuilder::new()
            .with_backend(RecordingBackend::new().with_health(HealthStatus::Unhealthy))
            .build();

        let run = harness.run_approved(PIPELINE, "abc123").await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(harness.backend.rollback_count(), 0);
        assert_eq!(harness.sink.events_of_type(EventType::Succeeded).len(), 1);
    }

    #[tokio::test]
    async fn test_alarm_rollback_when_enabled() {
        let policy = AutoRollbackConfig {
            deployment_in_alarm: true,
            ..AutoRollbackConfig::default()
        };
        let harness = HarnessBuilder::new()
            .with_backend(RecordingBackend::new().with_health(HealthStatus::Unhealthy))
            .with_executor_config(ExecutorConfig::default().with_auto_rollback(policy))
            .build();

        let run = harness.run_approved(PIPELINE, "abc123").await.unwrap();

        assert_eq!(run.status, RunStatus::RolledBack);
        assert_eq!(harness.backend.rollback_count(), 1);
        assert_eq!(harness.sink.events_of_type(EventType::Failed).len(), 1);
    }

    #[tokio::test]
    async fn test_approval_gating() {
        let harness = HarnessBuilder::new().with_dispatch(DispatchMode::Manual).build();
        let orchestrator = &harness.orchestrator;

        let unknown = orchestrator
            .resolve_approval(RunId::new(), ApprovalDecision::Approved, "alice")
            .await
            .unwrap_err();
        assert!(matches!(unknown, DeployflowError::NotFound(_)));

        let run = orchestrator.start_run(PIPELINE, "abc123").await.unwrap();
        let early = orchestrator
            .resolve_approval(run.run_id, ApprovalDecision::Approved, "alice")
            .await
            .unwrap_err();
        assert!(matches!(early, DeployflowError::InvalidState(_)));

        let pending = orchestrator
            .resolve_approval(run.run_id, ApprovalDecision::Pending, "alice")
            .await
            .unwrap_err();
        assert!(matches!(pending, DeployflowError::Validation(_)));
    }

    #[tokio::test]
    async fn test_repeated_and_conflicting_decisions() {
        let harness = TestHarness::new();
        let awaiting = harness.start_and_settle(PIPELINE, "abc123").await.unwrap();
        let orchestrator = &harness.orchestrator;

        orchestrator
            .resolve_approval(awaiting.run_id, ApprovalDecision::Rejected, "bob")
            .await
            .unwrap();
        let again = orchestrator
            .resolve_approval(awaiting.run_id, ApprovalDecision::Rejected, "carol")
            .await
            .unwrap();
        assert_eq!(again.status, RunStatus::Stopped);
        assert_eq!(
            orchestrator.approval(awaiting.run_id).await.unwrap().decided_by.as_deref(),
            Some("bob")
        );

        let conflict = orchestrator
            .resolve_approval(awaiting.run_id, ApprovalDecision::Approved, "carol")
            .await
            .unwrap_err();
        assert!(matches!(conflict, DeployflowError::Conflict(_)));
        assert_eq!(
            harness.sink.event_types_for(awaiting.run_id),
            vec![EventType::ApprovalRequested, EventType::Stopped]
        );
    }

    #[tokio::test]
    async fn test_stop_while_awaiting_approval() {
        let harness = TestHarness::new();
        let awaiting = harness.start_and_settle(PIPELINE, "abc123").await.unwrap();

        let stopped = harness.orchestrator.stop_run(awaiting.run_id).await.unwrap();
        assert_eq!(stopped.status, RunStatus::Stopped);
        assert_eq!(harness.sink.events_of_type(EventType::Stopped).len(), 1);

        let late = harness
            .orchestrator
            .resolve_approval(awaiting.run_id, ApprovalDecision::Approved, "alice")
            .await
            .unwrap_err();
        assert!(matches!(late, DeployflowError::InvalidState(_)));
        assert!(harness.orchestrator.approval(awaiting.run_id).await.unwrap().is_open());
        assert_eq!(harness.backend.deploy_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_during_deploy_discards_and_rolls_back() {
        let harness = HarnessBuilder::new()
            .with_backend(RecordingBackend::new().with_delay(Duration::from_millis(100)))
            .build();
        let awaiting = harness.start_and_settle(PIPELINE, "abc123").await.unwrap();

        harness
            .orchestrator
            .resolve_approval(awaiting.run_id, ApprovalDecision::Approved, "alice")
            .await
            .unwrap();
        let backend = Arc::clone(&harness.backend);
        wait_until(move || backend.deploy_count() == 1).await;

        let stopped = harness.orchestrator.stop_run(awaiting.run_id).await.unwrap();
        assert_eq!(stopped.status, RunStatus::Stopped);

        harness.orchestrator.shutdown().await;

        let run = harness.orchestrator.get_run(awaiting.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Stopped);
        assert!(run.result_for(StageName::Deploy).is_none());
        assert_eq!(harness.backend.rollback_count(), 1);

        assert_eq!(
            harness.sink.event_types_for(run.run_id),
            vec![EventType::ApprovalRequested, EventType::Stopped]
        );
    }

    #[tokio::test]
    async fn test_terminal_runs_are_sinks() {
        let harness = TestHarness::new();
        let run = harness.run_approved(PIPELINE, "abc123").await.unwrap();

        let stop = harness.orchestrator.stop_run(run.run_id).await.unwrap_err();
        assert!(matches!(stop, DeployflowError::InvalidState(_)));

        let result = StageResult::success(StageName::Deploy, None, None, Utc::now());
        let advance = harness.orchestrator.advance(run.run_id, result).await.unwrap_err();
        assert!(matches!(advance, DeployflowError::InvalidState(_)));

        let unchanged = harness.orchestrator.get_run(run.run_id).await.unwrap();
        assert_eq!(unchanged, run);
    }

    #[tokio::test]
    async fn test_manual_dispatch() {
        let harness = HarnessBuilder::new().with_dispatch(DispatchMode::Manual).build();
        let orchestrator = &harness.orchestrator;
        let run = orchestrator.start_run(PIPELINE, "abc123").await.unwrap();
        assert_eq!(harness.source.fetch_count(), 0);

        let wrong_stage = StageResult::success(StageName::Build, None, None, Utc::now());
        let err = orchestrator.advance(run.run_id, wrong_stage).await.unwrap_err();
        assert!(matches!(err, DeployflowError::InvalidState(_)));

        let target = RunTarget::from(&run);
        let source = orchestrator
            .executor()
            .execute(StageName::Source, &target, None)
            .await
            .unwrap();
        let run = orchestrator.advance(run.run_id, source.clone()).await.unwrap();
        assert_eq!(run.current_stage, StageName::Build);
        assert_eq!(harness.build.build_count(), 0);

        let build = orchestrator
            .executor()
            .execute(StageName::Build, &target, source.output_artifact_ref)
            .await
            .unwrap();
        let run = orchestrator.advance(run.run_id, build).await.unwrap();
        assert_eq!(run.status, RunStatus::AwaitingApproval);

        let approve = StageResult::approval(true, Utc::now());
        let err = orchestrator.advance(run.run_id, approve).await.unwrap_err();
        assert!(matches!(err, DeployflowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_manual_deploy_failure_rolls_back_when_executor_did_not() {
        let harness = HarnessBuilder::new().with_dispatch(DispatchMode::Manual).build();
        let orchestrator = &harness.orchestrator;
        let run = orchestrator.start_run(PIPELINE, "abc123").await.unwrap();

        let source = ArtifactId::new();
        let bundle = ArtifactId::new();
        orchestrator
            .advance(
                run.run_id,
                StageResult::success(StageName::Source, None, Some(source), Utc::now()),
            )
            .await
            .unwrap();
        orchestrator
            .advance(
                run.run_id,
                StageResult::success(StageName::Build, Some(source), Some(bundle), Utc::now()),
            )
            .await
            .unwrap();
        orchestrator
            .resolve_approval(run.run_id, ApprovalDecision::Approved, "alice")
            .await
            .unwrap();

        let handle = DeployHandle::new(run.run_id, bundle);
        let failed = StageResult::failure(
            StageName::Deploy,
            Some(bundle),
            FailureCause::DeploymentFailed {
                message: "health checks failed".into(),
            },
            Utc::now(),
        )
        .with_deploy_handle(handle.clone());

        let run = orchestrator.advance(run.run_id, failed).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(harness.backend.rolled_back(), vec![handle]);
        assert!(run.last_result().unwrap().rollback_attempted);
    }

    #[tokio::test]
    async fn test_recover_resumes_runs() {
        let store = Arc::new(InMemoryRunStore::new());
        let artifacts = Arc::new(InMemoryArtifactStore::new());

        let before = HarnessBuilder::new()
            .with_store(store.clone())
            .with_artifacts(artifacts.clone())
            .with_dispatch(DispatchMode::Manual)
            .build();
        let run = before.orchestrator.start_run(PIPELINE, "abc123").await.unwrap();

        let after = HarnessBuilder::new()
            .with_store(store.clone())
            .with_artifacts(artifacts)
            .build();
        assert_eq!(after.orchestrator.recover().await.unwrap(), 1);

        let conflict = after.orchestrator.start_run(PIPELINE, "def456").await.unwrap_err();
        assert!(matches!(conflict, DeployflowError::Conflict(_)));

        let settled = after.settle(run.run_id).await.unwrap();
        assert_eq!(settled.status, RunStatus::AwaitingApproval);
        assert_eq!(after.source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_recover_does_not_repeat_completed_stage() {
        let harness = HarnessBuilder::new().with_dispatch(DispatchMode::Manual).build();
        let run = harness.orchestrator.start_run(PIPELINE, "abc123").await.unwrap();
        harness
            .orchestrator
            .executor()
            .execute(StageName::Source, &RunTarget::from(&run), None)
            .await
            .unwrap();

        let restarted = HarnessBuilder::new()
            .with_store(harness.store.clone())
            .with_artifacts(harness.artifacts.clone())
            .build();
        restarted.orchestrator.recover().await.unwrap();
        let settled = restarted.settle(run.run_id).await.unwrap();

        assert_eq!(settled.status, RunStatus::AwaitingApproval);
        assert_eq!(harness.source.fetch_count(), 1);
        assert_eq!(restarted.source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_recover_skips_terminal_runs() {
        let harness = TestHarness::new();
        harness.run_approved(PIPELINE, "abc123").await.unwrap();

        let restarted = HarnessBuilder::new().with_store(harness.store.clone()).build();
        assert_eq!(restarted.orchestrator.recover().await.unwrap(), 0);
        assert_eq!(harness.store.list_runs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_runs() {
        let harness = TestHarness::new();
        harness.orchestrator.shutdown().await;

        let err = harness.orchestrator.start_run(PIPELINE, "abc123").await.unwrap_err();
        assert!(matches!(err, DeployflowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_invalid_identifiers_rejected() {
        let harness = TestHarness::new();

        let bad_pipeline = harness.orchestrator.start_run("", "abc123").await.unwrap_err();
        assert!(matches!(bad_pipeline, DeployflowError::Validation(_)));

        let bad_commit = harness.orchestrator.start_run(PIPELINE, "a..b").await.unwrap_err();
        assert!(matches!(bad_commit, DeployflowError::Validation(_)));
    }

    #[tokio::test]
    async fn test_approval_gate_notifies_subscribers() {
        let harness = TestHarness::new();
        let awaiting = harness.start_and_settle(PIPELINE, "abc123").await.unwrap();

        let events = harness.sink.events_for(awaiting.run_id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ApprovalRequested);
        assert_eq!(events[0].pipeline_id, PIPELINE);
        assert_eq!(events[0].payload["stage"], "Approve");
        assert_eq!(events[0].payload["commit_ref"], "abc123");
    }

    #[tokio::test]
    async fn test_recover_does_not_repeat_approval_notice() {
        let harness = TestHarness::new();
        let awaiting = harness.start_and_settle(PIPELINE, "abc123").await.unwrap();

        let restarted = HarnessBuilder::new().with_store(harness.store.clone()).build();
        assert_eq!(restarted.orchestrator.recover().await.unwrap(), 1);

        assert!(restarted.sink.is_empty());
        assert_eq!(harness.sink.events_for(awaiting.run_id).len(), 1);
    }

    #[tokio::test]
    async fn test_run_locks_released_after_each_call() {
        let harness = TestHarness::new();
        let awaiting = harness.start_and_settle(PIPELINE, "abc123").await.unwrap();
        harness.orchestrator.stop_run(awaiting.run_id).await.unwrap();

        for _ in 0..100 {
            let err = harness.orchestrator.stop_run(RunId::new()).await.unwrap_err();
            assert!(matches!(err, DeployflowError::NotFound(_)));
        }
        let err = harness.orchestrator.stop_run(awaiting.run_id).await.unwrap_err();
        assert!(matches!(err, DeployflowError::InvalidState(_)));
        let err = harness
            .orchestrator
            .resolve_approval(RunId::new(), ApprovalDecision::Approved, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, DeployflowError::NotFound(_)));

        harness.orchestrator.shutdown().await;
        assert!(harness.orchestrator.inner.run_locks.is_empty());
    }

    #[tokio::test]
    async fn test_run_locks_released_after_contention() {
        let harness = TestHarness::new();
        let awaiting = harness.start_and_settle(PIPELINE, "abc123").await.unwrap();

        let stops: Vec<_> = (0..8)
            .map(|_| {
                let orchestrator = harness.orchestrator.clone();
                tokio::spawn(async move { orchestrator.stop_run(awaiting.run_id).await })
            })
            .collect();
        let mut stopped = 0;
        for stop in stops {
            if stop.await.unwrap().is_ok() {
                stopped += 1;
            }
        }

        assert_eq!(stopped, 1);
        harness.orchestrator.shutdown().await;
        assert!(harness.orchestrator.inner.run_locks.is_empty());
    }

    #[tokio::test]
    async fn test_uncached_deploy_failure_still_rolls_back() {
        let faulty = Arc::new(FaultyRunStore::new(Arc::new(InMemoryRunStore::new())));
        let harness = HarnessBuilder::new()
            .with_faulty_store(faulty.clone())
            .with_backend(
                RecordingBackend::new().with_deploy_error(DeployError::Failed("bad AMI".into())),
            )
            .build();
        let awaiting = harness.start_and_settle(PIPELINE, "abc123").await.unwrap();
        assert_eq!(awaiting.status, RunStatus::AwaitingApproval);

        faulty.fail_cache_writes();
        harness
            .orchestrator
            .resolve_approval(awaiting.run_id, ApprovalDecision::Approved, "alice")
            .await
            .unwrap();
        let run = harness.settle(awaiting.run_id).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(harness.backend.deploy_count(), 1);
        assert_eq!(harness.backend.rollback_count(), 1);
        let deploy = run.last_result().unwrap();
        assert_eq!(deploy.stage_name, StageName::Deploy);
        assert!(deploy.rollback_attempted);
        assert!(matches!(deploy.failure, Some(FailureCause::DeploymentFailed { .. })));
    }

    #[tokio::test]
    async fn test_uncached_deploy_success_still_succeeds() {
        let faulty = Arc::new(FaultyRunStore::new(Arc::new(InMemoryRunStore::new())));
        faulty.fail_cache_writes();
        let harness = HarnessBuilder::new().with_faulty_store(faulty).build();

        let run = harness.run_approved(PIPELINE, "abc123").await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(harness.backend.rollback_count(), 0);
    }

    #[tokio::test]
    async fn test_unsaved_approval_fails_run_and_frees_pipeline() {
        let faulty = Arc::new(FaultyRunStore::new(Arc::new(InMemoryRunStore::new())));
        faulty.fail_approval_saves(1);
        let harness = HarnessBuilder::new().with_faulty_store(faulty).build();

        let run = harness.start_and_settle(PIPELINE, "abc123").await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.history_stages(), vec![StageName::Source, StageName::Build]);
        assert!(matches!(
            run.last_result().and_then(|r| r.failure.clone()),
            Some(FailureCause::Storage { .. })
        ));
        assert_eq!(harness.sink.event_types_for(run.run_id), vec![EventType::Failed]);
        assert!(harness.orchestrator.active_run(PIPELINE).await.unwrap().is_none());

        let next = harness.start_and_settle(PIPELINE, "def456").await.unwrap();
        assert_eq!(next.status, RunStatus::AwaitingApproval);
    }

    #[tokio::test]
    async fn test_unsaved_success_rolls_back_deploy() {
        let faulty = Arc::new(FaultyRunStore::new(Arc::new(InMemoryRunStore::new())));
        faulty.fail_run_saves(RunStatus::Succeeded, 1);
        let harness = HarnessBuilder::new().with_faulty_store(faulty).build();

        let run = harness.run_approved(PIPELINE, "abc123").await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(harness.backend.deploy_count(), 1);
        assert_eq!(harness.backend.rollback_count(), 1);
        assert_eq!(harness.backend.rolled_back(), vec![run.deploy_handle.clone().unwrap()]);

        let deploy = run.last_result().unwrap();
        assert_eq!(deploy.stage_name, StageName::Deploy);
        assert!(deploy.rollback_attempted);
        assert!(matches!(deploy.failure, Some(FailureCause::Storage { .. })));
        assert_eq!(
            harness.sink.event_types_for(run.run_id),
            vec![EventType::ApprovalRequested, EventType::Failed]
        );
        assert!(harness.orchestrator.active_run(PIPELINE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unsaved_failure_does_not_roll_back_twice() {
        let faulty = Arc::new(FaultyRunStore::new(Arc::new(InMemoryRunStore::new())));
        faulty.fail_run_saves(RunStatus::Failed, 1);
        let harness = HarnessBuilder::new()
            .with_faulty_store(faulty)
            .with_backend(
                RecordingBackend::new().with_deploy_error(DeployError::Failed("bad AMI".into())),
            )
            .build();

        let run = harness.run_approved(PIPELINE, "abc123").await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(harness.backend.rollback_count(), 1);
        assert!(run.last_result().unwrap().rollback_attempted);
    }
}
