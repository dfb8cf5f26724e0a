//! # Deployflow
//!
//! A deployment pipeline orchestrator.
//!
//! Every run of a pipeline moves through four stages:
//!
//! - **Source**: fetch the commit into the artifact store
//! - **Build**: turn the source snapshot into a deployable bundle
//! - **Approve**: suspend until a human approves or rejects the rollout
//! - **Deploy**: hand the bundle to a provisioning backend, rolling back
//!   failed rollouts
//!
//! Terminal runs (`Succeeded`, `Failed`, `Stopped`, `RolledBack`) publish a
//! notification to the pipeline's subscribers, as does a run reaching the
//! approval gate. Infrastructure itself is out of scope: it lives behind the
//! [`backend::ProvisioningBackend`] trait.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use deployflow::prelude::*;
//!
//! let executor = StageExecutor::new(artifacts, source, build, backend, store.clone());
//! let orchestrator = PipelineOrchestrator::builder()
//!     .with_store(store)
//!     .with_executor(Arc::new(executor))
//!     .with_notifier(Arc::new(FanoutNotificationSink::from_definitions(
//!         &config.pipelines,
//!         &config.notifications,
//!     )))
//!     .build()?;
//!
//! orchestrator.recover().await?;
//! let run = orchestrator.start_run("web", "abc123").await?;
//! let run = orchestrator.wait_for_settled(run.run_id).await?;
//! orchestrator
//!     .resolve_approval(run.run_id, ApprovalDecision::Approved, "alice")
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifacts;
pub mod backend;
pub mod config;
pub mod core;
pub mod errors;
pub mod executor;
pub mod notifications;
pub mod observability;
pub mod orchestrator;
pub mod storage;
pub mod testing;
pub mod triggers;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::{Artifact, ArtifactStore, FsArtifactStore, InMemoryArtifactStore};
    pub use crate::backend::{
        BuildProvider, DeployError, DeployRequest, HealthStatus, ProvisioningBackend,
        SourceProvider,
    };
    pub use crate::config::{
        AutoRollbackConfig, DeployflowConfig, DispatchMode, ExecutorConfig, PipelineDefinition,
    };
    pub use crate::core::{
        ApprovalDecision, ApprovalRequest, ArtifactId, DeployHandle, EventType, FailureCause,
        NotificationEvent, Run, RunId, RunStatus, RunTarget, StageName, StageOutcome, StageResult,
    };
    pub use crate::errors::{DeployflowError, Result};
    pub use crate::executor::StageExecutor;
    pub use crate::notifications::{
        FanoutNotificationSink, LoggingNotificationSink, NotificationSink, Subscriber,
    };
    pub use crate::observability::init_tracing;
    pub use crate::orchestrator::PipelineOrchestrator;
    pub use crate::storage::{FsRunStore, InMemoryRunStore, RunStore};
    pub use crate::triggers::Trigger;
    pub use std::sync::Arc;
}
