//! Orchestrator construction.

use std::sync::Arc;

use super::PipelineOrchestrator;
use crate::config::DispatchMode;
use crate::errors::{DeployflowError, Result};
use crate::executor::StageExecutor;
use crate::notifications::{LoggingNotificationSink, NotificationSink};
use crate::storage::RunStore;

/// Builder for a [`PipelineOrchestrator`].
///
/// The run store and the stage executor are required; notifications default
/// to the log and dispatch defaults to [`DispatchMode::Automatic`].
pub struct OrchestratorBuilder {
    store: Option<Arc<dyn RunStore>>,
    executor: Option<Arc<StageExecutor>>,
    notifier: Arc<dyn NotificationSink>,
    dispatch: DispatchMode,
}

impl OrchestratorBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: None,
            executor: None,
            notifier: Arc::new(LoggingNotificationSink),
            dispatch: DispatchMode::default(),
        }
    }

    /// Sets the durable run store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the stage executor.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<StageExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the notification sink.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Sets the dispatch mode.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the store or executor is missing.
    pub fn build(self) -> Result<PipelineOrchestrator> {
        let store = self
            .store
            .ok_or_else(|| DeployflowError::Config("orchestrator requires a run store".into()))?;
        let executor = self
            .executor
            .ok_or_else(|| DeployflowError::Config("orchestrator requires an executor".into()))?;

        Ok(PipelineOrchestrator::from_parts(
            store,
            executor,
            self.notifier,
            self.dispatch,
        ))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
