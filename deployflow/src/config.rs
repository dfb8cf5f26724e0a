//! Configuration for the orchestrator and its collaborators.
//!
//! Configuration is a JSON document; every field has a default so an empty
//! object is valid. `DEPLOYFLOW_*` environment variables override the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::FailureCause;
use crate::errors::{DeployflowError, Result};
use crate::utils::{validate_channel, validate_pipeline_id};

/// Environment variable overriding [`DeployflowConfig::data_dir`].
pub const ENV_DATA_DIR: &str = "DEPLOYFLOW_DATA_DIR";
/// Environment variable overriding [`LoggingConfig::filter`].
pub const ENV_LOG: &str = "DEPLOYFLOW_LOG";
/// Environment variable overriding [`LoggingConfig::json`].
pub const ENV_LOG_JSON: &str = "DEPLOYFLOW_LOG_JSON";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployflowConfig {
    /// Directory for durable run and artifact storage.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Logging setup.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Stage execution settings.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Notification delivery settings.
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// How stages get scheduled.
    #[serde(default)]
    pub dispatch: DispatchMode,
    /// Known pipelines.
    #[serde(default)]
    pub pipelines: Vec<PipelineDefinition>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./deployflow-data")
}

impl Default for DeployflowConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            logging: LoggingConfig::default(),
            executor: ExecutorConfig::default(),
            notifications: NotificationConfig::default(),
            dispatch: DispatchMode::default(),
            pipelines: Vec::new(),
        }
    }
}

impl DeployflowConfig {
    /// Loads configuration from a JSON file, then applies environment overrides.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DeployflowError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: Self = serde_json::from_str(&raw).map_err(|e| {
            DeployflowError::Config(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies `DEPLOYFLOW_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(filter) = lookup(ENV_LOG) {
            self.logging.filter = filter;
        }
        if let Some(json) = lookup(ENV_LOG_JSON) {
            self.logging.json = matches!(json.as_str(), "1" | "true" | "yes");
        }
    }

    /// Checks pipeline definitions and numeric settings.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for pipeline in &self.pipelines {
            validate_pipeline_id(&pipeline.pipeline_id)
                .map_err(|e| DeployflowError::Config(e.to_string()))?;
            if !seen.insert(pipeline.pipeline_id.as_str()) {
                return Err(DeployflowError::Config(format!(
                    "pipeline '{}' is defined twice",
                    pipeline.pipeline_id
                )));
            }
            for channel in &pipeline.notification_channels {
                validate_channel(channel).map_err(|e| DeployflowError::Config(e.to_string()))?;
            }
        }

        if self.notifications.max_attempts == 0 {
            return Err(DeployflowError::Config(
                "notifications.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Looks up a pipeline definition by id.
    #[must_use]
    pub fn pipeline(&self, pipeline_id: &str) -> Option<&PipelineDefinition> {
        self.pipelines.iter().find(|p| p.pipeline_id == pipeline_id)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "deployflow=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

/// Stage execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Time budget for fetching source, in seconds.
    #[serde(default = "default_source_timeout")]
    pub source_timeout_seconds: f64,
    /// Time budget for a build, in seconds.
    #[serde(default = "default_build_timeout")]
    pub build_timeout_seconds: f64,
    /// Time budget for a rollout, in seconds.
    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout_seconds: f64,
    /// Which deploy outcomes are rolled back automatically.
    #[serde(default)]
    pub auto_rollback: AutoRollbackConfig,
}

fn default_source_timeout() -> f64 {
    300.0
}

fn default_build_timeout() -> f64 {
    3600.0
}

fn default_deploy_timeout() -> f64 {
    3600.0
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            source_timeout_seconds: default_source_timeout(),
            build_timeout_seconds: default_build_timeout(),
            deploy_timeout_seconds: default_deploy_timeout(),
            auto_rollback: AutoRollbackConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Sets every stage timeout to `seconds`.
    #[must_use]
    pub fn with_timeouts(mut self, seconds: f64) -> Self {
        self.source_timeout_seconds = seconds;
        self.build_timeout_seconds = seconds;
        self.deploy_timeout_seconds = seconds;
        self
    }

    /// Sets the auto-rollback policy.
    #[must_use]
    pub fn with_auto_rollback(mut self, policy: AutoRollbackConfig) -> Self {
        self.auto_rollback = policy;
        self
    }

    /// Source timeout as a Duration.
    #[must_use]
    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.source_timeout_seconds)
    }

    /// Build timeout as a Duration.
    #[must_use]
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.build_timeout_seconds)
    }

    /// Deploy timeout as a Duration.
    #[must_use]
    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.deploy_timeout_seconds)
    }
}

/// Automatic rollback policy for the Deploy stage.
///
/// Failed and stopped rollouts are reverted. A rollout that completes while
/// an alarm is active is kept unless `deployment_in_alarm` is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoRollbackConfig {
    /// Roll back a completed rollout whose health check is in alarm.
    #[serde(default)]
    pub deployment_in_alarm: bool,
    /// Roll back a rollout the backend reports as failed (or that timed out).
    #[serde(default = "enabled")]
    pub failed_deployment: bool,
    /// Roll back a rollout the backend reports as stopped.
    #[serde(default = "enabled")]
    pub stopped_deployment: bool,
}

fn enabled() -> bool {
    true
}

impl Default for AutoRollbackConfig {
    fn default() -> Self {
        Self {
            deployment_in_alarm: false,
            failed_deployment: true,
            stopped_deployment: true,
        }
    }
}

impl AutoRollbackConfig {
    /// Returns true if a Deploy failure with `cause` should be rolled back.
    #[must_use]
    pub fn allows(&self, cause: &FailureCause) -> bool {
        match cause {
            FailureCause::DeploymentInAlarm => self.deployment_in_alarm,
            FailureCause::DeploymentStopped { .. } => self.stopped_deployment,
            _ => self.failed_deployment,
        }
    }
}

/// Notification delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Delivery attempts per subscriber, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial delay between attempts in milliseconds; doubles per attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Randomize delays between half and the full backoff.
    #[serde(default = "enabled")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            jitter: true,
        }
    }
}

/// How the orchestrator schedules stages after a transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Spawn the stage executor for every scheduled stage.
    #[default]
    Automatic,
    /// Only record the schedule; an external driver calls `advance`.
    Manual,
}

/// A pipeline and its notification subscribers.
///
/// Where the source comes from and how it is built is up to the
/// [`SourceProvider`](crate::backend::SourceProvider) and
/// [`BuildProvider`](crate::backend::BuildProvider) wired into the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline identifier.
    pub pipeline_id: String,
    /// Subscriber channels for run notifications, e.g. `email:ops@example.com`.
    #[serde(default)]
    pub notification_channels: Vec<String>,
}

impl PipelineDefinition {
    /// Creates a definition with no subscribers.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            notification_channels: Vec::new(),
        }
    }

    /// Adds a notification channel.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.notification_channels.push(channel.into());
        self
    }
}
