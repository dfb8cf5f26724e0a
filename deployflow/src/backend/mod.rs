//! Collaborator contracts: provisioning backend, source and build providers.
//!
//! The orchestrator never provisions infrastructure itself. It hands build
//! artifacts to a [`ProvisioningBackend`] and asks it to revert rollouts;
//! how instances, load balancers or scaling groups are managed is up to the
//! implementation.

mod ports;

pub use ports::{BuildProvider, SourceProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::artifacts::Artifact;
use crate::core::DeployHandle;

/// A rollout request.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Handle the backend must report the rollout under.
    pub handle: DeployHandle,
    /// The pipeline being deployed.
    pub pipeline_id: String,
    /// The build artifact to roll out.
    pub artifact: Artifact,
}

/// Health of a finished rollout, as seen by the backend's alarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No alarm is active.
    Healthy,
    /// An alarm is active for the deployment target.
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Rollout errors reported by the backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeployError {
    /// The rollout failed.
    #[error("deployment failed: {0}")]
    Failed(String),
    /// The rollout was stopped before completing.
    #[error("deployment stopped: {0}")]
    Stopped(String),
}

/// The infrastructure control plane deployments are delegated to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Rolls out the request's artifact and returns its handle.
    async fn deploy(&self, request: &DeployRequest) -> Result<DeployHandle, DeployError>;

    /// Reverts a rollout to the previous revision.
    async fn rollback(&self, handle: &DeployHandle) -> anyhow::Result<()>;

    /// Reports the alarm state of a rollout.
    async fn health_status(&self, handle: &DeployHandle) -> anyhow::Result<HealthStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_error_display() {
        assert_eq!(
            DeployError::Stopped("operator".to_string()).to_string(),
            "deployment stopped: operator"
        );
    }

    #[test]
    fn test_health_status_serialize() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            r#""unhealthy""#
        );
    }
}
