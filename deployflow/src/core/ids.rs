//! Identifier types for runs, artifacts and deployments.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new time-ordered identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier of a pipeline run.
    RunId
);

uuid_id!(
    /// Unique identifier of a stored artifact.
    ArtifactId
);

uuid_id!(
    /// Identifier of a single rollout against the provisioning backend.
    DeploymentId
);

/// Opaque reference to a rollout, used for health checks and rollback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeployHandle {
    /// The deployment identifier.
    pub deployment_id: DeploymentId,
    /// The run that requested the rollout.
    pub run_id: RunId,
    /// The build artifact being rolled out.
    pub artifact_id: ArtifactId,
}

impl DeployHandle {
    /// Creates a handle for a new rollout of `artifact_id` on behalf of `run_id`.
    #[must_use]
    pub fn new(run_id: RunId, artifact_id: ArtifactId) -> Self {
        Self {
            deployment_id: DeploymentId::new(),
            run_id,
            artifact_id,
        }
    }
}

impl fmt::Display for DeployHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deployment {} (run {})", self.deployment_id, self.run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_parse_roundtrip() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_run_id_serializes_as_plain_string() {
        let id = RunId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn test_deploy_handles_are_unique_per_rollout() {
        let run_id = RunId::new();
        let artifact_id = ArtifactId::new();
        let a = DeployHandle::new(run_id, artifact_id);
        let b = DeployHandle::new(run_id, artifact_id);
        assert_ne!(a.deployment_id, b.deployment_id);
    }
}
