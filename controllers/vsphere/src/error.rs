//! Controller-specific error types.
//!
//! The variants map onto how the workers treat a failed reconcile:
//! anything transient (Kube, Backend) is retried with backoff, while
//! `InvalidConfig` and `InvariantViolation` need a spec or operator
//! change and will keep failing until one happens.

use kube::Error as KubeError;
use thiserror::Error;
use vsphere_client::VsphereError;

/// Errors that can occur in the vSphere Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// vSphere backend error
    #[error("vSphere error: {0}")]
    Backend(#[from] VsphereError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The FailureDomain a DeploymentZone points at does not exist
    #[error("FailureDomain not found: {0}")]
    FailureDomainNotFound(String),

    /// A DeploymentZone cannot be deleted while machines use it
    #[error("DeploymentZone {zone} is in use by: {blockers}")]
    ZoneInUse { zone: String, blockers: String },

    /// The backend reported a state that must never occur
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// One or more address claims failed to create or patch
    #[error("address claim errors: {}", .0.join("; "))]
    ClaimAggregate(Vec<String>),

    /// Serialization of a resource for patching failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Multiple independent failures from one reconcile pass
    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Aggregate(Vec<ControllerError>),
}
