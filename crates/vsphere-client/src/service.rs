//! Backend service contracts consumed by the controllers.
//!
//! The concrete implementation drives the vCenter REST API and is
//! injected at process start; tests substitute the mock
//! implementations from [`crate::mock`].

use crate::error::VsphereError;
use crate::models::{DesiredVm, DestroyResult, ObservedVm, VmIdentity};
use crate::session::Session;

/// Converges one backend VM toward a desired spec.
///
/// Both operations are level-triggered: they may be called arbitrarily
/// often for the same VM and must return the current observation rather
/// than blocking on long-running backend tasks.
#[async_trait::async_trait]
pub trait VmService: Send + Sync {
    /// Create the VM if absent, otherwise converge its configuration.
    /// Returns the observed state after this step; callers wait for a
    /// future event while the state is not `Ready`.
    async fn reconcile_vm(
        &self,
        session: &Session,
        desired: &DesiredVm,
    ) -> Result<ObservedVm, VsphereError>;

    /// Ask the backend to destroy the VM. A `requeue_after` in the
    /// result means the destroy task is still running; the VM is gone
    /// only once the observed state is `NotFound`.
    async fn destroy_vm(
        &self,
        session: &Session,
        identity: &VmIdentity,
    ) -> Result<DestroyResult, VsphereError>;
}

/// Inventory existence lookups used for placement validation.
#[async_trait::async_trait]
pub trait InventoryService: Send + Sync {
    /// Resolves a resource pool by inventory path; `NotFound` when the
    /// pool does not exist.
    async fn find_resource_pool(&self, session: &Session, path: &str) -> Result<(), VsphereError>;

    /// Resolves a folder by inventory path; `NotFound` when the folder
    /// does not exist.
    async fn find_folder(&self, session: &Session, path: &str) -> Result<(), VsphereError>;
}
