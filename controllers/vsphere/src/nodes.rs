//! Best-effort cluster node deletion on VM teardown.
//!
//! When a VM is destroyed its corresponding Node object (same name) is
//! deleted so the cluster does not accumulate stale nodes. Failures
//! here never block VM deletion; a locked API only delays it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::DeleteParams;
use kube::Api;
use tracing::debug;

use crate::error::ControllerError;

/// Outcome of a node deletion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeDeletion {
    /// The node existed and was deleted
    Deleted,
    /// No node by that name
    NotFound,
    /// The API refused for now; retry shortly
    Locked,
}

/// Deletes the Node matching a destroyed VM.
#[async_trait]
pub trait NodeDeleter: Send + Sync {
    /// Attempts to delete the node with the given name.
    async fn delete_node(&self, name: &str) -> Result<NodeDeletion, ControllerError>;
}

/// [`NodeDeleter`] backed by the cluster Node API.
pub struct KubeNodeDeleter {
    api: Api<Node>,
}

impl KubeNodeDeleter {
    /// Wraps the given Node API.
    pub fn new(api: Api<Node>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl NodeDeleter for KubeNodeDeleter {
    async fn delete_node(&self, name: &str) -> Result<NodeDeletion, ControllerError> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(node = name, "deleted cluster node");
                Ok(NodeDeletion::Deleted)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(NodeDeletion::NotFound),
            Err(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 429 => {
                Ok(NodeDeletion::Locked)
            }
            Err(e) => Err(ControllerError::Kube(e)),
        }
    }
}
