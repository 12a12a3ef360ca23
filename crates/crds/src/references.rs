//! Kubernetes object references for VMops CRDs
//!
//! Follows the Kubernetes `TypedLocalObjectReference` pattern with
//! apiGroup, kind and name, used for address-pool references on
//! VirtualMachine network devices and on AddressClaims.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the VMops CRDs.
pub const API_GROUP: &str = "vmops.microscaler.io";

/// API version string of the VMops CRDs.
pub const API_VERSION: &str = "vmops.microscaler.io/v1alpha1";

/// Label associating a resource with its owning cluster.
pub const CLUSTER_NAME_LABEL: &str = "vmops.microscaler.io/cluster-name";

/// Annotation pausing reconciliation of a resource or a whole cluster.
pub const PAUSED_ANNOTATION: &str = "vmops.microscaler.io/paused";

/// Typed reference to a pool object resolved by an external allocator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolReference {
    /// API group of the referenced pool (e.g. "ipam.cluster.x-k8s.io")
    pub api_group: String,

    /// Kind of the referenced pool (e.g. "InClusterIPPool")
    pub kind: String,

    /// Name of the referenced pool
    pub name: String,
}

impl PoolReference {
    /// Create a new pool reference.
    pub fn new(api_group: &str, kind: &str, name: &str) -> Self {
        Self {
            api_group: api_group.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

/// Reference to a secret holding backend credentials.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityReference {
    /// Name of the secret in the cluster's namespace
    pub name: String,
}
