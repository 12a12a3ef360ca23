//! DeploymentZone CRD
//!
//! A named placement scope constraining where VMs may be created.
//! References a FailureDomain (shared by multiple zones) and carries a
//! placement constraint validated against live backend inventory.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::Condition;

/// Finalizer owned by the DeploymentZone reconciler.
pub const DEPLOYMENT_ZONE_FINALIZER: &str = "vmops.microscaler.io/deployment-zone";

/// Condition tracking placement constraint validation.
pub const PLACEMENT_CONSTRAINT_MET_CONDITION: &str = "PlacementConstraintMet";

/// The configured resource pool does not exist in the backend inventory.
pub const RESOURCE_POOL_NOT_FOUND_REASON: &str = "ResourcePoolNotFound";

/// The configured folder does not exist in the backend inventory.
pub const FOLDER_NOT_FOUND_REASON: &str = "FolderNotFound";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vmops.microscaler.io",
    version = "v1alpha1",
    kind = "DeploymentZone",
    status = "DeploymentZoneStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentZoneSpec {
    /// Backend server (vCenter) hostname
    pub server: String,

    /// Name of the FailureDomain this zone places workloads into
    pub failure_domain: String,

    /// Placement constraint validated against backend inventory
    #[serde(default)]
    pub placement_constraint: PlacementConstraint,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlacementConstraint {
    /// Resource pool VMs are created under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,

    /// Inventory folder VMs are created in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentZoneStatus {
    /// True once the failure domain and placement constraint validate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,

    /// Health conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
