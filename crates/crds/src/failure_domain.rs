//! FailureDomain CRD
//!
//! A shared failure-domain description (region/zone plus backend
//! topology). Ownership is tracked through owner references from the
//! DeploymentZones using it; the zone reconciler deletes a
//! FailureDomain only once its owner-reference set is empty.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vmops.microscaler.io",
    version = "v1alpha1",
    kind = "FailureDomain"
)]
#[serde(rename_all = "camelCase")]
pub struct FailureDomainSpec {
    /// Region label applied to placed workloads
    pub region: String,

    /// Zone label applied to placed workloads
    pub zone: String,

    /// Backend topology the domain maps to
    pub topology: Topology,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    /// Datacenter the domain lives in
    pub datacenter: String,

    /// Compute cluster within the datacenter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_cluster: Option<String>,

    /// Datastore used for placed VMs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,

    /// Networks available in the domain
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,
}
