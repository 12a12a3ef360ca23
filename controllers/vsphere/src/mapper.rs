//! Cross-resource event mapping.
//!
//! Watch events on secondary resources (VmCluster, AddressClaim,
//! FailureDomain) are translated here into work keys for the primary
//! resources they affect. The functions are pure; the watcher supplies
//! the listed resources and the previous pause state.

use crds::{AddressClaim, DeploymentZone, VirtualMachine, VmCluster, CLUSTER_NAME_LABEL};
use kube::ResourceExt;

use crate::queue::WorkKey;

/// Backend-connection fields of a VmCluster that its VMs depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConnection {
    pub server: String,
    pub thumbprint: Option<String>,
}

/// Extracts the comparable connection fields from a cluster.
pub fn cluster_connection(cluster: &VmCluster) -> ClusterConnection {
    ClusterConnection {
        server: cluster.spec.server.clone(),
        thumbprint: cluster.spec.thumbprint.clone(),
    }
}

/// Update-only predicate for cluster connection changes.
///
/// Fires when the comparable fields differ from the previously observed
/// state; the first observation and deletions never fire.
pub fn cluster_connection_changed(
    previous: Option<&ClusterConnection>,
    now: &ClusterConnection,
) -> bool {
    previous.is_some_and(|prev| prev != now)
}

/// Work keys for every VM in the list that belongs to the cluster. The
/// API list is already label-selected; the filter keeps the mapping
/// correct for callers listing more broadly.
pub fn cluster_vm_keys(vms: &[VirtualMachine], cluster_name: &str) -> Vec<WorkKey> {
    vms.iter()
        .filter(|vm| vm_belongs_to_cluster(vm, cluster_name))
        .filter_map(|vm| vm.metadata.name.clone())
        .map(|name| WorkKey::VirtualMachine { name })
        .collect()
}

/// True when the VM carries the cluster-name label pointing at the
/// given cluster.
pub fn vm_belongs_to_cluster(vm: &VirtualMachine, cluster_name: &str) -> bool {
    vm.labels()
        .get(CLUSTER_NAME_LABEL)
        .is_some_and(|v| v == cluster_name)
}

/// Maps an AddressClaim to the VirtualMachine owning it, via the
/// controller owner reference set at claim creation.
pub fn owner_vm_key(claim: &AddressClaim) -> Option<WorkKey> {
    claim
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.kind == "VirtualMachine")
        .map(|r| WorkKey::VirtualMachine {
            name: r.name.clone(),
        })
}

/// Work keys for every DeploymentZone referencing the failure domain.
pub fn zone_keys_for_failure_domain(
    zones: &[DeploymentZone],
    failure_domain: &str,
) -> Vec<WorkKey> {
    zones
        .iter()
        .filter(|z| z.spec.failure_domain == failure_domain)
        .filter_map(|z| z.metadata.name.clone())
        .map(|name| WorkKey::DeploymentZone { name })
        .collect()
}

/// Pause-transition filter for cluster events.
///
/// A cluster event fans out to its VMs only when the pause state
/// actually changed in a way the VMs must see: an unpause (they were
/// skipping work and must catch up) or a first observation that is
/// already paused (so a reconcile in flight can record the pause).
/// Steady-state updates produce no wake-ups.
pub fn cluster_wakes_vms(previous_paused: Option<bool>, paused_now: bool) -> bool {
    match previous_paused {
        Some(prev) => prev && !paused_now,
        None => paused_now,
    }
}
