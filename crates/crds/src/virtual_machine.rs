//! VirtualMachine CRD
//!
//! Desired and observed state of one backend virtual machine. The
//! controller converges the backend VM to the spec and mirrors the
//! observed state (reference ids, per-device network status, flattened
//! address list, readiness) into the status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::references::PoolReference;

/// Finalizer owned by the VirtualMachine reconciler.
pub const VM_FINALIZER: &str = "vmops.microscaler.io/vm";

/// Condition tracking backend VM provisioning.
pub const VM_PROVISIONED_CONDITION: &str = "VMProvisioned";

/// Condition aggregating the state of the VM's address claims.
pub const IP_ADDRESS_CLAIMED_CONDITION: &str = "IPAddressClaimed";

/// A device has neither DHCP nor any static or pool-sourced address.
pub const WAITING_FOR_STATIC_IP_ALLOCATION_REASON: &str = "WaitingForStaticIPAllocation";

/// The backend VM is up but has not reported any address yet.
pub const WAITING_FOR_IP_ALLOCATION_REASON: &str = "WaitingForIPAllocation";

/// Some address claims were created this cycle and are pending.
pub const CLAIMS_BEING_CREATED_REASON: &str = "ClaimsBeingCreated";

/// Claims exist but the external allocator has not resolved them.
pub const WAITING_FOR_IP_ADDRESS_REASON: &str = "WaitingForIPAddress";

/// One or more address claims could not be created or patched.
pub const CLAIM_CREATION_FAILED_REASON: &str = "ClaimCreationFailed";

/// The VM is being deleted.
pub const DELETING_REASON: &str = "Deleting";

/// The backend refused or failed to destroy the VM.
pub const DELETION_FAILED_REASON: &str = "DeletionFailed";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vmops.microscaler.io",
    version = "v1alpha1",
    kind = "VirtualMachine",
    namespaced,
    status = "VirtualMachineStatus",
    shortname = "vm"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Backend server (vCenter) hostname
    pub server: String,

    /// Datacenter the VM lives in
    pub datacenter: String,

    /// TLS thumbprint of the backend server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbprint: Option<String>,

    /// Template the VM is cloned from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Unique hardware id assigned by the backend once the VM is ready.
    /// Set exactly once by the controller and never overwritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bios_uuid: Option<String>,

    /// Network configuration
    pub network: NetworkSpec,

    /// Name of the DeploymentZone constraining placement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Network devices attached to the VM
    #[serde(default)]
    pub devices: Vec<NetworkDeviceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDeviceSpec {
    /// Backend network (port group) the device attaches to
    pub network_name: String,

    /// Request an IPv4 address over DHCP
    #[serde(default)]
    pub dhcp4: bool,

    /// Request an IPv6 address over DHCP
    #[serde(default)]
    pub dhcp6: bool,

    /// Static addresses in CIDR notation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addrs: Vec<String>,

    /// Pools to claim addresses from, resolved by an external allocator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses_from_pools: Vec<PoolReference>,
}

impl NetworkDeviceSpec {
    /// True when the device has no way to obtain an address yet: no
    /// DHCP, no static address and no pool reference.
    pub fn waiting_for_static_ip(&self) -> bool {
        !self.dhcp4 && !self.dhcp6 && self.ip_addrs.is_empty() && self.addresses_from_pools.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Backend VM reference id. Set once, never changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_ref: Option<String>,

    /// True once the VM is up and has at least one address
    #[serde(default)]
    pub ready: bool,

    /// Per-device observed network status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<NetworkDeviceStatus>,

    /// Flattened list of all observed addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,

    /// Terminal failure reason; once set the VM is never reconciled again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Terminal failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Health conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Observed state of one network device, mirrored from the backend.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDeviceStatus {
    /// MAC address assigned by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_addr: Option<String>,

    /// Addresses observed on the device
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addrs: Vec<String>,

    /// Whether the device is connected
    #[serde(default)]
    pub connected: bool,

    /// Backend network the device is attached to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
}
