//! Wire models exchanged with the backend VM service.
//!
//! These are the client-side mirrors of the VirtualMachine CRD: the
//! controller flattens the CRD spec into a `DesiredVm` and maps the
//! returned `ObservedVm` back into the CRD status.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Namespace/name identity of a VM resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VmIdentity {
    /// Kubernetes namespace of the resource
    pub namespace: String,
    /// Resource (and backend VM) name
    pub name: String,
}

impl std::fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Desired state handed to `VmService::reconcile_vm`.
#[derive(Debug, Clone)]
pub struct DesiredVm {
    /// Identity of the VM
    pub identity: VmIdentity,
    /// Datacenter the VM is created in
    pub datacenter: String,
    /// Template to clone from
    pub template: Option<String>,
    /// Desired network devices
    pub devices: Vec<DesiredDevice>,
}

/// Desired configuration of one network device.
#[derive(Debug, Clone)]
pub struct DesiredDevice {
    /// Backend network (port group) name
    pub network_name: String,
    /// IPv4 over DHCP
    pub dhcp4: bool,
    /// IPv6 over DHCP
    pub dhcp6: bool,
    /// Static addresses in CIDR notation
    pub ip_addrs: Vec<String>,
}

/// Lifecycle state of the backend VM as observed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VmState {
    /// No VM with this identity exists in the backend
    NotFound,
    /// Creation or configuration is still in progress
    Provisioning,
    /// The VM is powered on and fully configured
    Ready,
}

/// Snapshot of the backend VM returned by every service call.
#[derive(Debug, Clone)]
pub struct ObservedVm {
    /// Backend VM name
    pub name: String,
    /// Lifecycle state
    pub state: VmState,
    /// Unique hardware id (BIOS UUID). Empty until the VM is ready.
    pub bios_uuid: String,
    /// Backend reference id (managed object reference)
    pub vm_ref: String,
    /// Per-device observed network state
    pub network: Vec<ObservedNetworkDevice>,
}

impl ObservedVm {
    /// An observation for a VM absent from the backend.
    pub fn not_found(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: VmState::NotFound,
            bios_uuid: String::new(),
            vm_ref: String::new(),
            network: Vec::new(),
        }
    }
}

/// Observed state of one network device.
#[derive(Debug, Clone, Default)]
pub struct ObservedNetworkDevice {
    /// MAC address assigned by the backend
    pub mac_addr: Option<String>,
    /// Observed addresses
    pub ip_addrs: Vec<String>,
    /// Link state
    pub connected: bool,
    /// Backend network the device is attached to
    pub network_name: Option<String>,
}

/// Result of a destroy request.
///
/// A populated `requeue_after` means the backend accepted the request
/// but needs more time; the caller should re-check later rather than
/// block.
#[derive(Debug, Clone)]
pub struct DestroyResult {
    /// Re-check delay requested by the backend
    pub requeue_after: Option<Duration>,
    /// Observed VM state after the destroy attempt
    pub vm: ObservedVm,
}
