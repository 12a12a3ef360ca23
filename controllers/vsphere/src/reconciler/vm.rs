//! VirtualMachine state machine.
//!
//! The forward path gates on terminal failure markers and unaddressable
//! devices, drives the address claims, converges the backend VM and
//! mirrors the observation into status. The delete path destroys the
//! backend VM, cleans up the cluster node best-effort, releases the
//! address claims and finally drops the finalizer.
//!
//! Two set-once fields are enforced here: `spec.biosUuid` is copied
//! from the backend exactly once and never overwritten, and
//! `status.vmRef` is populated once and kept stable.

use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, info};
use vsphere_client::{DesiredDevice, DesiredVm, Session, VmIdentity, VmService, VmState};

use crds::{
    mark_false, mark_true, Condition, ConditionSeverity, NetworkDeviceStatus, VirtualMachine,
    VirtualMachineStatus, DELETING_REASON, DELETION_FAILED_REASON, VM_FINALIZER,
    VM_PROVISIONED_CONDITION, WAITING_FOR_IP_ALLOCATION_REASON,
    WAITING_FOR_STATIC_IP_ALLOCATION_REASON,
};

use crate::error::ControllerError;
use crate::nodes::{NodeDeleter, NodeDeletion};
use crate::reconciler::claims::{self, ClaimStore};
use crate::reconciler::Outcome;

/// Delay before re-checking a powered-on VM that has not reported any
/// address yet.
const ADDRESS_WAIT_REQUEUE: Duration = Duration::from_secs(10);

/// Delay before retrying a node deletion the API refused.
const NODE_LOCKED_REQUEUE: Duration = Duration::from_secs(5);

pub(crate) fn status_mut(vm: &mut VirtualMachine) -> &mut VirtualMachineStatus {
    vm.status.get_or_insert_with(Default::default)
}

pub(crate) fn conditions_mut(vm: &mut VirtualMachine) -> &mut Vec<Condition> {
    &mut status_mut(vm).conditions
}

/// Adds the reconciler finalizer on a live VM that lacks it. Returns
/// true when it was added; the caller persists the object and stops
/// before any backend mutation, so the finalizer is guaranteed durable
/// by the time the first backend call happens. A VM already being
/// deleted never gains the finalizer.
pub(crate) fn ensure_finalizer(vm: &mut VirtualMachine) -> bool {
    if vm.metadata.deletion_timestamp.is_some() {
        return false;
    }
    if vm.finalizers().iter().any(|f| f == VM_FINALIZER) {
        return false;
    }
    vm.metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(VM_FINALIZER.to_string());
    true
}

fn identity(vm: &VirtualMachine) -> VmIdentity {
    VmIdentity {
        namespace: vm.metadata.namespace.clone().unwrap_or_default(),
        name: vm.name_any(),
    }
}

/// Flattens the CRD spec into the desired state handed to the backend.
fn desired_vm(vm: &VirtualMachine) -> DesiredVm {
    DesiredVm {
        identity: identity(vm),
        datacenter: vm.spec.datacenter.clone(),
        template: vm.spec.template.clone(),
        devices: vm
            .spec
            .network
            .devices
            .iter()
            .map(|d| DesiredDevice {
                network_name: d.network_name.clone(),
                dhcp4: d.dhcp4,
                dhcp6: d.dhcp6,
                ip_addrs: d.ip_addrs.clone(),
            })
            .collect(),
    }
}

/// Forward reconcile of a live VirtualMachine.
pub(crate) async fn reconcile_normal(
    vm: &mut VirtualMachine,
    session: &Session,
    vm_service: &dyn VmService,
    claims: &dyn ClaimStore,
) -> Result<Outcome, ControllerError> {
    let name = vm.name_any();

    // Terminal failures are honored, never retried.
    if let Some(status) = &vm.status {
        if status.failure_reason.is_some() || status.failure_message.is_some() {
            info!(vm = %name, "VM has a terminal failure, skipping reconcile");
            return Ok(Outcome::Done);
        }
    }

    // A device with no DHCP, no static address and no pool reference can
    // never obtain an address; wait for the spec to change.
    if vm
        .spec
        .network
        .devices
        .iter()
        .any(|d| d.waiting_for_static_ip())
    {
        info!(vm = %name, "at least one device is waiting for static IP configuration");
        mark_false(
            conditions_mut(vm),
            VM_PROVISIONED_CONDITION,
            WAITING_FOR_STATIC_IP_ALLOCATION_REASON,
            ConditionSeverity::Info,
            "",
        );
        return Ok(Outcome::Done);
    }

    claims::reconcile_address_claims(vm, claims).await?;

    let observed = vm_service.reconcile_vm(session, &desired_vm(vm)).await?;
    if observed.state != VmState::Ready {
        debug!(vm = %name, state = ?observed.state, "backend VM not ready yet");
        return Ok(Outcome::Done);
    }

    // A ready VM must expose its hardware id; an empty one would
    // silently break everything keyed on it.
    if observed.bios_uuid.is_empty() {
        return Err(ControllerError::InvariantViolation(format!(
            "backend reported VM {name} ready with an empty hardware id"
        )));
    }
    if vm
        .spec
        .bios_uuid
        .as_deref()
        .is_none_or(|existing| existing.is_empty())
    {
        vm.spec.bios_uuid = Some(observed.bios_uuid.clone());
    }

    let status = status_mut(vm);
    if status.vm_ref.as_deref().is_none_or(str::is_empty) && !observed.vm_ref.is_empty() {
        status.vm_ref = Some(observed.vm_ref.clone());
    }

    status.network = observed
        .network
        .iter()
        .map(|d| NetworkDeviceStatus {
            mac_addr: d.mac_addr.clone(),
            ip_addrs: d.ip_addrs.clone(),
            connected: d.connected,
            network_name: d.network_name.clone(),
        })
        .collect();
    status.addresses = observed
        .network
        .iter()
        .flat_map(|d| d.ip_addrs.iter().cloned())
        .collect();

    if status.addresses.is_empty() {
        info!(vm = %name, "backend VM is up but has no addresses yet");
        mark_false(
            conditions_mut(vm),
            VM_PROVISIONED_CONDITION,
            WAITING_FOR_IP_ALLOCATION_REASON,
            ConditionSeverity::Info,
            "",
        );
        return Ok(Outcome::RequeueAfter(ADDRESS_WAIT_REQUEUE));
    }

    status_mut(vm).ready = true;
    mark_true(conditions_mut(vm), VM_PROVISIONED_CONDITION);
    info!(vm = %name, "VM is ready");
    Ok(Outcome::Done)
}

/// Delete reconcile of a VirtualMachine carrying a deletion timestamp.
pub(crate) async fn reconcile_delete(
    vm: &mut VirtualMachine,
    session: &Session,
    vm_service: &dyn VmService,
    claims: &dyn ClaimStore,
    nodes: &dyn NodeDeleter,
) -> Result<Outcome, ControllerError> {
    let name = vm.name_any();
    info!(vm = %name, "deleting VM");
    mark_false(
        conditions_mut(vm),
        VM_PROVISIONED_CONDITION,
        DELETING_REASON,
        ConditionSeverity::Info,
        "",
    );

    let destroy = match vm_service.destroy_vm(session, &identity(vm)).await {
        Ok(result) => result,
        Err(e) => {
            mark_false(
                conditions_mut(vm),
                VM_PROVISIONED_CONDITION,
                DELETION_FAILED_REASON,
                ConditionSeverity::Warning,
                &e.to_string(),
            );
            return Err(ControllerError::Backend(e));
        }
    };

    if let Some(delay) = destroy.requeue_after {
        debug!(vm = %name, ?delay, "backend destroy still in progress");
        return Ok(Outcome::RequeueAfter(delay));
    }
    if destroy.vm.state != VmState::NotFound {
        info!(vm = %name, state = ?destroy.vm.state, "VM not yet removed from backend");
        return Ok(Outcome::Done);
    }

    // Node removal is best-effort; a locked API delays deletion, any
    // other failure must not block it.
    match nodes.delete_node(&name).await {
        Ok(NodeDeletion::Locked) => {
            debug!(vm = %name, "node deletion locked, retrying shortly");
            return Ok(Outcome::RequeueAfter(NODE_LOCKED_REQUEUE));
        }
        Ok(_) => {}
        Err(e) => debug!(vm = %name, error = %e, "node deletion failed, continuing"),
    }

    claims::release_address_claims(vm, claims).await?;

    if let Some(finalizers) = vm.metadata.finalizers.as_mut() {
        finalizers.retain(|f| f != VM_FINALIZER);
    }
    info!(vm = %name, "VM deleted");
    Ok(Outcome::Done)
}
