//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use vsphere_client::{Session, SessionParams};

use crds::{
    AddressClaim, AddressClaimSpec, DeploymentZone, DeploymentZoneSpec, FailureDomain,
    FailureDomainSpec, NetworkDeviceSpec, NetworkSpec, PlacementConstraint, PoolReference,
    Topology, VirtualMachine, VirtualMachineSpec,
};

use crate::error::ControllerError;
use crate::nodes::{NodeDeleter, NodeDeletion};
use crate::reconciler::claims::ClaimStore;

pub fn base_vm(name: &str) -> VirtualMachine {
    VirtualMachine {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        spec: VirtualMachineSpec {
            server: "vc.example.com".to_string(),
            datacenter: "dc0".to_string(),
            thumbprint: None,
            template: Some("ubuntu-2204".to_string()),
            bios_uuid: None,
            network: NetworkSpec {
                devices: vec![NetworkDeviceSpec {
                    network_name: "VM Network".to_string(),
                    dhcp4: true,
                    dhcp6: false,
                    ip_addrs: Vec::new(),
                    addresses_from_pools: Vec::new(),
                }],
            },
            failure_domain: None,
        },
        status: None,
    }
}

/// A VM with one device claiming from the given number of pools.
pub fn pooled_vm(name: &str, pools: usize) -> VirtualMachine {
    let mut vm = base_vm(name);
    vm.spec.network.devices[0].dhcp4 = false;
    vm.spec.network.devices[0].addresses_from_pools = (0..pools)
        .map(|i| PoolReference::new("ipam.example.io", "InClusterIPPool", &format!("pool-{i}")))
        .collect();
    vm
}

pub fn deleting_vm(name: &str) -> VirtualMachine {
    let mut vm = base_vm(name);
    vm.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    vm.metadata.finalizers = Some(vec![crds::VM_FINALIZER.to_string()]);
    vm
}

pub fn base_claim(name: &str) -> AddressClaim {
    AddressClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: AddressClaimSpec {
            pool_ref: PoolReference::new("ipam.example.io", "InClusterIPPool", "pool-0"),
        },
        status: None,
    }
}

pub fn base_zone(name: &str, failure_domain: &str) -> DeploymentZone {
    DeploymentZone {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        spec: DeploymentZoneSpec {
            server: "vc.example.com".to_string(),
            failure_domain: failure_domain.to_string(),
            placement_constraint: PlacementConstraint::default(),
        },
        status: None,
    }
}

pub fn base_failure_domain(name: &str) -> FailureDomain {
    FailureDomain {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: FailureDomainSpec {
            region: "region-1".to_string(),
            zone: "zone-1".to_string(),
            topology: Topology {
                datacenter: "dc0".to_string(),
                compute_cluster: None,
                datastore: None,
                networks: Vec::new(),
            },
        },
    }
}

pub fn test_session() -> Session {
    Session::new(
        "test-token".to_string(),
        &SessionParams {
            server: "vc.example.com".to_string(),
            datacenter: "dc0".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            thumbprint: None,
        },
    )
}

/// In-memory [`ClaimStore`] recording claims by name.
#[derive(Default)]
pub struct InMemoryClaimStore {
    claims: Mutex<HashMap<String, AddressClaim>>,
    fail_creates_for: Mutex<Vec<String>>,
}

impl InMemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds a claim, as if it survived from an earlier reconcile.
    pub fn insert(&self, claim: AddressClaim) {
        self.claims
            .lock()
            .unwrap()
            .insert(claim.name_any(), claim);
    }

    /// Makes `create` fail for the given claim name.
    pub fn fail_create(&self, name: &str) {
        self.fail_creates_for.lock().unwrap().push(name.to_string());
    }

    pub fn get_sync(&self, name: &str) -> Option<AddressClaim> {
        self.claims.lock().unwrap().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.claims.lock().unwrap().len()
    }

    /// Marks a stored claim fulfilled, as the external allocator would.
    pub fn fulfill(&self, name: &str, address_ref: &str) {
        let mut claims = self.claims.lock().unwrap();
        if let Some(claim) = claims.get_mut(name) {
            claim.status.get_or_insert_with(Default::default).address_ref =
                Some(address_ref.to_string());
        }
    }

    /// Sets the allocator-owned Ready condition on a stored claim.
    pub fn set_ready_condition(&self, name: &str, ready: bool) {
        let mut claims = self.claims.lock().unwrap();
        if let Some(claim) = claims.get_mut(name) {
            let conditions = &mut claim.status.get_or_insert_with(Default::default).conditions;
            if ready {
                crds::mark_true(conditions, crds::READY_CONDITION);
            } else {
                crds::mark_false(
                    conditions,
                    crds::READY_CONDITION,
                    "AllocationPending",
                    crds::ConditionSeverity::Info,
                    "",
                );
            }
        }
    }
}

#[async_trait]
impl ClaimStore for InMemoryClaimStore {
    async fn get(&self, name: &str) -> Result<Option<AddressClaim>, ControllerError> {
        Ok(self.claims.lock().unwrap().get(name).cloned())
    }

    async fn create(&self, claim: &AddressClaim) -> Result<AddressClaim, ControllerError> {
        let name = claim.name_any();
        if self.fail_creates_for.lock().unwrap().contains(&name) {
            return Err(ControllerError::InvalidConfig(format!(
                "create rejected for {name}"
            )));
        }
        self.claims.lock().unwrap().insert(name, claim.clone());
        Ok(claim.clone())
    }

    async fn update(&self, claim: &AddressClaim) -> Result<AddressClaim, ControllerError> {
        self.claims
            .lock()
            .unwrap()
            .insert(claim.name_any(), claim.clone());
        Ok(claim.clone())
    }
}

/// Scripted [`NodeDeleter`] recording the nodes it was asked to delete.
#[derive(Default)]
pub struct MockNodeDeleter {
    pub deleted: Mutex<Vec<String>>,
    outcome: Mutex<Option<Result<NodeDeletion, ControllerError>>>,
}

impl MockNodeDeleter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(outcome: Result<NodeDeletion, ControllerError>) -> Self {
        Self {
            deleted: Mutex::new(Vec::new()),
            outcome: Mutex::new(Some(outcome)),
        }
    }
}

#[async_trait]
impl NodeDeleter for MockNodeDeleter {
    async fn delete_node(&self, name: &str) -> Result<NodeDeletion, ControllerError> {
        self.deleted.lock().unwrap().push(name.to_string());
        self.outcome
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Ok(NodeDeletion::Deleted))
    }
}
