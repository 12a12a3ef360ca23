//! Address-claim sub-reconciler.
//!
//! For every (device, poolRef) pair on a VirtualMachine one
//! AddressClaim exists under a deterministic name. Claims are created
//! or patched idempotently; resolution is left to an external
//! allocator, and the aggregate progress is reported through the
//! IPAddressClaimed condition on the VM. Per-claim errors do not stop
//! the loop; they are collected and surfaced together so one bad pool
//! reference cannot starve the others.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::PostParams;
use kube::{Api, ResourceExt};
use tracing::{info, warn};

use crds::{
    address_claim_name, aggregate_ready, has_condition, mark_false, set_condition, AddressClaim,
    AddressClaimSpec, Condition, ConditionSeverity, PoolReference, VirtualMachine,
    ADDRESS_CLAIM_FINALIZER, API_VERSION, CLAIMS_BEING_CREATED_REASON,
    CLAIM_CREATION_FAILED_REASON, CLUSTER_NAME_LABEL, IP_ADDRESS_CLAIMED_CONDITION,
    READY_CONDITION, WAITING_FOR_IP_ADDRESS_REASON,
};

use crate::error::ControllerError;
use crate::reconciler::vm::conditions_mut;

/// Claim persistence seam. The production store talks to the API
/// server; tests use an in-memory map.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Fetches a claim by name, `None` when absent.
    async fn get(&self, name: &str) -> Result<Option<AddressClaim>, ControllerError>;

    /// Creates a new claim.
    async fn create(&self, claim: &AddressClaim) -> Result<AddressClaim, ControllerError>;

    /// Replaces an existing claim.
    async fn update(&self, claim: &AddressClaim) -> Result<AddressClaim, ControllerError>;
}

/// [`ClaimStore`] backed by the AddressClaim API.
pub struct KubeClaimStore {
    api: Api<AddressClaim>,
}

impl KubeClaimStore {
    /// Wraps the given claim API.
    pub fn new(api: Api<AddressClaim>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ClaimStore for KubeClaimStore {
    async fn get(&self, name: &str) -> Result<Option<AddressClaim>, ControllerError> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, claim: &AddressClaim) -> Result<AddressClaim, ControllerError> {
        Ok(self.api.create(&PostParams::default(), claim).await?)
    }

    async fn update(&self, claim: &AddressClaim) -> Result<AddressClaim, ControllerError> {
        Ok(self
            .api
            .replace(&claim.name_any(), &PostParams::default(), claim)
            .await?)
    }
}

/// Every (device index, poolRef index, poolRef) triple on the VM.
fn pool_pairs(vm: &VirtualMachine) -> Vec<(usize, usize, PoolReference)> {
    vm.spec
        .network
        .devices
        .iter()
        .enumerate()
        .flat_map(|(device_index, device)| {
            device
                .addresses_from_pools
                .iter()
                .enumerate()
                .map(move |(pool_index, pool_ref)| (device_index, pool_index, pool_ref.clone()))
        })
        .collect()
}

/// Ensures claims exist for every pool reference and records aggregate
/// progress in the IPAddressClaimed condition.
///
/// Returns `Err` only when at least one claim could not be created or
/// patched; waiting on the allocator is not an error.
pub(crate) async fn reconcile_address_claims(
    vm: &mut VirtualMachine,
    store: &dyn ClaimStore,
) -> Result<(), ControllerError> {
    let pairs = pool_pairs(vm);
    if pairs.is_empty() {
        return Ok(());
    }

    let vm_name = vm.name_any();
    let total = pairs.len();
    let mut created = 0usize;
    let mut fulfilled = 0usize;
    let mut claims = Vec::with_capacity(total);
    let mut errors = Vec::new();

    for (device_index, pool_index, pool_ref) in pairs {
        let name = address_claim_name(&vm_name, device_index, pool_index);
        match ensure_claim(vm, &name, &pool_ref, store).await {
            Ok((claim, was_created)) => {
                if was_created {
                    created += 1;
                }
                if claim.fulfilled() {
                    fulfilled += 1;
                }
                claims.push(claim);
            }
            Err(e) => {
                warn!(vm = %vm_name, claim = %name, error = %e, "address claim failed");
                errors.push(format!("{name}: {e}"));
            }
        }
    }

    if !errors.is_empty() {
        mark_false(
            conditions_mut(vm),
            IP_ADDRESS_CLAIMED_CONDITION,
            CLAIM_CREATION_FAILED_REASON,
            ConditionSeverity::Error,
            &errors.join("; "),
        );
        return Err(ControllerError::ClaimAggregate(errors));
    }

    set_condition(conditions_mut(vm), claimed_condition(&claims, created, fulfilled));
    Ok(())
}

/// Computes the IPAddressClaimed condition from the observed claims.
///
/// When every claim carries an allocator-set Ready condition the
/// aggregate is precise ("N of M completed"); otherwise progress is
/// approximated from the created/fulfilled counters.
fn claimed_condition(claims: &[AddressClaim], created: usize, fulfilled: usize) -> Condition {
    let total = claims.len();

    let all_have_ready = claims.iter().all(|c| {
        c.status
            .as_ref()
            .is_some_and(|s| has_condition(&s.conditions, READY_CONDITION))
    });
    if all_have_ready {
        let children: Vec<&[Condition]> = claims
            .iter()
            .filter_map(|c| c.status.as_ref())
            .map(|s| s.conditions.as_slice())
            .collect();
        return aggregate_ready(IP_ADDRESS_CLAIMED_CONDITION, &children);
    }

    if fulfilled == total {
        return Condition::true_(IP_ADDRESS_CLAIMED_CONDITION);
    }
    if created > 0 {
        return Condition::false_(
            IP_ADDRESS_CLAIMED_CONDITION,
            CLAIMS_BEING_CREATED_REASON,
            ConditionSeverity::Info,
            &format!("{created}/{total} claims being created"),
        );
    }
    Condition::false_(
        IP_ADDRESS_CLAIMED_CONDITION,
        WAITING_FOR_IP_ADDRESS_REASON,
        ConditionSeverity::Info,
        &format!("{}/{total} claims being processed", total - fulfilled),
    )
}

/// Creates the claim if absent, otherwise converges its metadata and
/// spec. Status stays untouched; it belongs to the allocator.
async fn ensure_claim(
    vm: &VirtualMachine,
    name: &str,
    pool_ref: &PoolReference,
    store: &dyn ClaimStore,
) -> Result<(AddressClaim, bool), ControllerError> {
    match store.get(name).await? {
        Some(existing) => {
            let mut desired = existing.clone();
            apply_claim_metadata(&mut desired, vm, pool_ref);
            if serde_json::to_value(&existing)? != serde_json::to_value(&desired)? {
                let updated = store.update(&desired).await?;
                Ok((updated, false))
            } else {
                Ok((existing, false))
            }
        }
        None => {
            let mut claim = AddressClaim::new(
                name,
                AddressClaimSpec {
                    pool_ref: pool_ref.clone(),
                },
            );
            claim.metadata.namespace = vm.metadata.namespace.clone();
            apply_claim_metadata(&mut claim, vm, pool_ref);
            let claim = store.create(&claim).await?;
            info!(vm = %vm.name_any(), claim = name, "created address claim");
            Ok((claim, true))
        }
    }
}

/// The claim fields the VM reconciler owns: controller owner reference,
/// finalizer, cluster label and pool reference.
fn apply_claim_metadata(claim: &mut AddressClaim, vm: &VirtualMachine, pool_ref: &PoolReference) {
    let owner_refs = claim.metadata.owner_references.get_or_insert_with(Vec::new);
    let vm_name = vm.name_any();
    if !owner_refs
        .iter()
        .any(|r| r.kind == "VirtualMachine" && r.name == vm_name)
    {
        owner_refs.push(OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: "VirtualMachine".to_string(),
            name: vm_name,
            uid: vm.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            ..Default::default()
        });
    }

    let finalizers = claim.metadata.finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|f| f == ADDRESS_CLAIM_FINALIZER) {
        finalizers.push(ADDRESS_CLAIM_FINALIZER.to_string());
    }

    if let Some(cluster) = vm.labels().get(CLUSTER_NAME_LABEL) {
        claim
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(CLUSTER_NAME_LABEL.to_string(), cluster.clone());
    }

    claim.spec.pool_ref = pool_ref.clone();
}

/// Releases the reconciler's finalizer from every claim of the VM so
/// owner-reference garbage collection can proceed. Missing claims are
/// skipped.
pub(crate) async fn release_address_claims(
    vm: &VirtualMachine,
    store: &dyn ClaimStore,
) -> Result<(), ControllerError> {
    let vm_name = vm.name_any();
    for (device_index, pool_index, _) in pool_pairs(vm) {
        let name = address_claim_name(&vm_name, device_index, pool_index);
        let Some(mut claim) = store.get(&name).await? else {
            continue;
        };
        if let Some(finalizers) = claim.metadata.finalizers.as_mut() {
            let before = finalizers.len();
            finalizers.retain(|f| f != ADDRESS_CLAIM_FINALIZER);
            if finalizers.len() != before {
                store.update(&claim).await?;
                info!(vm = %vm_name, claim = %name, "released address claim");
            }
        }
    }
    Ok(())
}
