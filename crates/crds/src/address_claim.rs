//! AddressClaim CRD
//!
//! A request for one address allocation from a pool, created by the
//! VirtualMachine reconciler and resolved asynchronously by an external
//! allocator. The controller never deletes claims directly; it only
//! clears its finalizer on VM deletion and leaves physical removal to
//! owner-reference garbage collection.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::references::PoolReference;

/// Finalizer the VM reconciler places on claims it creates.
pub const ADDRESS_CLAIM_FINALIZER: &str = "vmops.microscaler.io/address-claim";

/// Derives the deterministic claim name for a (device, poolRef) pair.
pub fn address_claim_name(vm_name: &str, device_index: usize, pool_ref_index: usize) -> String {
    format!("{vm_name}-{device_index}-{pool_ref_index}")
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vmops.microscaler.io",
    version = "v1alpha1",
    kind = "AddressClaim",
    namespaced,
    status = "AddressClaimStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct AddressClaimSpec {
    /// Pool to allocate from
    pub pool_ref: PoolReference,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AddressClaimStatus {
    /// Name of the resolved address object, set by the allocator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_ref: Option<String>,

    /// Conditions set by the allocator (Ready when resolved)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl AddressClaim {
    /// True once the external allocator resolved an address.
    pub fn fulfilled(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.address_ref.as_deref())
            .is_some_and(|name| !name.is_empty())
    }
}
