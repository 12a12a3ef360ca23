//! Patch-on-exit support for reconciles.
//!
//! Every reconcile works on an owned, mutated copy of the fetched
//! resource. [`PatchHelper`] snapshots the object at fetch time and on
//! exit patches only the sections that actually changed: spec and
//! finalizers as merge patches, status through the status subresource.
//! The finalizer patch always goes last: on a deleting object it is
//! the one that lets the API server purge the resource, and any patch
//! issued after that point would hit a vanished object. The flush runs
//! on every exit path, success or error, so condition updates recorded
//! before a failure still land.

use kube::api::{Api, Patch, PatchParams};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ControllerError;

/// Snapshot of a resource taken before the reconcile mutates it.
#[derive(Debug)]
pub struct PatchHelper {
    original: Value,
}

/// Changed sections computed against the snapshot.
#[derive(Debug, Default, PartialEq)]
pub struct PendingChanges {
    /// New finalizer list, if it changed
    pub finalizers: Option<Value>,
    /// New spec, if it changed
    pub spec: Option<Value>,
    /// New status, if it changed
    pub status: Option<Value>,
}

/// Section of the object one patch applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Spec,
    Status,
    Finalizers,
}

impl PendingChanges {
    /// True when nothing needs patching.
    pub fn is_empty(&self) -> bool {
        self.finalizers.is_none() && self.spec.is_none() && self.status.is_none()
    }

    /// Patch application order. Removing the last finalizer from a
    /// deleting object purges it immediately, so the finalizer patch
    /// always lands after spec and status.
    pub fn order(&self) -> Vec<Section> {
        let mut order = Vec::new();
        if self.spec.is_some() {
            order.push(Section::Spec);
        }
        if self.status.is_some() {
            order.push(Section::Status);
        }
        if self.finalizers.is_some() {
            order.push(Section::Finalizers);
        }
        order
    }
}

impl PatchHelper {
    /// Snapshots the object as fetched.
    pub fn new<K: Serialize>(obj: &K) -> Result<Self, ControllerError> {
        Ok(Self {
            original: serde_json::to_value(obj)?,
        })
    }

    /// Computes which sections of the object diverged from the snapshot.
    pub fn changes<K: Serialize>(&self, obj: &K) -> Result<PendingChanges, ControllerError> {
        let current = serde_json::to_value(obj)?;
        let mut pending = PendingChanges::default();

        let finalizers = &current["metadata"]["finalizers"];
        if *finalizers != self.original["metadata"]["finalizers"] {
            pending.finalizers = Some(finalizers.clone());
        }
        if current["spec"] != self.original["spec"] {
            pending.spec = Some(current["spec"].clone());
        }
        if current["status"] != self.original["status"] {
            pending.status = Some(current["status"].clone());
        }
        Ok(pending)
    }

    /// Writes the changed sections back to the API.
    pub async fn flush<K>(&self, api: &Api<K>, name: &str, obj: &K) -> Result<(), ControllerError>
    where
        K: Clone + DeserializeOwned + Serialize + std::fmt::Debug,
    {
        let pending = self.changes(obj)?;
        if pending.is_empty() {
            return Ok(());
        }
        debug!(
            resource = name,
            finalizers = pending.finalizers.is_some(),
            spec = pending.spec.is_some(),
            status = pending.status.is_some(),
            "flushing resource changes"
        );

        let pp = PatchParams::default();
        for section in pending.order() {
            match section {
                Section::Spec => {
                    let patch = json!({ "spec": pending.spec });
                    api.patch(name, &pp, &Patch::Merge(&patch)).await?;
                }
                Section::Status => {
                    let patch = json!({ "status": pending.status });
                    api.patch_status(name, &pp, &Patch::Merge(&patch)).await?;
                }
                Section::Finalizers => {
                    let patch = json!({ "metadata": { "finalizers": pending.finalizers } });
                    api.patch(name, &pp, &Patch::Merge(&patch)).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{VirtualMachineStatus, VM_FINALIZER};

    use crate::test_utils::base_vm;

    #[test]
    fn no_changes_on_untouched_object() {
        let vm = base_vm("worker-1");
        let helper = PatchHelper::new(&vm).expect("snapshot");
        let pending = helper.changes(&vm).expect("diff");
        assert!(pending.is_empty());
    }

    #[test]
    fn finalizer_addition_is_detected_alone() {
        let mut vm = base_vm("worker-1");
        let helper = PatchHelper::new(&vm).expect("snapshot");

        vm.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(VM_FINALIZER.to_string());

        let pending = helper.changes(&vm).expect("diff");
        assert!(pending.finalizers.is_some());
        assert!(pending.spec.is_none());
        assert!(pending.status.is_none());
    }

    #[test]
    fn finalizer_removal_is_patched_after_status() {
        // Shape of the final delete cycle: conditions were updated and
        // the finalizer list emptied in the same pass. The status patch
        // must land while the object still exists.
        let mut vm = base_vm("worker-1");
        vm.metadata.finalizers = Some(vec![VM_FINALIZER.to_string()]);
        let helper = PatchHelper::new(&vm).expect("snapshot");

        vm.status = Some(VirtualMachineStatus {
            conditions: {
                let mut conditions = Vec::new();
                crds::mark_false(
                    &mut conditions,
                    crds::VM_PROVISIONED_CONDITION,
                    crds::DELETING_REASON,
                    crds::ConditionSeverity::Info,
                    "",
                );
                conditions
            },
            ..Default::default()
        });
        vm.metadata.finalizers = Some(Vec::new());

        let pending = helper.changes(&vm).expect("diff");
        assert_eq!(pending.order(), vec![Section::Status, Section::Finalizers]);
    }

    #[test]
    fn spec_and_status_changes_are_detected_separately() {
        let mut vm = base_vm("worker-1");
        let helper = PatchHelper::new(&vm).expect("snapshot");

        vm.spec.bios_uuid = Some("423e1b0a".to_string());
        vm.status = Some(VirtualMachineStatus {
            ready: true,
            ..Default::default()
        });

        let pending = helper.changes(&vm).expect("diff");
        assert!(pending.finalizers.is_none());
        assert!(pending.spec.is_some());
        assert!(pending.status.is_some());
    }
}
