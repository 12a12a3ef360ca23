//! DeploymentZone reconciler.
//!
//! Forward: resolve the referenced FailureDomain, validate the
//! placement constraint against live backend inventory and tie the
//! FailureDomain's lifecycle to the zone with an owner reference.
//! Delete: refuse while active machines still use the zone, then remove
//! the zone's owner reference and delete the FailureDomain once no
//! owner is left.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, warn};
use vsphere_client::{InventoryService, Session, VsphereError};

use crds::{
    mark_false, mark_true, set_summary, Condition, ConditionSeverity, DeploymentZone,
    FailureDomain, PlacementConstraint, VirtualMachine, API_VERSION, BACKEND_AVAILABLE_CONDITION,
    BACKEND_UNREACHABLE_REASON, DEPLOYMENT_ZONE_FINALIZER, FOLDER_NOT_FOUND_REASON,
    PLACEMENT_CONSTRAINT_MET_CONDITION, RESOURCE_POOL_NOT_FOUND_REASON,
};

use crate::context::PatchHelper;
use crate::error::ControllerError;
use crate::reconciler::{combine, Outcome, Reconciler};

pub(crate) fn status_conditions(zone: &mut DeploymentZone) -> &mut Vec<Condition> {
    &mut zone.status.get_or_insert_with(Default::default).conditions
}

/// Validates the placement constraint against backend inventory,
/// recording the PlacementConstraintMet condition either way.
pub(crate) async fn validate_placement(
    conditions: &mut Vec<Condition>,
    session: &Session,
    inventory: &dyn InventoryService,
    constraint: &PlacementConstraint,
) -> Result<(), ControllerError> {
    if let Some(pool) = constraint.resource_pool.as_deref() {
        if let Err(e) = inventory.find_resource_pool(session, pool).await {
            let reason = match e {
                VsphereError::NotFound(_) => RESOURCE_POOL_NOT_FOUND_REASON,
                _ => BACKEND_UNREACHABLE_REASON,
            };
            mark_false(
                conditions,
                PLACEMENT_CONSTRAINT_MET_CONDITION,
                reason,
                ConditionSeverity::Error,
                &e.to_string(),
            );
            return Err(ControllerError::Backend(e));
        }
    }
    if let Some(folder) = constraint.folder.as_deref() {
        if let Err(e) = inventory.find_folder(session, folder).await {
            let reason = match e {
                VsphereError::NotFound(_) => FOLDER_NOT_FOUND_REASON,
                _ => BACKEND_UNREACHABLE_REASON,
            };
            mark_false(
                conditions,
                PLACEMENT_CONSTRAINT_MET_CONDITION,
                reason,
                ConditionSeverity::Error,
                &e.to_string(),
            );
            return Err(ControllerError::Backend(e));
        }
    }
    mark_true(conditions, PLACEMENT_CONSTRAINT_MET_CONDITION);
    Ok(())
}

/// Names of live VMs placed in the zone, blocking its deletion.
pub(crate) fn blocking_vm_names(vms: &[VirtualMachine], zone_name: &str) -> Vec<String> {
    vms.iter()
        .filter(|vm| vm.metadata.deletion_timestamp.is_none())
        .filter(|vm| vm.spec.failure_domain.as_deref() == Some(zone_name))
        .map(|vm| vm.name_any())
        .collect()
}

/// Removes the zone's owner reference from the failure domain's owner
/// list. Returns true when something was removed.
pub(crate) fn remove_zone_owner_reference(fd: &mut FailureDomain, zone_name: &str) -> bool {
    let Some(refs) = fd.metadata.owner_references.as_mut() else {
        return false;
    };
    let before = refs.len();
    refs.retain(|r| !(r.kind == "DeploymentZone" && r.name == zone_name));
    refs.len() != before
}

/// True when the failure domain already lists the zone as an owner.
pub(crate) fn has_zone_owner_reference(fd: &FailureDomain, zone_name: &str) -> bool {
    fd.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| {
            refs.iter()
                .any(|r| r.kind == "DeploymentZone" && r.name == zone_name)
        })
}

impl Reconciler {
    /// Full reconcile of one DeploymentZone key.
    pub(crate) async fn reconcile_deployment_zone(
        &self,
        name: &str,
    ) -> Result<Outcome, ControllerError> {
        let Some(mut zone) = self.zone_api.get_opt(name).await? else {
            debug!(zone = name, "DeploymentZone gone, nothing to do");
            return Ok(Outcome::Done);
        };
        let helper = PatchHelper::new(&zone)?;
        let failure_domain = self.fd_api.get_opt(&zone.spec.failure_domain).await?;

        if zone.metadata.deletion_timestamp.is_some() {
            let result = self.reconcile_zone_delete(&mut zone, failure_domain).await;
            let flush = helper.flush(&self.zone_api, name, &zone).await;
            return combine(result, flush);
        }

        if !zone.finalizers().iter().any(|f| f == DEPLOYMENT_ZONE_FINALIZER) {
            zone.metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(DEPLOYMENT_ZONE_FINALIZER.to_string());
            helper.flush(&self.zone_api, name, &zone).await?;
            return Ok(Outcome::Done);
        }

        let result = self.reconcile_zone_normal(&mut zone, failure_domain).await;
        set_summary(
            status_conditions(&mut zone),
            &[
                BACKEND_AVAILABLE_CONDITION,
                PLACEMENT_CONSTRAINT_MET_CONDITION,
            ],
        );
        let flush = helper.flush(&self.zone_api, name, &zone).await;
        combine(result, flush)
    }

    async fn reconcile_zone_normal(
        &self,
        zone: &mut DeploymentZone,
        failure_domain: Option<FailureDomain>,
    ) -> Result<Outcome, ControllerError> {
        let name = zone.name_any();
        let Some(failure_domain) = failure_domain else {
            zone.status.get_or_insert_with(Default::default).ready = Some(false);
            return Err(ControllerError::FailureDomainNotFound(
                zone.spec.failure_domain.clone(),
            ));
        };

        let session = match self.zone_session(zone, &failure_domain).await {
            Ok(session) => {
                mark_true(status_conditions(zone), BACKEND_AVAILABLE_CONDITION);
                session
            }
            Err(e) => {
                mark_false(
                    status_conditions(zone),
                    BACKEND_AVAILABLE_CONDITION,
                    BACKEND_UNREACHABLE_REASON,
                    ConditionSeverity::Error,
                    &e.to_string(),
                );
                zone.status.get_or_insert_with(Default::default).ready = Some(false);
                return Err(e);
            }
        };

        let constraint = zone.spec.placement_constraint.clone();
        if let Err(e) = validate_placement(
            status_conditions(zone),
            &session,
            self.inventory.as_ref(),
            &constraint,
        )
        .await
        {
            zone.status.get_or_insert_with(Default::default).ready = Some(false);
            return Err(e);
        }

        self.ensure_failure_domain_owner(zone, &failure_domain).await?;

        zone.status.get_or_insert_with(Default::default).ready = Some(true);
        info!(zone = %name, "DeploymentZone is ready");
        Ok(Outcome::Done)
    }

    /// Ties the FailureDomain's lifecycle to this zone.
    async fn ensure_failure_domain_owner(
        &self,
        zone: &DeploymentZone,
        failure_domain: &FailureDomain,
    ) -> Result<(), ControllerError> {
        let zone_name = zone.name_any();
        if has_zone_owner_reference(failure_domain, &zone_name) {
            return Ok(());
        }

        let mut refs = failure_domain
            .metadata
            .owner_references
            .clone()
            .unwrap_or_default();
        refs.push(OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: "DeploymentZone".to_string(),
            name: zone_name.clone(),
            uid: zone.metadata.uid.clone().unwrap_or_default(),
            ..Default::default()
        });

        let patch = json!({ "metadata": { "ownerReferences": refs } });
        self.fd_api
            .patch(
                &failure_domain.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        debug!(
            zone = %zone_name,
            failure_domain = %failure_domain.name_any(),
            "added owner reference to failure domain"
        );
        Ok(())
    }

    async fn reconcile_zone_delete(
        &self,
        zone: &mut DeploymentZone,
        failure_domain: Option<FailureDomain>,
    ) -> Result<Outcome, ControllerError> {
        let zone_name = zone.name_any();

        let vms = self.vm_api.list(&ListParams::default()).await?;
        let blockers = blocking_vm_names(&vms.items, &zone_name);
        if !blockers.is_empty() {
            warn!(zone = %zone_name, blockers = %blockers.join(","), "zone still in use, refusing deletion");
            return Err(ControllerError::ZoneInUse {
                zone: zone_name,
                blockers: blockers.join(","),
            });
        }

        // A missing FailureDomain releases the zone immediately.
        if let Some(mut fd) = failure_domain {
            let fd_name = fd.name_any();
            let removed = remove_zone_owner_reference(&mut fd, &zone_name);
            let remaining = fd
                .metadata
                .owner_references
                .as_ref()
                .map_or(0, |refs| refs.len());

            if remaining == 0 {
                match self.fd_api.delete(&fd_name, &DeleteParams::default()).await {
                    Ok(_) => info!(failure_domain = %fd_name, "deleted unowned failure domain"),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(e) => return Err(ControllerError::Kube(e)),
                }
            } else if removed {
                let patch = json!({ "metadata": { "ownerReferences": fd.metadata.owner_references } });
                self.fd_api
                    .patch(&fd_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                debug!(zone = %zone_name, failure_domain = %fd_name, "removed owner reference");
            }
        }

        if let Some(finalizers) = zone.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != DEPLOYMENT_ZONE_FINALIZER);
        }
        info!(zone = %zone.name_any(), "DeploymentZone deleted");
        Ok(Outcome::Done)
    }
}
