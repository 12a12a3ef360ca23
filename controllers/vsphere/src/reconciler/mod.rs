//! Reconciliation engine.
//!
//! One `Reconciler` instance is shared by all workers. It owns the API
//! handles, the session cache and the backend service seams, and
//! dispatches work keys to the VirtualMachine and DeploymentZone
//! reconcilers. The sub-modules hold the per-resource logic:
//! - `vm`: VirtualMachine state machine (forward and delete paths)
//! - `claims`: address-claim creation, aggregation and release
//! - `zone`: DeploymentZone placement validation and deletion guard

pub mod claims;
pub mod vm;
pub mod zone;

#[cfg(test)]
mod claims_test;
#[cfg(test)]
mod zone_test;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use tracing::{debug, info};
use vsphere_client::{
    InventoryService, Session, SessionManager, SessionParams, VmService,
};

use crds::{
    mark_false, mark_true, set_summary, AddressClaim, DeploymentZone, FailureDomain,
    VirtualMachine, VmCluster, BACKEND_AVAILABLE_CONDITION, BACKEND_UNREACHABLE_REASON,
    CLUSTER_NAME_LABEL, IP_ADDRESS_CLAIMED_CONDITION, VM_PROVISIONED_CONDITION,
};

use crate::context::PatchHelper;
use crate::error::ControllerError;
use crate::nodes::NodeDeleter;
use crate::queue::WorkKey;
use crate::reconciler::claims::{ClaimStore, KubeClaimStore};

/// What a finished reconcile asks of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Wait for the next watch event
    Done,
    /// Re-run after the given delay even without an event
    RequeueAfter(Duration),
}

/// Default backend credentials from the controller environment, used
/// when a cluster has no identity reference.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Combines the reconcile body result with the patch flush result,
/// keeping both errors when both fail.
pub(crate) fn combine(
    result: Result<Outcome, ControllerError>,
    flush: Result<(), ControllerError>,
) -> Result<Outcome, ControllerError> {
    match (result, flush) {
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Err(f)) => Err(ControllerError::Aggregate(vec![e, f])),
    }
}

/// Reconciles VirtualMachines and DeploymentZones.
pub struct Reconciler {
    pub(crate) vm_api: Api<VirtualMachine>,
    pub(crate) cluster_api: Api<VmCluster>,
    pub(crate) secret_api: Api<Secret>,
    pub(crate) zone_api: Api<DeploymentZone>,
    pub(crate) fd_api: Api<FailureDomain>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) vm_service: Arc<dyn VmService>,
    pub(crate) inventory: Arc<dyn InventoryService>,
    pub(crate) nodes: Arc<dyn NodeDeleter>,
    pub(crate) claims: Arc<dyn ClaimStore>,
    credentials: Credentials,
}

impl Reconciler {
    /// Creates a reconciler over the given APIs and backend seams.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vm_api: Api<VirtualMachine>,
        claim_api: Api<AddressClaim>,
        cluster_api: Api<VmCluster>,
        secret_api: Api<Secret>,
        zone_api: Api<DeploymentZone>,
        fd_api: Api<FailureDomain>,
        sessions: Arc<SessionManager>,
        vm_service: Arc<dyn VmService>,
        inventory: Arc<dyn InventoryService>,
        nodes: Arc<dyn NodeDeleter>,
        credentials: Credentials,
    ) -> Self {
        Self {
            vm_api,
            cluster_api,
            secret_api,
            zone_api,
            fd_api,
            sessions,
            vm_service,
            inventory,
            nodes,
            claims: Arc::new(KubeClaimStore::new(claim_api)),
            credentials,
        }
    }

    /// Dispatches one work key.
    pub async fn reconcile(&self, key: &WorkKey) -> Result<Outcome, ControllerError> {
        match key {
            WorkKey::VirtualMachine { name } => self.reconcile_virtual_machine(name).await,
            WorkKey::DeploymentZone { name } => self.reconcile_deployment_zone(name).await,
        }
    }

    /// Full reconcile of one VirtualMachine key: fetch, pause gate,
    /// session, finalizer-first, forward or delete path, and a
    /// patch-on-exit flush that also recomputes the Ready summary.
    pub(crate) async fn reconcile_virtual_machine(
        &self,
        name: &str,
    ) -> Result<Outcome, ControllerError> {
        let Some(mut virtual_machine) = self.vm_api.get_opt(name).await? else {
            debug!(vm = name, "VirtualMachine gone, nothing to do");
            return Ok(Outcome::Done);
        };

        let cluster = match virtual_machine.labels().get(CLUSTER_NAME_LABEL) {
            Some(cluster_name) => self.cluster_api.get_opt(cluster_name).await?,
            None => None,
        };
        if let Some(cluster) = &cluster {
            if cluster.is_paused(virtual_machine.metadata.annotations.as_ref()) {
                info!(vm = name, cluster = %cluster.name_any(), "reconciliation is paused");
                return Ok(Outcome::Done);
            }
        }

        let helper = PatchHelper::new(&virtual_machine)?;

        let session = match self.vm_session(&virtual_machine, cluster.as_ref()).await {
            Ok(session) => {
                mark_true(
                    vm::conditions_mut(&mut virtual_machine),
                    BACKEND_AVAILABLE_CONDITION,
                );
                session
            }
            Err(e) => {
                mark_false(
                    vm::conditions_mut(&mut virtual_machine),
                    BACKEND_AVAILABLE_CONDITION,
                    BACKEND_UNREACHABLE_REASON,
                    crds::ConditionSeverity::Error,
                    &e.to_string(),
                );
                let flush = helper.flush(&self.vm_api, name, &virtual_machine).await;
                return combine(Err(e), flush);
            }
        };

        // The finalizer must be persisted before any backend mutation.
        let deleting = virtual_machine.metadata.deletion_timestamp.is_some();
        if vm::ensure_finalizer(&mut virtual_machine) {
            helper.flush(&self.vm_api, name, &virtual_machine).await?;
            debug!(vm = name, "added finalizer");
            return Ok(Outcome::Done);
        }

        let result = if deleting {
            vm::reconcile_delete(
                &mut virtual_machine,
                &session,
                self.vm_service.as_ref(),
                self.claims.as_ref(),
                self.nodes.as_ref(),
            )
            .await
        } else {
            vm::reconcile_normal(
                &mut virtual_machine,
                &session,
                self.vm_service.as_ref(),
                self.claims.as_ref(),
            )
            .await
        };

        set_summary(
            vm::conditions_mut(&mut virtual_machine),
            &[
                BACKEND_AVAILABLE_CONDITION,
                IP_ADDRESS_CLAIMED_CONDITION,
                VM_PROVISIONED_CONDITION,
            ],
        );
        let flush = helper.flush(&self.vm_api, name, &virtual_machine).await;
        combine(result, flush)
    }

    /// Resolves the session for a VM. Credentials come from the owning
    /// cluster's identity secret when one is referenced, otherwise from
    /// the controller's own credentials.
    async fn vm_session(
        &self,
        vm: &VirtualMachine,
        cluster: Option<&VmCluster>,
    ) -> Result<Arc<Session>, ControllerError> {
        let mut params = SessionParams {
            server: vm.spec.server.clone(),
            datacenter: vm.spec.datacenter.clone(),
            username: self.credentials.username.clone(),
            password: self.credentials.password.clone(),
            thumbprint: vm.spec.thumbprint.clone(),
        };
        if let Some(identity) = cluster.and_then(|c| c.spec.identity_ref.as_ref()) {
            let secret = self.secret_api.get(&identity.name).await?;
            let (username, password) = credentials_from_secret(&secret, &identity.name)?;
            params.username = username;
            params.password = password;
        }
        Ok(self.sessions.get_or_create(params).await?)
    }

    /// Resolves the session for a zone. The zone has no owning cluster,
    /// so the first cluster pointing at the same server with an
    /// identity reference wins; otherwise the controller credentials.
    pub(crate) async fn zone_session(
        &self,
        zone: &DeploymentZone,
        failure_domain: &FailureDomain,
    ) -> Result<Arc<Session>, ControllerError> {
        let mut params = SessionParams {
            server: zone.spec.server.clone(),
            datacenter: failure_domain.spec.topology.datacenter.clone(),
            username: self.credentials.username.clone(),
            password: self.credentials.password.clone(),
            thumbprint: None,
        };
        let clusters = self.cluster_api.list(&ListParams::default()).await?;
        if let Some(cluster) = clusters
            .items
            .iter()
            .find(|c| c.spec.server == zone.spec.server && c.spec.identity_ref.is_some())
        {
            if let Some(identity) = &cluster.spec.identity_ref {
                let secret = self.secret_api.get(&identity.name).await?;
                let (username, password) = credentials_from_secret(&secret, &identity.name)?;
                params.username = username;
                params.password = password;
                params.thumbprint = cluster.spec.thumbprint.clone();
            }
        }
        Ok(self.sessions.get_or_create(params).await?)
    }
}

/// Extracts `username`/`password` keys from an identity secret.
pub(crate) fn credentials_from_secret(
    secret: &Secret,
    secret_name: &str,
) -> Result<(String, String), ControllerError> {
    let data = secret.data.as_ref().ok_or_else(|| {
        ControllerError::InvalidConfig(format!("identity secret {secret_name} has no data"))
    })?;
    let field = |key: &str| -> Result<String, ControllerError> {
        let bytes = data.get(key).ok_or_else(|| {
            ControllerError::InvalidConfig(format!(
                "identity secret {secret_name} is missing key {key}"
            ))
        })?;
        String::from_utf8(bytes.0.clone()).map_err(|_| {
            ControllerError::InvalidConfig(format!(
                "identity secret {secret_name} key {key} is not valid UTF-8"
            ))
        })
    };
    Ok((field("username")?, field("password")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret_with(entries: &[(&str, &str)]) -> Secret {
        let mut data = BTreeMap::new();
        for (key, value) in entries {
            data.insert(key.to_string(), ByteString(value.as_bytes().to_vec()));
        }
        Secret {
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn credentials_extracted_from_secret() {
        let secret = secret_with(&[("username", "vcadmin"), ("password", "hunter2")]);
        let (username, password) = credentials_from_secret(&secret, "creds").expect("credentials");
        assert_eq!(username, "vcadmin");
        assert_eq!(password, "hunter2");
    }

    #[test]
    fn missing_key_is_invalid_config() {
        let secret = secret_with(&[("username", "vcadmin")]);
        let err = credentials_from_secret(&secret, "creds").expect_err("must fail");
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn combine_keeps_both_errors() {
        let combined = combine(
            Err(ControllerError::InvalidConfig("a".into())),
            Err(ControllerError::InvalidConfig("b".into())),
        );
        let err = combined.expect_err("must fail");
        assert!(matches!(err, ControllerError::Aggregate(ref inner) if inner.len() == 2));

        assert_eq!(
            combine(Ok(Outcome::Done), Ok(())).expect("ok"),
            Outcome::Done
        );
    }
}
