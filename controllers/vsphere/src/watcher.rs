//! Kubernetes resource watchers.
//!
//! Raw `kube_runtime::watcher` streams feed the keyed work queue.
//! Primary resources (VirtualMachine, DeploymentZone) enqueue their own
//! key; secondary resources are translated through the mapper:
//! AddressClaims wake their owning VM, VmCluster pause transitions and
//! backend-connection changes fan out to the labeled VMs, FailureDomain
//! changes wake the referencing zones. Watch errors are logged and the stream resumes; the watcher
//! itself only returns when a stream ends, which the controller treats
//! as fatal.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::api::ListParams;
use kube::Api;
use kube_runtime::watcher::{self, watcher, Event};
use tracing::{debug, info, warn};

use crds::{
    AddressClaim, DeploymentZone, FailureDomain, VirtualMachine, VmCluster, CLUSTER_NAME_LABEL,
};

use crate::error::ControllerError;
use crate::mapper;
use crate::queue::{WorkKey, WorkQueue};

/// Watches resources and feeds the work queue.
pub struct Watcher {
    queue: Arc<WorkQueue>,
    vm_api: Api<VirtualMachine>,
    claim_api: Api<AddressClaim>,
    cluster_api: Api<VmCluster>,
    zone_api: Api<DeploymentZone>,
    fd_api: Api<FailureDomain>,
}

impl Watcher {
    /// Creates a watcher over the given APIs.
    pub fn new(
        queue: Arc<WorkQueue>,
        vm_api: Api<VirtualMachine>,
        claim_api: Api<AddressClaim>,
        cluster_api: Api<VmCluster>,
        zone_api: Api<DeploymentZone>,
        fd_api: Api<FailureDomain>,
    ) -> Self {
        Self {
            queue,
            vm_api,
            claim_api,
            cluster_api,
            zone_api,
            fd_api,
        }
    }

    /// Watches VirtualMachines; every change enqueues the VM itself.
    pub async fn watch_virtual_machines(&self) -> Result<(), ControllerError> {
        info!("Starting VirtualMachine watcher");
        let stream = watcher(self.vm_api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(vm) | Event::InitApply(vm) | Event::Delete(vm)) => {
                    if let Some(name) = vm.metadata.name {
                        self.queue.push(WorkKey::VirtualMachine { name });
                    }
                }
                Ok(Event::Init | Event::InitDone) => {}
                Err(e) => warn!(error = %e, "VirtualMachine watch error"),
            }
        }
        Err(ControllerError::Watch(
            "VirtualMachine watch stream ended".to_string(),
        ))
    }

    /// Watches AddressClaims; changes wake the owning VM so allocator
    /// progress is observed without polling.
    pub async fn watch_address_claims(&self) -> Result<(), ControllerError> {
        info!("Starting AddressClaim watcher");
        let stream = watcher(self.claim_api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(claim) | Event::InitApply(claim) | Event::Delete(claim)) => {
                    if let Some(key) = mapper::owner_vm_key(&claim) {
                        self.queue.push(key);
                    }
                }
                Ok(Event::Init | Event::InitDone) => {}
                Err(e) => warn!(error = %e, "AddressClaim watch error"),
            }
        }
        Err(ControllerError::Watch(
            "AddressClaim watch stream ended".to_string(),
        ))
    }

    /// Watches VmClusters; pause transitions and backend-connection
    /// changes fan out to the cluster's VMs through the cluster-name
    /// label.
    pub async fn watch_clusters(&self) -> Result<(), ControllerError> {
        info!("Starting VmCluster watcher");
        let mut observed: HashMap<String, (bool, mapper::ClusterConnection)> = HashMap::new();
        let stream = watcher(self.cluster_api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(cluster) | Event::InitApply(cluster)) => {
                    let Some(name) = cluster.metadata.name.clone() else {
                        continue;
                    };
                    let paused = cluster.is_paused(None);
                    let connection = mapper::cluster_connection(&cluster);
                    let previous = observed.insert(name.clone(), (paused, connection.clone()));
                    let woken_by_pause =
                        mapper::cluster_wakes_vms(previous.as_ref().map(|(p, _)| *p), paused);
                    let woken_by_connection = mapper::cluster_connection_changed(
                        previous.as_ref().map(|(_, c)| c),
                        &connection,
                    );
                    if woken_by_pause || woken_by_connection {
                        self.enqueue_cluster_vms(&name).await;
                    }
                }
                Ok(Event::Delete(cluster)) => {
                    if let Some(name) = cluster.metadata.name {
                        observed.remove(&name);
                    }
                }
                Ok(Event::Init | Event::InitDone) => {}
                Err(e) => warn!(error = %e, "VmCluster watch error"),
            }
        }
        Err(ControllerError::Watch(
            "VmCluster watch stream ended".to_string(),
        ))
    }

    async fn enqueue_cluster_vms(&self, cluster_name: &str) {
        let selector = format!("{CLUSTER_NAME_LABEL}={cluster_name}");
        match self
            .vm_api
            .list(&ListParams::default().labels(&selector))
            .await
        {
            Ok(vms) => {
                let keys = mapper::cluster_vm_keys(&vms.items, cluster_name);
                debug!(cluster = cluster_name, count = keys.len(), "cluster event fans out to VMs");
                for key in keys {
                    self.queue.push(key);
                }
            }
            Err(e) => warn!(cluster = cluster_name, error = %e, "failed to list cluster VMs"),
        }
    }

    /// Watches DeploymentZones; every change enqueues the zone itself.
    pub async fn watch_deployment_zones(&self) -> Result<(), ControllerError> {
        info!("Starting DeploymentZone watcher");
        let stream = watcher(self.zone_api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(zone) | Event::InitApply(zone) | Event::Delete(zone)) => {
                    if let Some(name) = zone.metadata.name {
                        self.queue.push(WorkKey::DeploymentZone { name });
                    }
                }
                Ok(Event::Init | Event::InitDone) => {}
                Err(e) => warn!(error = %e, "DeploymentZone watch error"),
            }
        }
        Err(ControllerError::Watch(
            "DeploymentZone watch stream ended".to_string(),
        ))
    }

    /// Watches FailureDomains; changes wake every zone referencing the
    /// domain.
    pub async fn watch_failure_domains(&self) -> Result<(), ControllerError> {
        info!("Starting FailureDomain watcher");
        let stream = watcher(self.fd_api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(fd) | Event::InitApply(fd) | Event::Delete(fd)) => {
                    let Some(name) = fd.metadata.name else {
                        continue;
                    };
                    match self.zone_api.list(&ListParams::default()).await {
                        Ok(zones) => {
                            for key in mapper::zone_keys_for_failure_domain(&zones.items, &name) {
                                self.queue.push(key);
                            }
                        }
                        Err(e) => {
                            warn!(failure_domain = %name, error = %e, "failed to list zones")
                        }
                    }
                }
                Ok(Event::Init | Event::InitDone) => {}
                Err(e) => warn!(error = %e, "FailureDomain watch error"),
            }
        }
        Err(ControllerError::Watch(
            "FailureDomain watch stream ended".to_string(),
        ))
    }
}
