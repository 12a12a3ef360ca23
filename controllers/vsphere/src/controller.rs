//! Main controller implementation.
//!
//! `Controller::new` wires the pieces together: Kubernetes client and
//! typed APIs, the shared session cache, the REST backend client, the
//! reconciler, the work queue, one watcher task per resource type and a
//! pool of reconcile workers. `run` waits for the first task to exit;
//! watchers and workers run forever, so any exit is fatal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Secret};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tracing::{error, info};
use vsphere_client::{RestAuthenticator, RestClient, SessionManager};

use crds::{AddressClaim, DeploymentZone, FailureDomain, VirtualMachine, VmCluster};

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;
use crate::nodes::KubeNodeDeleter;
use crate::queue::{WorkKey, WorkQueue};
use crate::reconciler::{Credentials, Outcome, Reconciler};
use crate::watcher::Watcher;

/// Main controller for vSphere resource management.
pub struct Controller {
    vm_watcher: JoinHandle<Result<(), ControllerError>>,
    claim_watcher: JoinHandle<Result<(), ControllerError>>,
    cluster_watcher: JoinHandle<Result<(), ControllerError>>,
    zone_watcher: JoinHandle<Result<(), ControllerError>>,
    failure_domain_watcher: JoinHandle<Result<(), ControllerError>>,
    workers: Vec<JoinHandle<Result<(), ControllerError>>>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(
        credentials: Credentials,
        namespace: Option<String>,
        worker_count: usize,
    ) -> Result<Self, ControllerError> {
        info!("Initializing vSphere Controller");

        let kube_client = Client::try_default()
            .await
            .map_err(|e| ControllerError::Kube(e.into()))?;

        let ns = namespace.as_deref().unwrap_or("default");
        let vm_api: Api<VirtualMachine> = Api::namespaced(kube_client.clone(), ns);
        let claim_api: Api<AddressClaim> = Api::namespaced(kube_client.clone(), ns);
        let cluster_api: Api<VmCluster> = Api::namespaced(kube_client.clone(), ns);
        let secret_api: Api<Secret> = Api::namespaced(kube_client.clone(), ns);
        let zone_api: Api<DeploymentZone> = Api::all(kube_client.clone());
        let fd_api: Api<FailureDomain> = Api::all(kube_client.clone());
        let node_api: Api<Node> = Api::all(kube_client);

        let sessions = Arc::new(SessionManager::new(Arc::new(RestAuthenticator::new()?)));
        let backend = Arc::new(RestClient::new()?);

        let reconciler = Arc::new(Reconciler::new(
            vm_api.clone(),
            claim_api.clone(),
            cluster_api.clone(),
            secret_api,
            zone_api.clone(),
            fd_api.clone(),
            sessions,
            backend.clone(),
            backend,
            Arc::new(KubeNodeDeleter::new(node_api)),
            credentials,
        ));

        let queue = Arc::new(WorkQueue::new());
        let watcher_instance = Arc::new(Watcher::new(
            queue.clone(),
            vm_api,
            claim_api,
            cluster_api,
            zone_api,
            fd_api,
        ));

        let vm_watcher = {
            let watcher = watcher_instance.clone();
            tokio::spawn(async move { watcher.watch_virtual_machines().await })
        };
        let claim_watcher = {
            let watcher = watcher_instance.clone();
            tokio::spawn(async move { watcher.watch_address_claims().await })
        };
        let cluster_watcher = {
            let watcher = watcher_instance.clone();
            tokio::spawn(async move { watcher.watch_clusters().await })
        };
        let zone_watcher = {
            let watcher = watcher_instance.clone();
            tokio::spawn(async move { watcher.watch_deployment_zones().await })
        };
        let failure_domain_watcher = {
            let watcher = watcher_instance;
            tokio::spawn(async move { watcher.watch_failure_domains().await })
        };

        let backoffs = Arc::new(Mutex::new(HashMap::new()));
        let workers = (0..worker_count.max(1))
            .map(|id| {
                let queue = queue.clone();
                let reconciler = reconciler.clone();
                let backoffs = backoffs.clone();
                tokio::spawn(async move { worker(id, queue, reconciler, backoffs).await })
            })
            .collect();

        Ok(Self {
            vm_watcher,
            claim_watcher,
            cluster_watcher,
            zone_watcher,
            failure_domain_watcher,
            workers,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("vSphere Controller running");

        tokio::select! {
            result = &mut self.vm_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("VirtualMachine watcher panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("VirtualMachine watcher error: {e}")))?;
            }
            result = &mut self.claim_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("AddressClaim watcher panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("AddressClaim watcher error: {e}")))?;
            }
            result = &mut self.cluster_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("VmCluster watcher panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("VmCluster watcher error: {e}")))?;
            }
            result = &mut self.zone_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("DeploymentZone watcher panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("DeploymentZone watcher error: {e}")))?;
            }
            result = &mut self.failure_domain_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("FailureDomain watcher panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("FailureDomain watcher error: {e}")))?;
            }
            result = futures::future::select_all(&mut self.workers) => {
                let (result, id, _) = result;
                result.map_err(|e| ControllerError::Watch(format!("worker {id} panicked: {e}")))?
                    .map_err(|e| ControllerError::Watch(format!("worker {id} error: {e}")))?;
            }
        }

        Ok(())
    }
}

/// One reconcile worker: pull a key, reconcile, schedule any follow-up.
///
/// Success resets the key's backoff; `RequeueAfter` schedules a timed
/// re-push; an error schedules a re-push on the Fibonacci sequence.
async fn worker(
    id: usize,
    queue: Arc<WorkQueue>,
    reconciler: Arc<Reconciler>,
    backoffs: Arc<Mutex<HashMap<WorkKey, FibonacciBackoff>>>,
) -> Result<(), ControllerError> {
    info!(worker = id, "reconcile worker started");
    loop {
        let key = queue.pop().await;
        let result = reconciler.reconcile(&key).await;
        queue.done(&key);

        match result {
            Ok(Outcome::Done) => {
                if let Ok(mut backoffs) = backoffs.lock() {
                    backoffs.remove(&key);
                }
            }
            Ok(Outcome::RequeueAfter(delay)) => {
                if let Ok(mut backoffs) = backoffs.lock() {
                    backoffs.remove(&key);
                }
                schedule_requeue(queue.clone(), key, delay);
            }
            Err(e) => {
                let delay = next_backoff(&backoffs, &key);
                error!(worker = id, key = %key, error = %e, ?delay, "reconciliation failed");
                schedule_requeue(queue.clone(), key, delay);
            }
        }
    }
}

fn next_backoff(
    backoffs: &Arc<Mutex<HashMap<WorkKey, FibonacciBackoff>>>,
    key: &WorkKey,
) -> Duration {
    match backoffs.lock() {
        Ok(mut backoffs) => backoffs
            .entry(key.clone())
            .or_insert_with(FibonacciBackoff::for_reconcile_errors)
            .next_backoff(),
        Err(_) => Duration::from_secs(60),
    }
}

fn schedule_requeue(queue: Arc<WorkQueue>, key: WorkKey, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        queue.push(key);
    });
}
