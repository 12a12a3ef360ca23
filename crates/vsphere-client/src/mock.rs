//! Mock backend implementations for unit testing
//!
//! These mocks are scripted: tests queue the observations the backend
//! should return and assert on the recorded calls afterwards. No
//! running vCenter is required.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::VsphereError;
use crate::models::{DesiredVm, DestroyResult, ObservedVm, VmIdentity};
use crate::service::{InventoryService, VmService};
use crate::session::{Authenticate, Session, SessionParams};

/// Scripted [`VmService`] returning queued observations in order.
#[derive(Debug, Default)]
pub struct MockVmService {
    reconcile_responses: Mutex<VecDeque<Result<ObservedVm, VsphereError>>>,
    destroy_responses: Mutex<VecDeque<Result<DestroyResult, VsphereError>>>,
    reconcile_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
}

impl MockVmService {
    /// Creates a mock with empty scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the next `reconcile_vm` observation.
    pub fn push_reconcile(&self, response: Result<ObservedVm, VsphereError>) {
        self.reconcile_responses
            .lock()
            .unwrap()
            .push_back(response);
    }

    /// Queues the next `destroy_vm` result.
    pub fn push_destroy(&self, response: Result<DestroyResult, VsphereError>) {
        self.destroy_responses.lock().unwrap().push_back(response);
    }

    /// Number of `reconcile_vm` calls seen.
    pub fn reconcile_calls(&self) -> usize {
        self.reconcile_calls.load(Ordering::SeqCst)
    }

    /// Number of `destroy_vm` calls seen.
    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl VmService for MockVmService {
    async fn reconcile_vm(
        &self,
        _session: &Session,
        desired: &DesiredVm,
    ) -> Result<ObservedVm, VsphereError> {
        self.reconcile_calls.fetch_add(1, Ordering::SeqCst);
        self.reconcile_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ObservedVm::not_found(&desired.identity.name)))
    }

    async fn destroy_vm(
        &self,
        _session: &Session,
        identity: &VmIdentity,
    ) -> Result<DestroyResult, VsphereError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.destroy_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(DestroyResult {
                    requeue_after: None,
                    vm: ObservedVm::not_found(&identity.name),
                })
            })
    }
}

/// In-memory [`InventoryService`] with explicit inventory contents.
#[derive(Debug, Default)]
pub struct MockInventory {
    resource_pools: Mutex<HashSet<String>>,
    folders: Mutex<HashSet<String>>,
}

impl MockInventory {
    /// Creates an empty inventory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource pool path.
    pub fn add_resource_pool(&self, path: &str) {
        self.resource_pools.lock().unwrap().insert(path.to_string());
    }

    /// Registers a folder path.
    pub fn add_folder(&self, path: &str) {
        self.folders.lock().unwrap().insert(path.to_string());
    }
}

#[async_trait::async_trait]
impl InventoryService for MockInventory {
    async fn find_resource_pool(&self, _session: &Session, path: &str) -> Result<(), VsphereError> {
        if self.resource_pools.lock().unwrap().contains(path) {
            Ok(())
        } else {
            Err(VsphereError::NotFound(format!("resource pool {path}")))
        }
    }

    async fn find_folder(&self, _session: &Session, path: &str) -> Result<(), VsphereError> {
        if self.folders.lock().unwrap().contains(path) {
            Ok(())
        } else {
            Err(VsphereError::NotFound(format!("folder {path}")))
        }
    }
}

/// Authenticator that always succeeds and counts logins.
#[derive(Debug, Default)]
pub struct MockAuthenticator {
    logins: AtomicUsize,
}

impl MockAuthenticator {
    /// Creates a fresh authenticator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of login attempts seen.
    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Authenticate for MockAuthenticator {
    async fn login(&self, params: &SessionParams) -> Result<Session, VsphereError> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst);
        Ok(Session::new(format!("mock-token-{n}"), params))
    }
}
