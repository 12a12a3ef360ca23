//! vCenter Automation REST implementation of the service contracts.
//!
//! Drives the `/api/vcenter` endpoints with the session token carried
//! in the `vmware-api-session-id` header. A 401 marks the session
//! broken so the session cache replaces it on the next reconcile.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::error::VsphereError;
use crate::models::{
    DesiredVm, DestroyResult, ObservedNetworkDevice, ObservedVm, VmIdentity, VmState,
};
use crate::service::{InventoryService, VmService};
use crate::session::Session;

/// Delay handed back while a destroy task is still running.
const DESTROY_POLL_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
    #[serde(default)]
    power_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VmInfo {
    #[serde(default)]
    identity: Option<VmIdentityInfo>,
    #[serde(default)]
    power_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VmIdentityInfo {
    #[serde(default)]
    bios_uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GuestInterface {
    #[serde(default)]
    mac_address: Option<String>,
    #[serde(default)]
    ip: Option<GuestIpConfig>,
}

#[derive(Debug, Deserialize)]
struct GuestIpConfig {
    #[serde(default)]
    ip_addresses: Vec<GuestIpAddress>,
}

#[derive(Debug, Deserialize)]
struct GuestIpAddress {
    ip_address: String,
}

/// REST client implementing [`VmService`] and [`InventoryService`].
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
}

impl RestClient {
    /// Creates a client with its own connection pool.
    pub fn new() -> Result<Self, VsphereError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { http })
    }

    fn url(session: &Session, path: &str) -> String {
        format!("https://{}/api{}", session.server, path)
    }

    /// Sends a request with the session token, mapping auth failures to
    /// a broken session.
    async fn send(
        &self,
        session: &Session,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, VsphereError> {
        let response = request
            .header("vmware-api-session-id", &session.token)
            .send()
            .await
            .map_err(|e| VsphereError::Unreachable(format!("{}: {e}", session.server)))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            session.mark_broken();
            return Err(VsphereError::Authentication(format!(
                "session for {} expired",
                session.server
            )));
        }
        Ok(response)
    }

    /// Resolves a VM name to its backend id, `None` when absent.
    async fn find_vm(
        &self,
        session: &Session,
        name: &str,
    ) -> Result<Option<VmSummary>, VsphereError> {
        let url = Self::url(session, "/vcenter/vm");
        let response = self
            .send(session, self.http.get(&url).query(&[("names", name)]))
            .await?;
        if !response.status().is_success() {
            return Err(VsphereError::Task(format!(
                "listing VM {name} returned {}",
                response.status()
            )));
        }
        let mut vms: Vec<VmSummary> = response.json().await?;
        Ok(if vms.is_empty() {
            None
        } else {
            Some(vms.remove(0))
        })
    }

    async fn clone_from_template(
        &self,
        session: &Session,
        desired: &DesiredVm,
        template: &str,
    ) -> Result<(), VsphereError> {
        let Some(source) = self.find_vm(session, template).await? else {
            return Err(VsphereError::NotFound(format!("template {template}")));
        };
        let url = Self::url(session, "/vcenter/vm");
        let body = json!({
            "source": source.vm,
            "name": desired.identity.name,
            "power_on": true,
        });
        let response = self
            .send(
                session,
                self.http.post(&url).query(&[("action", "clone")]).json(&body),
            )
            .await?;
        if !response.status().is_success() {
            return Err(VsphereError::Task(format!(
                "cloning {} from {template} returned {}",
                desired.identity, response.status()
            )));
        }
        info!(vm = %desired.identity, template, "clone task submitted");
        Ok(())
    }

    async fn power_on(&self, session: &Session, vm_id: &str) -> Result<(), VsphereError> {
        let url = Self::url(session, &format!("/vcenter/vm/{vm_id}/power"));
        let response = self
            .send(session, self.http.post(&url).query(&[("action", "start")]))
            .await?;
        // 400 here is "already powered on"; anything else is a failure.
        if !response.status().is_success() && response.status() != reqwest::StatusCode::BAD_REQUEST
        {
            return Err(VsphereError::Task(format!(
                "powering on {vm_id} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn observe(
        &self,
        session: &Session,
        name: &str,
        summary: &VmSummary,
    ) -> Result<ObservedVm, VsphereError> {
        let url = Self::url(session, &format!("/vcenter/vm/{}", summary.vm));
        let response = self.send(session, self.http.get(&url)).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(ObservedVm::not_found(name));
        }
        if !response.status().is_success() {
            return Err(VsphereError::Task(format!(
                "reading VM {name} returned {}",
                response.status()
            )));
        }
        let info: VmInfo = response.json().await?;

        let powered_on = info
            .power_state
            .as_deref()
            .or(summary.power_state.as_deref())
            == Some("POWERED_ON");
        if !powered_on {
            return Ok(ObservedVm {
                name: name.to_string(),
                state: VmState::Provisioning,
                bios_uuid: String::new(),
                vm_ref: summary.vm.clone(),
                network: Vec::new(),
            });
        }

        // Guest interfaces appear only once tools report in; until then
        // the VM counts as provisioning.
        let url = Self::url(
            session,
            &format!("/vcenter/vm/{}/guest/networking/interfaces", summary.vm),
        );
        let response = self.send(session, self.http.get(&url)).await?;
        let interfaces: Vec<GuestInterface> = if response.status().is_success() {
            response.json().await?
        } else {
            Vec::new()
        };
        if interfaces.is_empty() {
            return Ok(ObservedVm {
                name: name.to_string(),
                state: VmState::Provisioning,
                bios_uuid: String::new(),
                vm_ref: summary.vm.clone(),
                network: Vec::new(),
            });
        }

        let network = interfaces
            .into_iter()
            .map(|iface| ObservedNetworkDevice {
                mac_addr: iface.mac_address,
                ip_addrs: iface
                    .ip
                    .map(|ip| ip.ip_addresses.into_iter().map(|a| a.ip_address).collect())
                    .unwrap_or_default(),
                connected: true,
                network_name: None,
            })
            .collect();

        Ok(ObservedVm {
            name: name.to_string(),
            state: VmState::Ready,
            bios_uuid: info
                .identity
                .and_then(|i| i.bios_uuid)
                .unwrap_or_default(),
            vm_ref: summary.vm.clone(),
            network,
        })
    }
}

#[async_trait::async_trait]
impl VmService for RestClient {
    async fn reconcile_vm(
        &self,
        session: &Session,
        desired: &DesiredVm,
    ) -> Result<ObservedVm, VsphereError> {
        let name = &desired.identity.name;
        let summary = match self.find_vm(session, name).await? {
            Some(summary) => summary,
            None => {
                let template = desired.template.as_deref().ok_or_else(|| {
                    VsphereError::InvalidRequest(format!(
                        "VM {} does not exist and no template is set",
                        desired.identity
                    ))
                })?;
                self.clone_from_template(session, desired, template).await?;
                // The clone task runs asynchronously; report provisioning
                // and let the next reconcile pick the VM up.
                return Ok(ObservedVm {
                    state: VmState::Provisioning,
                    ..ObservedVm::not_found(name)
                });
            }
        };

        if summary.power_state.as_deref() != Some("POWERED_ON") {
            self.power_on(session, &summary.vm).await?;
        }
        self.observe(session, name, &summary).await
    }

    async fn destroy_vm(
        &self,
        session: &Session,
        identity: &VmIdentity,
    ) -> Result<DestroyResult, VsphereError> {
        let Some(summary) = self.find_vm(session, &identity.name).await? else {
            return Ok(DestroyResult {
                requeue_after: None,
                vm: ObservedVm::not_found(&identity.name),
            });
        };

        if summary.power_state.as_deref() == Some("POWERED_ON") {
            let url = Self::url(session, &format!("/vcenter/vm/{}/power", summary.vm));
            let response = self
                .send(session, self.http.post(&url).query(&[("action", "stop")]))
                .await?;
            debug!(vm = %identity, status = %response.status(), "power off requested");
            return Ok(DestroyResult {
                requeue_after: Some(DESTROY_POLL_DELAY),
                vm: ObservedVm {
                    state: VmState::Provisioning,
                    ..ObservedVm::not_found(&identity.name)
                },
            });
        }

        let url = Self::url(session, &format!("/vcenter/vm/{}", summary.vm));
        let response = self.send(session, self.http.delete(&url)).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(DestroyResult {
                requeue_after: None,
                vm: ObservedVm::not_found(&identity.name),
            });
        }
        if !response.status().is_success() {
            return Err(VsphereError::Task(format!(
                "deleting VM {identity} returned {}",
                response.status()
            )));
        }
        info!(vm = %identity, "VM deleted from backend");
        Ok(DestroyResult {
            requeue_after: None,
            vm: ObservedVm::not_found(&identity.name),
        })
    }
}

#[async_trait::async_trait]
impl InventoryService for RestClient {
    async fn find_resource_pool(&self, session: &Session, path: &str) -> Result<(), VsphereError> {
        let url = Self::url(session, "/vcenter/resource-pool");
        let response = self
            .send(session, self.http.get(&url).query(&[("names", path)]))
            .await?;
        if !response.status().is_success() {
            return Err(VsphereError::Task(format!(
                "listing resource pools returned {}",
                response.status()
            )));
        }
        let pools: Vec<serde_json::Value> = response.json().await?;
        if pools.is_empty() {
            return Err(VsphereError::NotFound(format!("resource pool {path}")));
        }
        Ok(())
    }

    async fn find_folder(&self, session: &Session, path: &str) -> Result<(), VsphereError> {
        let url = Self::url(session, "/vcenter/folder");
        let response = self
            .send(session, self.http.get(&url).query(&[("names", path)]))
            .await?;
        if !response.status().is_success() {
            return Err(VsphereError::Task(format!(
                "listing folders returned {}",
                response.status()
            )));
        }
        let folders: Vec<serde_json::Value> = response.json().await?;
        if folders.is_empty() {
            return Err(VsphereError::NotFound(format!("folder {path}")));
        }
        Ok(())
    }
}
