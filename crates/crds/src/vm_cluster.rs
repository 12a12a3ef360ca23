//! VmCluster CRD
//!
//! The owning cluster resource for a group of VirtualMachines. Carries
//! the backend server coordinates, optional credentials reference and
//! the pause switch consulted at the top of every reconcile.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::references::IdentityReference;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vmops.microscaler.io",
    version = "v1alpha1",
    kind = "VmCluster",
    namespaced,
    status = "VmClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VmClusterSpec {
    /// Backend server (vCenter) hostname
    pub server: String,

    /// TLS thumbprint of the backend server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbprint: Option<String>,

    /// Pause reconciliation of this cluster and every resource in it
    #[serde(default)]
    pub paused: bool,

    /// Secret holding backend credentials; falls back to the
    /// controller's own credentials when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_ref: Option<IdentityReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct VmClusterStatus {
    /// True once the backend is reachable with the resolved credentials
    #[serde(default)]
    pub ready: bool,
}

impl VmCluster {
    /// Pause check consulted at the top of each reconcile: true when the
    /// cluster spec is paused or either object carries the pause
    /// annotation.
    pub fn is_paused(&self, annotations: Option<&std::collections::BTreeMap<String, String>>) -> bool {
        if self.spec.paused {
            return true;
        }
        let paused_annotation = |a: Option<&std::collections::BTreeMap<String, String>>| {
            a.is_some_and(|m| m.contains_key(crate::references::PAUSED_ANNOTATION))
        };
        paused_annotation(self.metadata.annotations.as_ref()) || paused_annotation(annotations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn cluster(paused: bool) -> VmCluster {
        VmCluster {
            metadata: ObjectMeta {
                name: Some("c1".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: VmClusterSpec {
                server: "vc.example.com".to_string(),
                thumbprint: None,
                paused,
                identity_ref: None,
            },
            status: None,
        }
    }

    #[test]
    fn paused_by_spec() {
        assert!(cluster(true).is_paused(None));
        assert!(!cluster(false).is_paused(None));
    }

    #[test]
    fn paused_by_annotation_on_either_object() {
        let mut c = cluster(false);
        let mut annotations = BTreeMap::new();
        annotations.insert(
            crate::references::PAUSED_ANNOTATION.to_string(),
            String::new(),
        );
        assert!(cluster(false).is_paused(Some(&annotations)));

        c.metadata.annotations = Some(annotations);
        assert!(c.is_paused(None));
    }
}
