//! Persistence seam for the reconciler.
//!
//! The reconciler and the callback endpoint only talk to records through
//! [`ProvisioningStore`]. [`KubeStore`] backs it with the Kubernetes API;
//! tests use the in-memory store.

mod kube_store;
#[cfg(test)]
pub mod memory;

pub use kube_store::KubeStore;

use crate::error::ControllerError;
use crds::{AllocatedNode, ClusterTemplate, ProvisioningRequest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carried by per-cluster copies of a governance policy
pub const ROOT_POLICY_LABEL: &str = "policy.open-cluster-management.io/root-policy";

/// A configuration document (ConfigMap)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigDocument {
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, String>,
    pub immutable: bool,
}

/// Rendered ClusterInstance ready to apply
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterInstanceDoc {
    pub namespace: String,
    pub name: String,
    pub spec: serde_json::Value,
}

/// Condition reported by the cluster installer
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// ClusterInstance as stored, with installer conditions
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterInstanceRecord {
    pub doc: ClusterInstanceDoc,
    pub conditions: Vec<InstanceCondition>,
}

impl ClusterInstanceRecord {
    /// Installer condition by type
    #[must_use]
    pub fn condition(&self, type_: &str) -> Option<&InstanceCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// One per-cluster policy copy as reported by the policy engine
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PolicyRecord {
    /// `<parentNamespace>.<parentName>`
    pub name: String,
    /// Cluster namespace the copy lives in
    pub namespace: String,
    /// Compliant / NonCompliant / Pending; empty before first evaluation
    pub compliant: String,
    /// enforce / inform
    pub remediation_action: String,
}

/// Record access used by the reconciler and the callback endpoint
#[async_trait::async_trait]
pub trait ProvisioningStore: Send + Sync {
    /// Fetch a ProvisioningRequest
    async fn get_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ProvisioningRequest>, ControllerError>;

    /// All ProvisioningRequests in scope
    async fn list_requests(&self) -> Result<Vec<ProvisioningRequest>, ControllerError>;

    /// Replace the status of a request.
    ///
    /// Fails with `Conflict` when `metadata.resourceVersion` is stale.
    async fn replace_request_status(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningRequest, ControllerError>;

    /// Overwrite the finalizer list of a request
    async fn set_request_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ControllerError>;

    /// Fetch a ClusterTemplate
    async fn get_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterTemplate>, ControllerError>;

    /// All ClusterTemplates in scope
    async fn list_templates(&self) -> Result<Vec<ClusterTemplate>, ControllerError>;

    /// Replace the status of a template; `Conflict` when stale
    async fn replace_template_status(
        &self,
        template: &ClusterTemplate,
    ) -> Result<ClusterTemplate, ControllerError>;

    /// Persist a generated template identifier
    async fn set_template_id(
        &self,
        namespace: &str,
        name: &str,
        template_id: &str,
    ) -> Result<ClusterTemplate, ControllerError>;

    /// Overwrite the finalizer list of a template
    async fn set_template_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ControllerError>;

    /// Fetch a configuration document
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigDocument>, ControllerError>;

    /// Create or update a configuration document
    async fn apply_config_map(&self, doc: &ConfigDocument) -> Result<(), ControllerError>;

    /// Mark a configuration document immutable
    async fn mark_config_map_immutable(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError>;

    /// Release image of a cluster image set
    async fn get_cluster_image_set(&self, name: &str) -> Result<Option<String>, ControllerError>;

    /// Create the namespace if missing
    async fn ensure_namespace(&self, name: &str) -> Result<(), ControllerError>;

    /// Server-side apply a ClusterInstance, optionally as a dry run
    async fn apply_cluster_instance(
        &self,
        doc: &ClusterInstanceDoc,
        dry_run: bool,
    ) -> Result<(), ControllerError>;

    /// Fetch an applied ClusterInstance
    async fn get_cluster_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterInstanceRecord>, ControllerError>;

    /// Delete a ClusterInstance; missing is not an error
    async fn delete_cluster_instance(&self, namespace: &str, name: &str)
    -> Result<(), ControllerError>;

    /// Copy a secret between namespaces; a missing source is an input error
    async fn copy_secret(
        &self,
        from_namespace: &str,
        name: &str,
        to_namespace: &str,
    ) -> Result<(), ControllerError>;

    /// Create or update an opaque secret
    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), ControllerError>;

    /// Create or update an AllocatedNode mirror, including its status
    async fn apply_allocated_node(&self, node: &AllocatedNode) -> Result<(), ControllerError>;

    /// Delete every AllocatedNode mirror owned by a request
    async fn delete_allocated_nodes(
        &self,
        namespace: &str,
        provisioning_request: &str,
    ) -> Result<(), ControllerError>;

    /// Policies scoped to a cluster namespace
    async fn list_cluster_policies(
        &self,
        cluster_namespace: &str,
    ) -> Result<Vec<PolicyRecord>, ControllerError>;
}
