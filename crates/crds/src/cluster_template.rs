//! ClusterTemplate CRD
//!
//! A reusable, versioned definition of what a ProvisioningRequest may ask for
//! and where its default configuration lives.

use crate::condition::{Condition, ConditionType, find_condition};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Required top-level parameter: cluster name
pub const PARAM_NODE_CLUSTER_NAME: &str = "nodeClusterName";
/// Required top-level parameter: O-Cloud site identifier
pub const PARAM_OCLOUD_SITE_ID: &str = "oCloudSiteId";
/// Required top-level parameter: cluster installation sub-document
pub const PARAM_CLUSTER_INSTANCE: &str = "clusterInstanceParameters";
/// Required top-level parameter: policy configuration sub-document
pub const PARAM_POLICY_CONFIG: &str = "policyTemplateParameters";

/// ConfigMap key holding the ClusterInstance defaults document
pub const CLUSTER_INSTANCE_DEFAULTS_KEY: &str = "clusterinstance-defaults";
/// ConfigMap key holding the policy template defaults document
pub const POLICY_TEMPLATE_DEFAULTS_KEY: &str = "policytemplate-defaults";
/// ConfigMap key for the cluster installation timeout
pub const CLUSTER_INSTALLATION_TIMEOUT_KEY: &str = "clusterInstallationTimeout";
/// ConfigMap key for the cluster configuration timeout
pub const CLUSTER_CONFIGURATION_TIMEOUT_KEY: &str = "clusterConfigurationTimeout";
/// ConfigMap key for the hardware provisioning timeout
pub const HARDWARE_PROVISIONING_TIMEOUT_KEY: &str = "hardwareProvisioningTimeout";
/// Hardware profile key naming the hardware plugin
pub const HW_MGR_ID_KEY: &str = "hwMgrId";
/// Hardware profile key naming the boot interface label
pub const BOOT_INTERFACE_LABEL_KEY: &str = "bootInterfaceLabel";
/// Hardware profile key holding the node group definitions
pub const NODE_GROUP_DATA_KEY: &str = "nodeGroupData";

/// Finalizer blocking deletion while requests still reference the template
pub const CLUSTER_TEMPLATE_FINALIZER: &str = "clcm.microscaler.io/cluster-template-finalizer";

/// Build the canonical template identifier `<name>.<version>`
#[must_use]
pub fn canonical_template_name(name: &str, version: &str) -> String {
    format!("{name}.{version}")
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "clcm.microscaler.io",
    version = "v1alpha1",
    kind = "ClusterTemplate",
    namespaced,
    status = "ClusterTemplateStatus",
    shortname = "ct"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTemplateSpec {
    /// Template name (first half of the canonical identifier)
    pub name: String,

    /// Template version (second half of the canonical identifier)
    pub version: String,

    /// Release the template installs; must match the referenced image set
    pub release: String,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Unique template identifier (UUID, generated when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    /// Referenced configuration documents
    pub templates: Templates,

    /// JSON-Schema-like document describing accepted request parameters
    #[schemars(schema_with = "crate::condition::preserve_unknown_fields")]
    pub template_parameter_schema: serde_json::Value,
}

/// Names of the configuration documents a template references
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Templates {
    /// ConfigMap holding the ClusterInstance defaults
    pub cluster_instance_defaults: String,

    /// ConfigMap holding the policy template defaults
    pub policy_template_defaults: String,

    /// ConfigMap holding the hardware profile (role to node group mapping)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTemplateStatus {
    /// Validation condition
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation that passed validation; later generations are rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated_generation: Option<i64>,
}

impl ClusterTemplate {
    /// Canonical identifier derived from the spec
    #[must_use]
    pub fn canonical_name(&self) -> String {
        canonical_template_name(&self.spec.name, &self.spec.version)
    }

    /// The `ClusterTemplateValidated` condition, if set
    #[must_use]
    pub fn validated_condition(&self) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, ConditionType::ClusterTemplateValidated))
    }

    /// True when the current generation is the one that passed validation
    #[must_use]
    pub fn is_validated(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        let validated = self.validated_condition().is_some_and(Condition::is_true);
        validated && status.validated_generation == self.metadata.generation
    }
}
