//! AllocatedNode CRD
//!
//! Local mirror of a node handed out by a hardware plugin. The broker writes
//! it once allocation completes and records the hostname the rendered
//! ClusterInstance assigned to the node.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "clcm.microscaler.io",
    version = "v1alpha1",
    kind = "AllocatedNode",
    namespaced,
    status = "AllocatedNodeStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedNodeSpec {
    /// Allocation the node belongs to
    pub node_allocation_request: String,

    /// Owning ProvisioningRequest (ownership table entry)
    pub provisioning_request: String,

    /// Node group the plugin placed the node in
    pub group_name: String,

    /// Hardware profile applied to the node
    #[serde(default)]
    pub hw_profile: String,

    /// BMC access details
    pub bmc: BmcDetails,

    /// Network interfaces reported by the plugin
    #[serde(default)]
    pub interfaces: Vec<NodeInterface>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BmcDetails {
    /// Redfish/IPMI address
    pub address: String,

    /// Secret holding the BMC username/password
    pub credentials_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeInterface {
    /// Interface name on the host (e.g. eno1)
    pub name: String,

    /// Label used to match the interface in the rendered node network
    #[serde(default)]
    pub label: String,

    /// MAC address
    pub mac_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedNodeStatus {
    /// Hostname assigned by the rendered ClusterInstance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}
