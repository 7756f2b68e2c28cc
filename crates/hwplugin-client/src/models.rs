//! Hardware plugin provisioning API models
//!
//! Wire shapes of `/hardware-manager/provisioning/v1`. Field names follow the
//! plugin API (camelCase JSON).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Condition type reported once nodes are allocated
pub const CONDITION_PROVISIONED: &str = "Provisioned";
/// Condition type reported once node configuration is applied
pub const CONDITION_CONFIGURED: &str = "Configured";

/// A node allocation request as submitted to the plugin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeAllocationRequest {
    /// Cluster the nodes are for
    pub cluster_id: String,
    /// Site the nodes must be located in
    pub site: String,
    /// Interface label used for PXE/boot
    #[serde(default)]
    pub boot_interface_label: String,
    /// Monotonic configuration transaction (request generation)
    #[serde(default)]
    pub config_transaction_id: i64,
    /// One entry per role
    pub node_group: Vec<NodeGroup>,
}

/// Wrapper kept for wire compatibility
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    pub node_group_data: NodeGroupData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupData {
    /// Group name (e.g. controller, worker)
    pub name: String,
    /// Cluster role served by the group (master, worker)
    pub role: String,
    /// Hardware profile to apply
    pub hw_profile: String,
    /// Resource pool to allocate from
    #[serde(rename = "resourceGroupId")]
    pub resource_pool_id: String,
    /// Extra node selection labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_selector: BTreeMap<String, String>,
    /// Number of nodes requested
    pub size: u32,
}

/// GET response for a node allocation request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeAllocationRequestResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_allocation_request: Option<NodeAllocationRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeAllocationRequestStatus>,
}

impl NodeAllocationRequestResponse {
    /// Look up a status condition by type
    #[must_use]
    pub fn condition(&self, type_: &str) -> Option<&PluginCondition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.type_ == type_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeAllocationRequestStatus {
    #[serde(default)]
    pub conditions: Vec<PluginCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_config_transaction_id: Option<i64>,
}

/// Condition as reported by the plugin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PluginCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" / "False" / "Unknown"
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl PluginCondition {
    /// True when status is "True"
    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status.eq_ignore_ascii_case("true")
    }
}

/// A node allocated by the plugin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedNode {
    pub id: String,
    pub group_name: String,
    #[serde(default)]
    pub hw_profile: String,
    #[serde(default)]
    pub config_transaction_id: i64,
    pub bmc: Bmc,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AllocatedNodeStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Bmc {
    pub address: String,
    /// Secret in the plugin namespace holding BMC credentials
    pub credentials_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,
    #[serde(default)]
    pub label: String,
    pub mac_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedNodeStatus {
    #[serde(default)]
    pub conditions: Vec<PluginCondition>,
}

/// Version discovery response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiVersions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri_prefix: Option<String>,
    #[serde(default)]
    pub api_versions: Vec<ApiVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ApiVersion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// RFC 7807 `application/problem+json` body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProblemDetails {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}
