//! ProvisioningRequest CRD
//!
//! A single instance of "stand up and keep compliant one cluster".

use crate::cluster_template::canonical_template_name;
use crate::condition::{Condition, ConditionType, find_condition};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer guarding cleanup of hardware and rendered resources
pub const PROVISIONING_REQUEST_FINALIZER: &str = "clcm.microscaler.io/provisioning-request-finalizer";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "clcm.microscaler.io",
    version = "v1alpha1",
    kind = "ProvisioningRequest",
    namespaced,
    status = "ProvisioningRequestStatus",
    shortname = "pr",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRequestSpec {
    /// Human-friendly name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Referenced ClusterTemplate name
    pub template_name: String,

    /// Referenced ClusterTemplate version
    pub template_version: String,

    /// Request parameters, validated against the template's parameter schema
    #[schemars(schema_with = "crate::condition::preserve_unknown_fields")]
    pub template_parameters: serde_json::Value,
}

impl ProvisioningRequestSpec {
    /// Canonical identifier of the referenced template
    #[must_use]
    pub fn template_ref(&self) -> String {
        canonical_template_name(&self.template_name, &self.template_version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
/// Provisioning phase
///
/// Serializes as PascalCase ("Pending", "Failed", etc.) but deserializes
/// lowercase as well.
#[serde(rename_all = "PascalCase")]
pub enum ProvisioningPhase {
    /// Not yet picked up
    #[default]
    #[serde(alias = "pending")]
    Pending,

    /// Input is being validated
    #[serde(alias = "validating")]
    Validating,

    /// ClusterInstance is being rendered
    #[serde(alias = "rendering")]
    Rendering,

    /// Waiting for hardware allocation
    #[serde(alias = "hardwareProvisioning")]
    HardwareProvisioning,

    /// Waiting for cluster installation
    #[serde(alias = "installing")]
    Installing,

    /// Steady state; compliance is tracked every pass
    #[serde(alias = "monitoring")]
    Monitoring,

    /// Terminal until the user edits input
    #[serde(alias = "failed")]
    Failed,
}

impl std::fmt::Display for ProvisioningPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Validating => "Validating",
            Self::Rendering => "Rendering",
            Self::HardwareProvisioning => "HardwareProvisioning",
            Self::Installing => "Installing",
            Self::Monitoring => "Monitoring",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRequestStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ProvisioningPhase,

    /// Details for the current phase (last error or progress note)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_details: Option<String>,

    /// Typed conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Rendered cluster details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_details: Option<ClusterDetails>,

    /// Per-policy compliance, sorted by name
    #[serde(default)]
    pub policies: Vec<PolicyDetails>,

    /// Hardware allocation tracking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_allocation_request_ref: Option<NodeAllocationRequestRef>,

    /// Idempotency marker for hardware callbacks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackMarker>,

    /// Generation last processed by the reconciler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetails {
    /// Name of the rendered ClusterInstance
    pub name: String,

    /// When installation started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_provision_started_at: Option<DateTime<Utc>>,

    /// When the configuration last became non-compliant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_compliant_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDetails {
    /// Policy name with the cluster-scoping prefix removed
    pub policy_name: String,

    /// Namespace of the parent policy
    pub policy_namespace: String,

    /// Compliant / NonCompliant / Pending
    pub compliant: String,

    /// enforce / inform
    pub remediation_action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeAllocationRequestRef {
    /// Identifier returned by the hardware plugin
    pub node_allocation_request_id: String,

    /// Hardware plugin that owns the allocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_plugin: Option<String>,

    /// When allocation started (drives the hardware provisioning timeout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_provisioning_check_start: Option<DateTime<Utc>>,
}

/// Last callback seen for this request
///
/// Compared and swapped under optimistic concurrency; never business state.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallbackMarker {
    /// Callback status value as sent by the plugin
    pub status: String,

    /// Allocation the callback refers to
    pub node_allocation_request_id: String,

    /// When the callback was accepted
    pub received_at: DateTime<Utc>,
}

impl ProvisioningRequest {
    /// Status conditions, empty when no status has been written
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    /// Look up a condition by type
    #[must_use]
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        find_condition(self.conditions(), type_)
    }

    /// Current phase, `Pending` when no status has been written
    #[must_use]
    pub fn phase(&self) -> ProvisioningPhase {
        self.status.as_ref().map(|s| s.phase.clone()).unwrap_or_default()
    }
}
