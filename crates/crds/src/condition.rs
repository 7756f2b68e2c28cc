//! Status conditions shared by all provisioning CRDs
//!
//! Follows the Kubernetes `metav1.Condition` shape: a typed condition with a
//! True/False/Unknown status, a machine-readable reason and a human-readable message.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Condition types used on `ClusterTemplate` and `ProvisioningRequest` status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// ClusterTemplate passed validation
    ClusterTemplateValidated,
    /// ProvisioningRequest input was validated against its template
    Validated,
    /// ClusterInstance was rendered and passed dry-run
    ClusterInstanceRendered,
    /// Hardware allocation completed
    HardwareProvisioned,
    /// Allocated node details were applied to the ClusterInstance
    HardwareNodeConfigApplied,
    /// Cluster installation completed
    ClusterProvisioned,
    /// Policy configuration is compliant
    ConfigurationApplied,
}

impl ConditionType {
    /// Wire name of the condition type
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClusterTemplateValidated => "ClusterTemplateValidated",
            Self::Validated => "Validated",
            Self::ClusterInstanceRendered => "ClusterInstanceRendered",
            Self::HardwareProvisioned => "HardwareProvisioned",
            Self::HardwareNodeConfigApplied => "HardwareNodeConfigApplied",
            Self::ClusterProvisioned => "ClusterProvisioned",
            Self::ConfigurationApplied => "ConfigurationApplied",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition reasons
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionReason {
    /// Step finished successfully
    Completed,
    /// Step failed and needs user correction
    Failed,
    /// Step is underway
    InProgress,
    /// Inform policies report drift
    OutOfDate,
    /// No policies are present for the cluster
    Missing,
    /// Step exceeded its configured timeout
    TimedOut,
    /// Node configuration could not be applied
    NotApplied,
    /// Last observation could not be refreshed
    Unknown,
}

impl ConditionReason {
    /// Wire name of the reason
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::InProgress => "InProgress",
            Self::OutOfDate => "OutOfDate",
            Self::Missing => "Missing",
            Self::TimedOut => "TimedOut",
            Self::NotApplied => "NotApplied",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Validated, HardwareProvisioned)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: ConditionReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.as_str().to_string(),
            status,
            reason: reason.as_str().to_string(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// True when this condition has status True
    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    /// True when the reason matches
    #[must_use]
    pub fn has_reason(&self, reason: ConditionReason) -> bool {
        self.reason == reason.as_str()
    }
}

/// Find a condition by type
#[must_use]
pub fn find_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_.as_str())
}

/// True when the condition exists and has status True
#[must_use]
pub fn is_condition_true(conditions: &[Condition], type_: ConditionType) -> bool {
    find_condition(conditions, type_).is_some_and(Condition::is_true)
}

/// Insert or update a condition.
///
/// `lastTransitionTime` only moves when the status changes, matching
/// `meta.SetStatusCondition`. Returns true if anything changed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: ConditionReason,
    message: impl Into<String>,
) -> bool {
    let message = message.into();
    match conditions.iter_mut().find(|c| c.type_ == type_.as_str()) {
        Some(existing) => {
            let mut changed = false;
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = Utc::now();
                changed = true;
            }
            if existing.reason != reason.as_str() {
                existing.reason = reason.as_str().to_string();
                changed = true;
            }
            if existing.message != message {
                existing.message = message;
                changed = true;
            }
            changed
        }
        None => {
            conditions.push(Condition::new(type_, status, reason, message));
            true
        }
    }
}

/// Schema for free-form documents embedded in CRDs.
///
/// The API server prunes unknown fields unless told otherwise.
pub(crate) fn preserve_unknown_fields(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}
