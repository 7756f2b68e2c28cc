//! Compliance Aggregator.
//!
//! Folds the per-cluster policy copies into one `ConfigurationApplied`
//! verdict and keeps `clusterDetails.nonCompliantAt` in step with it.

use super::{LONG_REQUEUE, MEDIUM_REQUEUE, ReconcileAction, Reconciler};
use crate::error::ControllerError;
use crate::store::PolicyRecord;
use chrono::{DateTime, Utc};
use crds::{
    ClusterDetails, ConditionReason, ConditionStatus, ConditionType, PolicyDetails,
    ProvisioningRequestStatus, find_condition, set_condition,
};
use std::time::Duration;
use tracing::{debug, info, warn};

const INFORM: &str = "inform";
const COMPLIANT: &str = "Compliant";

/// Message for a configuration timeout
pub const TIMED_OUT_MESSAGE: &str = "The configuration is still being applied, but it timed out";

/// Aggregate state of a cluster's policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No policies target the cluster
    Missing,
    /// Enforce policies are still converging
    InProgress,
    /// Inform policies report drift
    OutOfDate,
    /// Everything is compliant
    Completed,
}

impl Verdict {
    /// Condition status, reason and message for this verdict
    #[must_use]
    pub fn condition(self) -> (ConditionStatus, ConditionReason, &'static str) {
        match self {
            Self::Missing => (
                ConditionStatus::True,
                ConditionReason::Missing,
                "No configuration present",
            ),
            Self::InProgress => (
                ConditionStatus::False,
                ConditionReason::InProgress,
                "The configuration is still being applied",
            ),
            Self::OutOfDate => (
                ConditionStatus::False,
                ConditionReason::OutOfDate,
                "The configuration is out of date",
            ),
            Self::Completed => (
                ConditionStatus::True,
                ConditionReason::Completed,
                "The configuration is up to date",
            ),
        }
    }

    fn is_compliant(self) -> bool {
        matches!(self, Self::Missing | Self::Completed)
    }
}

/// Build the per-policy details and the verdict for a set of policy copies
#[must_use]
pub fn aggregate(records: &[PolicyRecord]) -> (Vec<PolicyDetails>, Verdict) {
    let mut details: Vec<PolicyDetails> = records
        .iter()
        .map(|record| {
            let (namespace, name) = record
                .name
                .split_once('.')
                .unwrap_or(("", record.name.as_str()));
            PolicyDetails {
                policy_name: name.to_string(),
                policy_namespace: namespace.to_string(),
                compliant: record.compliant.clone(),
                remediation_action: record.remediation_action.clone(),
            }
        })
        .collect();
    details.sort_by(|a, b| {
        a.policy_name
            .cmp(&b.policy_name)
            .then_with(|| a.policy_namespace.cmp(&b.policy_namespace))
    });

    // Only an evaluated Compliant state counts; an empty state means the
    // policy has not been evaluated yet. Any action other than inform remediates.
    let unsettled = |inform: bool| {
        records.iter().any(|r| {
            r.remediation_action.eq_ignore_ascii_case(INFORM) == inform && r.compliant != COMPLIANT
        })
    };
    let verdict = if records.is_empty() {
        Verdict::Missing
    } else if unsettled(false) {
        Verdict::InProgress
    } else if unsettled(true) {
        Verdict::OutOfDate
    } else {
        Verdict::Completed
    };
    (details, verdict)
}

/// New value of `nonCompliantAt` given the previous `ConfigurationApplied`
/// reason and the fresh verdict.
#[must_use]
pub fn next_non_compliant_at(
    previous_reason: Option<&str>,
    current: Option<DateTime<Utc>>,
    verdict: Verdict,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let keep_from: &[ConditionReason] = match verdict {
        Verdict::Missing | Verdict::Completed => return None,
        Verdict::InProgress => &[
            ConditionReason::InProgress,
            ConditionReason::TimedOut,
            ConditionReason::Unknown,
        ],
        Verdict::OutOfDate => &[
            ConditionReason::InProgress,
            ConditionReason::TimedOut,
            ConditionReason::Unknown,
            ConditionReason::OutOfDate,
        ],
    };
    let keep = previous_reason.is_some_and(|r| keep_from.iter().any(|k| k.as_str() == r));
    match current {
        Some(since) if keep => Some(since),
        _ => Some(now),
    }
}

impl Reconciler {
    /// Refresh `ConfigurationApplied` and the policy list for a cluster.
    ///
    /// A failed policy lookup only marks the condition Unknown.
    pub(crate) async fn compliance_stage(
        &self,
        cluster_namespace: &str,
        configuration_timeout: Duration,
        status: &mut ProvisioningRequestStatus,
    ) -> Result<ReconcileAction, ControllerError> {
        let records = match self
            .call(
                "list policies",
                self.store.list_cluster_policies(cluster_namespace),
            )
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to read policies for cluster {}: {}", cluster_namespace, e);
                set_condition(
                    &mut status.conditions,
                    ConditionType::ConfigurationApplied,
                    ConditionStatus::Unknown,
                    ConditionReason::Unknown,
                    format!("Failed to fetch policy compliance: {e}"),
                );
                return Err(e);
            }
        };

        let (policies, verdict) = aggregate(&records);
        let now = Utc::now();
        let previous_reason = find_condition(&status.conditions, ConditionType::ConfigurationApplied)
            .map(|c| c.reason.clone());
        let details = status.cluster_details.get_or_insert_with(ClusterDetails::default);
        details.non_compliant_at = next_non_compliant_at(
            previous_reason.as_deref(),
            details.non_compliant_at,
            verdict,
            now,
        );

        let (mut condition_status, mut reason, mut message) = verdict.condition();
        if verdict == Verdict::InProgress {
            let since = details.non_compliant_at.unwrap_or(now);
            let elapsed = now.signed_duration_since(since).to_std().unwrap_or_default();
            if elapsed > configuration_timeout {
                (condition_status, reason, message) =
                    (ConditionStatus::False, ConditionReason::TimedOut, TIMED_OUT_MESSAGE);
            }
        }

        if previous_reason.as_deref() != Some(reason.as_str()) {
            info!(
                "Configuration of cluster {} is now {} ({} policies)",
                cluster_namespace,
                reason,
                policies.len()
            );
        } else {
            debug!("Configuration of cluster {} is {}", cluster_namespace, reason);
        }
        status.policies = policies;
        set_condition(
            &mut status.conditions,
            ConditionType::ConfigurationApplied,
            condition_status,
            reason,
            message,
        );

        Ok(ReconcileAction::requeue(if verdict.is_compliant() {
            LONG_REQUEUE
        } else {
            MEDIUM_REQUEUE
        }))
    }
}
