//! Hardware Allocation Broker.
//!
//! Turns a rendered ClusterInstance into a node allocation request, follows
//! the allocation on the hardware plugin, and once nodes are handed out folds
//! their BMC and NIC details back into the rendered nodes.

use super::duration::duration_from_config;
use super::render::RequestParams;
use super::{Flow, LONG_REQUEUE, ReconcileAction, Reconciler, SHORT_REQUEUE};
use crate::error::ControllerError;
use crate::store::{ClusterInstanceDoc, ConfigDocument};
use chrono::Utc;
use crds::{
    AllocatedNodeSpec, AllocatedNodeStatus, BOOT_INTERFACE_LABEL_KEY, BmcDetails, ConditionReason,
    ConditionStatus, ConditionType, HARDWARE_PROVISIONING_TIMEOUT_KEY, HW_MGR_ID_KEY,
    NODE_GROUP_DATA_KEY, NodeAllocationRequestRef, NodeInterface, ProvisioningPhase,
    ProvisioningRequestStatus, set_condition,
};
use hwplugin_client::{CONDITION_PROVISIONED, NodeAllocationRequest, NodeGroup, NodeGroupData};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default hardware provisioning timeout
pub const DEFAULT_HARDWARE_TIMEOUT: Duration = Duration::from_secs(90 * 60);

/// One node group of a hardware profile
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    pub name: String,
    pub role: String,
    pub hw_profile: String,
    #[serde(default)]
    pub resource_pool_id: String,
    #[serde(default)]
    pub resource_selector: BTreeMap<String, String>,
}

/// Hardware profile referenced by a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareProfile {
    /// Plugin that serves the allocation
    pub plugin: String,
    /// Label of the interface nodes boot from
    pub boot_interface_label: String,
    /// Role to node group mapping
    pub node_groups: Vec<NodeGroupSpec>,
    /// How long allocation may take
    pub timeout: Duration,
}

impl HardwareProfile {
    /// Parse a hardware profile ConfigMap, reporting every problem
    pub fn from_config(doc: &ConfigDocument) -> Result<Self, String> {
        let mut problems = Vec::new();
        let field = |key: &str, problems: &mut Vec<String>| {
            let value = doc.data.get(key).map(|v| v.trim().to_string()).unwrap_or_default();
            if value.is_empty() {
                problems.push(format!("the ConfigMap {} is missing {key}", doc.name));
            }
            value
        };
        let plugin = field(HW_MGR_ID_KEY, &mut problems);
        let boot_interface_label = field(BOOT_INTERFACE_LABEL_KEY, &mut problems);

        let node_groups = match doc.data.get(NODE_GROUP_DATA_KEY) {
            None => {
                problems.push(format!("the ConfigMap {} is missing {NODE_GROUP_DATA_KEY}", doc.name));
                Vec::new()
            }
            Some(raw) => match serde_yaml::from_str::<Vec<NodeGroupSpec>>(raw) {
                Ok(groups) if groups.is_empty() => {
                    problems.push(format!("{NODE_GROUP_DATA_KEY} in ConfigMap {} is empty", doc.name));
                    groups
                }
                Ok(groups) => groups,
                Err(e) => {
                    problems.push(format!(
                        "failed to parse {NODE_GROUP_DATA_KEY} from ConfigMap {}: {e}",
                        doc.name
                    ));
                    Vec::new()
                }
            },
        };

        let timeout = duration_from_config(
            &doc.data,
            HARDWARE_PROVISIONING_TIMEOUT_KEY,
            &doc.name,
            DEFAULT_HARDWARE_TIMEOUT,
        )
        .unwrap_or_else(|e| {
            problems.push(e);
            DEFAULT_HARDWARE_TIMEOUT
        });

        if !problems.is_empty() {
            return Err(problems.join("; "));
        }
        Ok(Self {
            plugin,
            boot_interface_label,
            node_groups,
            timeout,
        })
    }

    fn group_for_role(&self, role: &str) -> Option<&NodeGroupSpec> {
        self.node_groups.iter().find(|g| g.role == role)
    }
}

fn rendered_nodes(rendered: &Value) -> Result<&Vec<Value>, String> {
    rendered
        .get("nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| "nodes not found in the rendered ClusterInstance".to_string())
}

fn node_str<'a>(node: &'a Value, key: &str) -> &'a str {
    node.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// One node group per profile entry, sized by counting rendered nodes per role
pub fn build_node_groups(
    profile: &HardwareProfile,
    rendered: &Value,
) -> Result<Vec<NodeGroup>, String> {
    let mut role_counts: HashMap<&str, u32> = HashMap::new();
    for node in rendered_nodes(rendered)? {
        *role_counts.entry(node_str(node, "role")).or_default() += 1;
    }
    let mut uncovered: Vec<&str> = role_counts
        .keys()
        .copied()
        .filter(|role| profile.group_for_role(role).is_none())
        .collect();
    if !uncovered.is_empty() {
        uncovered.sort_unstable();
        return Err(format!(
            "the hardware profile has no node group for role(s): {}",
            uncovered.join(", ")
        ));
    }

    Ok(profile
        .node_groups
        .iter()
        .map(|group| NodeGroup {
            node_group_data: NodeGroupData {
                name: group.name.clone(),
                role: group.role.clone(),
                hw_profile: group.hw_profile.clone(),
                resource_pool_id: group.resource_pool_id.clone(),
                resource_selector: group.resource_selector.clone(),
                size: role_counts.get(group.role.as_str()).copied().unwrap_or(0),
            },
        })
        .collect())
}

/// Build the allocation request for a rendered cluster
pub fn build_allocation_request(
    profile: &HardwareProfile,
    rendered: &Value,
    params: &RequestParams,
    generation: i64,
) -> Result<NodeAllocationRequest, String> {
    Ok(NodeAllocationRequest {
        cluster_id: params.cluster_name.clone(),
        site: params.site_id.clone(),
        boot_interface_label: profile.boot_interface_label.clone(),
        config_transaction_id: generation,
        node_group: build_node_groups(profile, rendered)?,
    })
}

/// Node identifier and the hostname it was assigned
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAssignment {
    pub node: hwplugin_client::AllocatedNode,
    pub hostname: String,
}

/// Fill BMC, boot MAC and interface MAC details into the rendered nodes.
///
/// Rendered nodes are matched to allocated nodes by role (via the profile's
/// node groups) in order; interfaces are matched by label.
pub fn apply_node_details(
    rendered: &mut Value,
    profile: &HardwareProfile,
    allocated: &[hwplugin_client::AllocatedNode],
) -> Result<Vec<NodeAssignment>, String> {
    let mut by_group: HashMap<&str, VecDeque<&hwplugin_client::AllocatedNode>> = HashMap::new();
    for node in allocated {
        by_group.entry(node.group_name.as_str()).or_default().push_back(node);
    }

    let nodes = rendered
        .get_mut("nodes")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| "nodes not found in the rendered ClusterInstance".to_string())?;

    let mut assignments = Vec::new();
    let mut unmatched = Vec::new();
    for (index, node) in nodes.iter_mut().enumerate() {
        let hostname = node_str(node, "hostName").to_string();
        let role = node_str(node, "role").to_string();
        let hw_node = profile
            .group_for_role(&role)
            .and_then(|group| by_group.get_mut(group.name.as_str()))
            .and_then(VecDeque::pop_front);
        let Some(hw_node) = hw_node else {
            unmatched.push(format!("Index: {index}, Host Name: {hostname}"));
            continue;
        };

        let boot_mac = hw_node
            .interfaces
            .iter()
            .find(|i| i.label == profile.boot_interface_label)
            .map(|i| i.mac_address.clone())
            .ok_or_else(|| {
                format!(
                    "no interface labelled {} on allocated node {} for host {hostname}",
                    profile.boot_interface_label, hw_node.id
                )
            })?;

        let Some(fields) = node.as_object_mut() else {
            return Err(format!("node at index {index} is not a valid map"));
        };
        fields.insert("bmcAddress".to_string(), json!(hw_node.bmc.address));
        fields.insert(
            "bmcCredentialsName".to_string(),
            json!({ "name": hw_node.bmc.credentials_name }),
        );
        fields.insert("bootMACAddress".to_string(), json!(boot_mac));
        assign_interface_macs(fields, hw_node);

        assignments.push(NodeAssignment {
            node: hw_node.clone(),
            hostname,
        });
    }

    if !unmatched.is_empty() {
        return Err(format!(
            "failed to find matches for the following nodes: {}",
            unmatched.join("; ")
        ));
    }
    Ok(assignments)
}

fn assign_interface_macs(node: &mut Map<String, Value>, hw_node: &hwplugin_client::AllocatedNode) {
    let interfaces = node
        .get_mut("nodeNetwork")
        .and_then(|n| n.get_mut("interfaces"))
        .and_then(Value::as_array_mut);
    for interface in interfaces.into_iter().flatten() {
        let label = node_str(interface, "label").to_string();
        if label.is_empty() {
            continue;
        }
        if let Some(hw_iface) = hw_node.interfaces.iter().find(|i| i.label == label) {
            if let Some(fields) = interface.as_object_mut() {
                fields.insert("macAddress".to_string(), json!(hw_iface.mac_address));
            }
        }
    }
}

fn set_hardware_condition(
    status: &mut ProvisioningRequestStatus,
    condition_status: ConditionStatus,
    reason: ConditionReason,
    message: impl Into<String>,
) {
    set_condition(
        &mut status.conditions,
        ConditionType::HardwareProvisioned,
        condition_status,
        reason,
        message,
    );
}

fn fail(status: &mut ProvisioningRequestStatus, message: String) -> Flow {
    status.phase = ProvisioningPhase::Failed;
    status.phase_details = Some(message);
    Flow::Stop(ReconcileAction::requeue(LONG_REQUEUE))
}

fn waiting(status: &mut ProvisioningRequestStatus) -> Flow {
    set_hardware_condition(
        status,
        ConditionStatus::False,
        ConditionReason::InProgress,
        "Hardware provisioning is in progress",
    );
    status.phase = ProvisioningPhase::HardwareProvisioning;
    status.phase_details = Some("Waiting for hardware allocation".to_string());
    Flow::Stop(ReconcileAction::requeue(SHORT_REQUEUE))
}

impl Reconciler {
    /// Submit or follow the allocation for a rendered cluster.
    ///
    /// Returns `Flow::Continue` once nodes are allocated, their details are
    /// applied and the ClusterInstance has been created for real.
    pub(crate) async fn hardware_stage(
        &self,
        request_name: &str,
        generation: i64,
        params: &RequestParams,
        profile: &HardwareProfile,
        rendered: &mut ClusterInstanceDoc,
        status: &mut ProvisioningRequestStatus,
    ) -> Result<Flow, ControllerError> {
        let desired = build_allocation_request(profile, &rendered.spec, params, generation)
            .map_err(ControllerError::Input)?;

        let existing = match status.node_allocation_request_ref.clone() {
            Some(nar_ref) => self
                .call(
                    "get NodeAllocationRequest",
                    self.hw_client.get_node_allocation_request(&nar_ref.node_allocation_request_id),
                )
                .await?
                .map(|response| (nar_ref, response)),
            None => None,
        };

        let Some((nar_ref, response)) = existing else {
            let id = self
                .call(
                    "create NodeAllocationRequest",
                    self.hw_client.create_node_allocation_request(&desired),
                )
                .await?;
            info!(
                "Submitted NodeAllocationRequest {} for ProvisioningRequest {}",
                id, request_name
            );
            status.node_allocation_request_ref = Some(NodeAllocationRequestRef {
                node_allocation_request_id: id,
                hardware_plugin: Some(self.hw_client.plugin_name().to_string()),
                hardware_provisioning_check_start: Some(Utc::now()),
            });
            return Ok(waiting(status));
        };
        let id = nar_ref.node_allocation_request_id.as_str();

        let provisioned = response.condition(CONDITION_PROVISIONED);
        let complete = provisioned.is_some_and(|c| c.is_true());
        let stored_groups = response.node_allocation_request.as_ref().map(|r| &r.node_group);
        if !complete && stored_groups != Some(&desired.node_group) {
            self.call(
                "update NodeAllocationRequest",
                self.hw_client.update_node_allocation_request(id, &desired),
            )
            .await?;
            info!("Updated node groups of NodeAllocationRequest {}", id);
            if let Some(r) = status.node_allocation_request_ref.as_mut() {
                r.hardware_provisioning_check_start = Some(Utc::now());
            }
            return Ok(waiting(status));
        }

        if !complete {
            if let Some(condition) = provisioned {
                let reason = match condition.reason.as_str() {
                    "Failed" => Some(ConditionReason::Failed),
                    "TimedOut" => Some(ConditionReason::TimedOut),
                    _ => None,
                };
                if let Some(reason) = reason {
                    let message = format!("Hardware provisioning failed: {}", condition.message);
                    warn!("NodeAllocationRequest {} reported {}: {}", id, reason, condition.message);
                    set_hardware_condition(status, ConditionStatus::False, reason, message.clone());
                    return Ok(fail(status, message));
                }
            }

            let started = nar_ref.hardware_provisioning_check_start.unwrap_or_else(Utc::now);
            let elapsed = Utc::now().signed_duration_since(started).to_std().unwrap_or_default();
            if elapsed > profile.timeout {
                let message = format!("Hardware provisioning timed out after {:?}", profile.timeout);
                set_hardware_condition(
                    status,
                    ConditionStatus::False,
                    ConditionReason::TimedOut,
                    message.clone(),
                );
                return Ok(fail(status, message));
            }
            debug!("NodeAllocationRequest {} still in progress", id);
            return Ok(waiting(status));
        }

        let allocated = self
            .call("get allocated nodes", self.hw_client.get_allocated_nodes(id))
            .await?;
        for node in &allocated {
            self.call(
                "copy BMC secret",
                self.store.copy_secret(
                    &self.settings.plugin_namespace,
                    &node.bmc.credentials_name,
                    &rendered.namespace,
                ),
            )
            .await?;
        }

        let assignments = match apply_node_details(&mut rendered.spec, profile, &allocated) {
            Ok(assignments) => assignments,
            Err(e) => {
                let message =
                    format!("Failed to apply node configuration to the rendered ClusterInstance: {e}");
                set_condition(
                    &mut status.conditions,
                    ConditionType::HardwareNodeConfigApplied,
                    ConditionStatus::False,
                    ConditionReason::NotApplied,
                    message.clone(),
                );
                return Ok(fail(status, message));
            }
        };
        for assignment in &assignments {
            self.mirror_allocated_node(request_name, id, assignment).await?;
        }
        set_condition(
            &mut status.conditions,
            ConditionType::HardwareNodeConfigApplied,
            ConditionStatus::True,
            ConditionReason::Completed,
            "Node configuration has been applied to the rendered ClusterInstance",
        );

        self.call(
            "apply ClusterInstance",
            self.store.apply_cluster_instance(rendered, false),
        )
        .await?;
        set_hardware_condition(
            status,
            ConditionStatus::True,
            ConditionReason::Completed,
            "Hardware provisioning is complete",
        );
        info!(
            "Hardware for ProvisioningRequest {} is allocated; ClusterInstance {}/{} applied",
            request_name, rendered.namespace, rendered.name
        );
        Ok(Flow::Continue)
    }

    async fn mirror_allocated_node(
        &self,
        request_name: &str,
        allocation_id: &str,
        assignment: &NodeAssignment,
    ) -> Result<(), ControllerError> {
        let node = &assignment.node;
        let mut mirror = crds::AllocatedNode::new(
            &node.id,
            AllocatedNodeSpec {
                node_allocation_request: allocation_id.to_string(),
                provisioning_request: request_name.to_string(),
                group_name: node.group_name.clone(),
                hw_profile: node.hw_profile.clone(),
                bmc: BmcDetails {
                    address: node.bmc.address.clone(),
                    credentials_name: node.bmc.credentials_name.clone(),
                },
                interfaces: node
                    .interfaces
                    .iter()
                    .map(|i| NodeInterface {
                        name: i.name.clone(),
                        label: i.label.clone(),
                        mac_address: i.mac_address.clone(),
                    })
                    .collect(),
            },
        );
        mirror.metadata.namespace = Some(self.settings.plugin_namespace.clone());
        mirror.status = Some(AllocatedNodeStatus {
            hostname: Some(assignment.hostname.clone()).filter(|h| !h.is_empty()),
        });
        self.call("apply AllocatedNode", self.store.apply_allocated_node(&mirror))
            .await
    }

    /// Delete the allocation and its node mirrors
    pub(crate) async fn release_hardware(
        &self,
        request_name: &str,
        status: Option<&ProvisioningRequestStatus>,
    ) -> Result<(), ControllerError> {
        if let Some(nar_ref) = status.and_then(|s| s.node_allocation_request_ref.as_ref()) {
            let id = &nar_ref.node_allocation_request_id;
            match self
                .call(
                    "delete NodeAllocationRequest",
                    self.hw_client.delete_node_allocation_request(id),
                )
                .await?
            {
                Some(_) => info!("Deleted NodeAllocationRequest {}", id),
                None => debug!("NodeAllocationRequest {} was already gone", id),
            }
        }
        self.call(
            "delete AllocatedNodes",
            self.store
                .delete_allocated_nodes(&self.settings.plugin_namespace, request_name),
        )
        .await
    }
}
