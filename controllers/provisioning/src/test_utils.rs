//! Test utilities for unit testing reconcilers
//!
//! This module provides helpers for creating test data and setting up test scenarios.

#[cfg(test)]
use crate::reconciler::{Reconciler, ReconcilerSettings};
#[cfg(test)]
use crate::store::memory::{InMemoryStore, config_map};
#[cfg(test)]
use crate::store::ConfigDocument;
#[cfg(test)]
use crds::*;
#[cfg(test)]
use hwplugin_client::{Bmc, Interface, MockHardwarePluginClient};
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
#[cfg(test)]
use serde_json::{Value, json};
#[cfg(test)]
use std::sync::Arc;

/// Name of the ClusterInstance defaults ConfigMap used by test templates
#[cfg(test)]
pub const DEFAULTS_CONFIG_MAP: &str = "sno-defaults";
/// Name of the policy defaults ConfigMap used by test templates
#[cfg(test)]
pub const POLICY_CONFIG_MAP: &str = "sno-policy-defaults";
/// Name of the hardware profile ConfigMap used by test templates
#[cfg(test)]
pub const HW_PROFILE_CONFIG_MAP: &str = "sno-hw-profile";
/// ClusterImageSet referenced by the defaults
#[cfg(test)]
pub const IMAGE_SET: &str = "img-4.16.3";
/// Release image of [`IMAGE_SET`]
#[cfg(test)]
pub const RELEASE_IMAGE: &str = "quay.io/openshift-release-dev/ocp-release:4.16.3-x86_64";
/// Release every test template declares
#[cfg(test)]
pub const RELEASE: &str = "4.16.3";
/// Label of the boot interface
#[cfg(test)]
pub const BOOT_LABEL: &str = "bootable-interface";

/// Parameter schema accepted by test templates.
///
/// Node BMC credentials and MAC addresses are only mandatory when no
/// hardware profile supplies them.
#[cfg(test)]
pub fn create_test_parameter_schema(hardware: bool) -> Value {
    let (node_required, interface_required) = if hardware {
        (json!(["hostName"]), json!(["name", "label"]))
    } else {
        (
            json!(["hostName", "bmcCredentialsDetails", "nodeNetwork"]),
            json!(["name", "label", "macAddress"]),
        )
    };
    json!({
        "type": "object",
        "required": [
            "nodeClusterName",
            "oCloudSiteId",
            "clusterInstanceParameters",
            "policyTemplateParameters"
        ],
        "properties": {
            "nodeClusterName": {"type": "string"},
            "oCloudSiteId": {"type": "string"},
            "policyTemplateParameters": {
                "type": "object",
                "properties": {
                    "sriov-network-vlan-1": {"type": "string"},
                    "cpu-isolated": {"type": "string"}
                }
            },
            "clusterInstanceParameters": {
                "type": "object",
                "properties": {
                    "baseDomain": {"type": "string"},
                    "extraLabels": {"type": "object"},
                    "extraAnnotations": {"type": "object"},
                    "nodes": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "required": node_required,
                            "properties": {
                                "hostName": {"type": "string"},
                                "extraLabels": {"type": "object"},
                                "extraAnnotations": {"type": "object"},
                                "bmcCredentialsDetails": {
                                    "type": "object",
                                    "required": ["username", "password"],
                                    "properties": {
                                        "username": {"type": "string"},
                                        "password": {"type": "string"}
                                    }
                                },
                                "nodeNetwork": {
                                    "type": "object",
                                    "properties": {
                                        "interfaces": {
                                            "type": "array",
                                            "items": {
                                                "type": "object",
                                                "required": interface_required,
                                                "properties": {
                                                    "name": {"type": "string"},
                                                    "label": {"type": "string", "minLength": 1},
                                                    "macAddress": {
                                                        "type": "string",
                                                        "pattern": "^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$"
                                                    }
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}

/// Helper to create test ClusterTemplate CRD named `<name>.<version>`
#[cfg(test)]
pub fn create_test_template(namespace: &str, name: &str, version: &str) -> ClusterTemplate {
    ClusterTemplate {
        metadata: ObjectMeta {
            name: Some(canonical_template_name(name, version)),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: ClusterTemplateSpec {
            name: name.to_string(),
            version: version.to_string(),
            release: RELEASE.to_string(),
            description: Some("Single node cluster".to_string()),
            template_id: None,
            templates: Templates {
                cluster_instance_defaults: DEFAULTS_CONFIG_MAP.to_string(),
                policy_template_defaults: POLICY_CONFIG_MAP.to_string(),
                hw_template: None,
            },
            template_parameter_schema: create_test_parameter_schema(false),
        },
        status: None,
    }
}

/// Helper to create a test ClusterTemplate that allocates hardware
#[cfg(test)]
pub fn create_test_hw_template(namespace: &str, name: &str, version: &str) -> ClusterTemplate {
    let mut template = create_test_template(namespace, name, version);
    template.spec.templates.hw_template = Some(HW_PROFILE_CONFIG_MAP.to_string());
    template.spec.template_parameter_schema = create_test_parameter_schema(true);
    template
}

/// Request parameters for a one-node cluster
#[cfg(test)]
pub fn create_test_parameters(cluster_name: &str) -> Value {
    json!({
        "nodeClusterName": cluster_name,
        "oCloudSiteId": "site-1",
        "policyTemplateParameters": {
            "sriov-network-vlan-1": "140"
        },
        "clusterInstanceParameters": {
            "baseDomain": "example.com",
            "extraLabels": {"ManagedCluster": {"env": "lab"}},
            "nodes": [{
                "hostName": format!("node1.{cluster_name}.example.com"),
                "bmcCredentialsDetails": {"username": "YWRtaW4=", "password": "c2VjcmV0"},
                "nodeNetwork": {
                    "interfaces": [{
                        "name": "eno1",
                        "label": BOOT_LABEL,
                        "macAddress": "00:00:00:01:20:30"
                    }]
                }
            }]
        }
    })
}

/// Helper to create test ProvisioningRequest CRD
#[cfg(test)]
pub fn create_test_request(
    namespace: &str,
    name: &str,
    template_name: &str,
    template_version: &str,
    cluster_name: &str,
) -> ProvisioningRequest {
    ProvisioningRequest {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: ProvisioningRequestSpec {
            name: Some(format!("{cluster_name} request")),
            description: None,
            template_name: template_name.to_string(),
            template_version: template_version.to_string(),
            template_parameters: create_test_parameters(cluster_name),
        },
        status: None,
    }
}

/// ClusterInstance defaults document
#[cfg(test)]
pub fn create_test_defaults_config(namespace: &str) -> ConfigDocument {
    config_map(
        namespace,
        DEFAULTS_CONFIG_MAP,
        &[(
            CLUSTER_INSTANCE_DEFAULTS_KEY,
            r"clusterImageSetNameRef: img-4.16.3
pullSecretRef:
  name: pull-secret
extraLabels:
  ManagedCluster:
    cluster-version: v4.16
nodes:
- role: master
  bootMode: UEFI
  nodeNetwork:
    interfaces:
    - name: eno1
      label: bootable-interface
",
        )],
    )
}

/// Policy defaults document
#[cfg(test)]
pub fn create_test_policy_config(namespace: &str) -> ConfigDocument {
    config_map(
        namespace,
        POLICY_CONFIG_MAP,
        &[
            (
                POLICY_TEMPLATE_DEFAULTS_KEY,
                "sriov-network-vlan-1: \"114\"\ncpu-isolated: \"2-31\"\n",
            ),
            (CLUSTER_CONFIGURATION_TIMEOUT_KEY, "30m"),
        ],
    )
}

/// Hardware profile document mapping the master role to one node group
#[cfg(test)]
pub fn create_test_hw_profile_config(namespace: &str) -> ConfigDocument {
    config_map(
        namespace,
        HW_PROFILE_CONFIG_MAP,
        &[
            (HW_MGR_ID_KEY, "mock"),
            (BOOT_INTERFACE_LABEL_KEY, BOOT_LABEL),
            (
                NODE_GROUP_DATA_KEY,
                r"- name: controller
  role: master
  hwProfile: profile-spr-single-processor-64G
  resourcePoolId: pool-1
",
            ),
            (HARDWARE_PROVISIONING_TIMEOUT_KEY, "60m"),
        ],
    )
}

/// Put every document a test template references into the store
#[cfg(test)]
pub fn seed_template_documents(store: &InMemoryStore, namespace: &str) {
    for doc in [
        create_test_defaults_config(namespace),
        create_test_policy_config(namespace),
        create_test_hw_profile_config(namespace),
    ] {
        store.put_config_map(doc).unwrap();
    }
    store.put_image_set(IMAGE_SET, RELEASE_IMAGE);
}

/// Helper to create a node as handed out by the hardware plugin
#[cfg(test)]
pub fn create_test_allocated_node(
    id: &str,
    group_name: &str,
    credentials_name: &str,
) -> hwplugin_client::AllocatedNode {
    hwplugin_client::AllocatedNode {
        id: id.to_string(),
        group_name: group_name.to_string(),
        hw_profile: "profile-spr-single-processor-64G".to_string(),
        config_transaction_id: 1,
        bmc: Bmc {
            address: format!("idrac-virtualmedia+https://203.0.113.5/redfish/v1/Systems/{id}"),
            credentials_name: credentials_name.to_string(),
        },
        interfaces: vec![
            Interface {
                name: "eno1".to_string(),
                label: BOOT_LABEL.to_string(),
                mac_address: "aa:bb:cc:dd:ee:01".to_string(),
            },
            Interface {
                name: "eno2".to_string(),
                label: "data-interface".to_string(),
                mac_address: "aa:bb:cc:dd:ee:02".to_string(),
            },
        ],
        status: None,
    }
}

/// Helper to create a reconciler over an in-memory store and a mock plugin
#[cfg(test)]
pub fn create_test_reconciler(
    store: Arc<InMemoryStore>,
    hw_client: Arc<MockHardwarePluginClient>,
) -> Reconciler {
    Reconciler::new(store, hw_client, ReconcilerSettings::default())
}
