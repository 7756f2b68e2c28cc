//! Per-cluster resources created next to the ClusterInstance.
//!
//! The policy ConfigMap feeds the templated governance policies; BMC secrets
//! carry the credentials of nodes that are not backed by a hardware plugin.

use super::Reconciler;
use super::merge::merge_documents;
use super::render::RequestParams;
use super::template::TemplateConfig;
use crate::error::ControllerError;
use crate::store::{ClusterInstanceDoc, ConfigDocument};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// ManagedCluster label the policies are selected by
pub const CLUSTER_VERSION_LABEL: &str = "cluster-version";

/// Namespace of the templated policies of a template namespace
#[must_use]
pub fn policy_namespace(template_namespace: &str) -> String {
    format!("ztp-{template_namespace}")
}

/// Name of the policy ConfigMap of a cluster
#[must_use]
pub fn policy_config_map_name(cluster_name: &str) -> String {
    format!("{cluster_name}-pg")
}

/// Merge the request's policy values onto the template defaults.
///
/// Every resulting value must be a string. An empty result means there is
/// nothing to publish.
pub fn policy_config_data(
    defaults: &Value,
    policy: &Value,
) -> Result<BTreeMap<String, String>, String> {
    let merged = merge_documents(defaults, policy, false)?;
    let Value::Object(fields) = merged else {
        return Ok(BTreeMap::new());
    };
    fields
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(data) => Ok((key, data)),
            other => Err(format!(
                "policyTemplateParameters/policyTemplateSchema for the {key} key ({other}) is not a string"
            )),
        })
        .collect()
}

/// The ManagedCluster labels of a rendered ClusterInstance must carry the
/// cluster version for policies to select it
pub fn check_cluster_labels(cluster_name: &str, rendered: &Value) -> Result<(), String> {
    let labels = rendered
        .pointer("/extraLabels/ManagedCluster")
        .and_then(Value::as_object)
        .filter(|labels| !labels.is_empty())
        .ok_or_else(|| {
            format!(
                "No cluster labels configured by the ClusterInstance {cluster_name}. \
                 Labels are needed for cluster configuration"
            )
        })?;
    if !labels.contains_key(CLUSTER_VERSION_LABEL) {
        return Err(format!(
            "Managed cluster {cluster_name} is missing the {CLUSTER_VERSION_LABEL} label. \
             This label is needed for correctly generating and populating configuration data"
        ));
    }
    Ok(())
}

/// Credentials of one node, decoded from `bmcCredentialsDetails`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BmcSecret {
    pub name: String,
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

impl BmcSecret {
    fn data(&self) -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([
            ("username".to_string(), self.username.clone()),
            ("password".to_string(), self.password.clone()),
        ])
    }
}

fn decode_credential(details: &Value, field: &str, request: &str) -> Result<Vec<u8>, String> {
    let encoded = details.get(field).and_then(Value::as_str).ok_or_else(|| {
        format!(
            "\"bmcCredentialsDetails.{field}\" key expected to exist in \
             spec.templateParameters.clusterInstanceParameters of ProvisioningRequest {request}, but it's missing"
        )
    })?;
    STANDARD
        .decode(encoded)
        .map_err(|e| format!("failed to decode the base64 bmcCredentialsDetails.{field}: {e}"))
}

/// Secret name from `bmcCredentialsName`, else derived from the host name
fn bmc_secret_name(node: &Value, request: &str) -> Result<String, String> {
    if let Some(name) = node.pointer("/bmcCredentialsName/name").and_then(Value::as_str) {
        return Ok(name.to_string());
    }
    let hostname = node.get("hostName").and_then(Value::as_str).ok_or_else(|| {
        format!(
            "\"hostName\" key expected to exist in spec.templateParameters.clusterInstanceParameters \
             of ProvisioningRequest {request}, but it's missing"
        )
    })?;
    let short = hostname.split('.').next().unwrap_or(hostname).to_lowercase();
    Ok(format!("{short}-bmc-secret"))
}

/// Decode the BMC credentials of every node in `clusterInstanceParameters`
pub fn bmc_secrets(cluster_instance: &Value, request: &str) -> Result<Vec<BmcSecret>, String> {
    let nodes = cluster_instance
        .get("nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            format!(
                "\"nodes\" key expected to exist in spec.templateParameters.clusterInstanceParameters \
                 of ProvisioningRequest {request}, but it is missing"
            )
        })?;
    nodes
        .iter()
        .map(|node| {
            let details = node.get("bmcCredentialsDetails").ok_or_else(|| {
                format!(
                    "\"bmcCredentialsDetails\" key expected to exist in \
                     spec.templateParameters.clusterInstanceParameters of ProvisioningRequest {request}, but it's missing"
                )
            })?;
            Ok(BmcSecret {
                name: bmc_secret_name(node, request)?,
                username: decode_credential(details, "username", request)?,
                password: decode_credential(details, "password", request)?,
            })
        })
        .collect()
}

impl Reconciler {
    /// Publish the merged policy values for the cluster's policies
    pub(crate) async fn policy_config_stage(
        &self,
        params: &RequestParams,
        config: &TemplateConfig,
        rendered: &Value,
    ) -> Result<(), ControllerError> {
        check_cluster_labels(&params.cluster_name, rendered).map_err(ControllerError::Input)?;
        let data = policy_config_data(&config.policy_defaults, &params.policy)
            .map_err(ControllerError::Input)?;
        if data.is_empty() {
            debug!("No policy configuration for cluster {}", params.cluster_name);
            return Ok(());
        }
        let doc = ConfigDocument {
            name: policy_config_map_name(&params.cluster_name),
            namespace: policy_namespace(&config.template_namespace),
            data,
            immutable: false,
        };
        self.call("apply policy ConfigMap", self.store.apply_config_map(&doc))
            .await?;
        debug!("Applied policy ConfigMap {}/{}", doc.namespace, doc.name);
        Ok(())
    }

    /// Create the BMC secrets of a cluster without plugin-managed hardware
    /// and point each rendered node at its secret
    pub(crate) async fn bmc_secret_stage(
        &self,
        request: &str,
        params: &RequestParams,
        doc: &mut ClusterInstanceDoc,
    ) -> Result<(), ControllerError> {
        let secrets =
            bmc_secrets(&params.cluster_instance, request).map_err(ControllerError::Input)?;
        for secret in &secrets {
            self.call(
                "apply BMC secret",
                self.store
                    .apply_secret(&doc.namespace, &secret.name, secret.data()),
            )
            .await?;
        }
        if let Some(nodes) = doc.spec.get_mut("nodes").and_then(Value::as_array_mut) {
            for (node, secret) in nodes.iter_mut().zip(&secrets) {
                if let Some(fields) = node.as_object_mut() {
                    fields
                        .entry("bmcCredentialsName")
                        .or_insert_with(|| json!({ "name": secret.name }));
                }
            }
        }
        info!(
            "Created {} BMC secret(s) in namespace {}",
            secrets.len(),
            doc.namespace
        );
        Ok(())
    }
}
