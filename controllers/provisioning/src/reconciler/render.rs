//! Parameter Renderer.
//!
//! Deep-merges a request's `clusterInstanceParameters` onto the template's
//! ClusterInstance defaults and checks the result with a dry-run apply.

use super::Reconciler;
use super::merge::merge_documents;
use super::template::TemplateConfig;
use crate::error::ControllerError;
use crate::store::ClusterInstanceDoc;
use crds::{
    ClusterDetails, ConditionReason, ConditionStatus, ConditionType, PARAM_CLUSTER_INSTANCE,
    PARAM_NODE_CLUSTER_NAME, PARAM_OCLOUD_SITE_ID, PARAM_POLICY_CONFIG, ProvisioningRequestStatus,
    set_condition,
};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

/// ManagedCluster label carrying the site the cluster belongs to
pub const SITE_ID_LABEL: &str = "clcm.microscaler.io/site-id";

/// Metadata sections whose template defaults win over request values
const EXTRA_METADATA_KEYS: [&str; 2] = ["extraLabels", "extraAnnotations"];

/// The four top-level request parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RequestParams {
    pub cluster_name: String,
    pub site_id: String,
    pub cluster_instance: Value,
    pub policy: Value,
}

impl RequestParams {
    /// Extract the parameters from a request's `templateParameters`
    pub fn from_document(params: &Value) -> Result<Self, String> {
        let string = |key: &str| {
            params
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| format!("templateParameters.{key} must be a non-empty string"))
        };
        let object = |key: &str| match params.get(key) {
            Some(value @ Value::Object(_)) => Ok(value.clone()),
            Some(_) => Err(format!("templateParameters.{key} must be a map")),
            None => Ok(Value::Object(Map::new())),
        };
        Ok(Self {
            cluster_name: string(PARAM_NODE_CLUSTER_NAME)?,
            site_id: string(PARAM_OCLOUD_SITE_ID)?,
            cluster_instance: object(PARAM_CLUSTER_INSTANCE)?,
            policy: object(PARAM_POLICY_CONFIG)?,
        })
    }
}

/// Render the ClusterInstance spec for a request
pub fn render_cluster_instance(defaults: &Value, params: &RequestParams) -> Result<Value, String> {
    let mut input = params.cluster_instance.clone();
    override_extra_metadata(defaults, &mut input)?;

    let mut rendered = merge_documents(defaults, &input, true)
        .map_err(|e| format!("failed to merge the ClusterInstance parameters into the defaults: {e}"))?;
    let Some(spec) = rendered.as_object_mut() else {
        return Err("the rendered ClusterInstance is not a map".to_string());
    };
    spec.insert("clusterName".to_string(), json!(params.cluster_name));

    let labels = spec
        .entry("extraLabels")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| "extraLabels in the rendered ClusterInstance is not a map".to_string())?;
    let managed_cluster = labels
        .entry("ManagedCluster")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| "extraLabels.ManagedCluster is not a map".to_string())?;
    managed_cluster.insert(SITE_ID_LABEL.to_string(), json!(params.site_id));
    Ok(rendered)
}

/// Let the defaults' extra labels and annotations override the request's
/// values for keys both sides set, at the top level and per node.
fn override_extra_metadata(defaults: &Value, input: &mut Value) -> Result<(), String> {
    for key in EXTRA_METADATA_KEYS {
        override_metadata_section(defaults.get(key), input.get_mut(key), key)?;
    }

    let default_nodes = defaults.get("nodes").and_then(Value::as_array);
    let input_nodes = input.get_mut("nodes").and_then(Value::as_array_mut);
    if let (Some(default_nodes), Some(input_nodes)) = (default_nodes, input_nodes) {
        for (index, (default_node, input_node)) in
            default_nodes.iter().zip(input_nodes.iter_mut()).enumerate()
        {
            for key in EXTRA_METADATA_KEYS {
                override_metadata_section(
                    default_node.get(key),
                    input_node.get_mut(key),
                    &format!("nodes[{index}].{key}"),
                )?;
            }
        }
    }
    Ok(())
}

fn override_metadata_section(
    defaults: Option<&Value>,
    input: Option<&mut Value>,
    field: &str,
) -> Result<(), String> {
    let (Some(defaults), Some(input)) = (defaults, input) else {
        return Ok(());
    };
    let mismatch = || format!("type mismatch for field {field}: expected a map of resource kinds");
    let defaults = defaults.as_object().ok_or_else(mismatch)?;
    let input = input.as_object_mut().ok_or_else(mismatch)?;

    for (kind, default_values) in defaults {
        let Some(input_values) = input.get_mut(kind) else {
            continue;
        };
        let mismatch = || format!("type mismatch for field {field}.{kind}: expected a map");
        let default_values = default_values.as_object().ok_or_else(mismatch)?;
        let input_values = input_values.as_object_mut().ok_or_else(mismatch)?;
        for (key, value) in default_values {
            if let Some(existing) = input_values.get_mut(key) {
                existing.clone_from(value);
            }
        }
    }
    Ok(())
}

/// Copy extra labels and annotations from `rendered` onto `existing`.
///
/// Returns true when anything changed.
pub fn sync_extra_metadata(rendered: &Value, existing: &mut Value) -> bool {
    let mut changed = false;
    let mut copy = |from: &Value, to: &mut Value| {
        let Some(to) = to.as_object_mut() else {
            return;
        };
        for key in EXTRA_METADATA_KEYS {
            if let Some(value) = from.get(key) {
                if to.get(key) != Some(value) {
                    to.insert(key.to_string(), value.clone());
                    changed = true;
                }
            }
        }
    };

    copy(rendered, existing);
    let rendered_nodes = rendered.get("nodes").and_then(Value::as_array);
    let existing_nodes = existing.get_mut("nodes").and_then(Value::as_array_mut);
    if let (Some(rendered_nodes), Some(existing_nodes)) = (rendered_nodes, existing_nodes) {
        for (from, to) in rendered_nodes.iter().zip(existing_nodes.iter_mut()) {
            copy(from, to);
        }
    }
    changed
}

fn set_rendered_condition(
    status: &mut ProvisioningRequestStatus,
    condition_status: ConditionStatus,
    reason: ConditionReason,
    message: impl Into<String>,
) {
    set_condition(
        &mut status.conditions,
        ConditionType::ClusterInstanceRendered,
        condition_status,
        reason,
        message,
    );
}

impl Reconciler {
    /// Render the ClusterInstance and validate it with a dry-run apply.
    ///
    /// Input problems are recorded on `ClusterInstanceRendered` before the
    /// error is returned.
    pub(crate) async fn render_stage(
        &self,
        params: &RequestParams,
        config: &TemplateConfig,
        status: &mut ProvisioningRequestStatus,
    ) -> Result<ClusterInstanceDoc, ControllerError> {
        let result = self.render_and_check(params, config).await;
        match &result {
            Ok(doc) => {
                set_rendered_condition(
                    status,
                    ConditionStatus::True,
                    ConditionReason::Completed,
                    "ClusterInstance rendered and passed dry-run validation",
                );
                let details = status.cluster_details.get_or_insert_with(ClusterDetails::default);
                details.name.clone_from(&doc.name);
                debug!("Rendered ClusterInstance {}/{}", doc.namespace, doc.name);
            }
            Err(e) if e.is_input() => {
                set_rendered_condition(
                    status,
                    ConditionStatus::False,
                    ConditionReason::Failed,
                    format!("Failed to render and validate ClusterInstance: {e}"),
                );
            }
            Err(_) => {}
        }
        result
    }

    async fn render_and_check(
        &self,
        params: &RequestParams,
        config: &TemplateConfig,
    ) -> Result<ClusterInstanceDoc, ControllerError> {
        let spec = render_cluster_instance(&config.cluster_instance_defaults, params)
            .map_err(ControllerError::Input)?;
        let doc = ClusterInstanceDoc {
            namespace: params.cluster_name.clone(),
            name: params.cluster_name.clone(),
            spec,
        };
        self.call("ensure namespace", self.store.ensure_namespace(&doc.namespace))
            .await?;
        self.call(
            "dry-run ClusterInstance",
            self.store.apply_cluster_instance(&doc, true),
        )
        .await?;
        Ok(doc)
    }

    /// Re-sync only the extra labels and annotations of an already applied
    /// ClusterInstance. A render failure here is logged and ignored.
    ///
    /// Returns the freshly rendered spec when rendering succeeded.
    pub(crate) async fn sync_rendered_metadata(
        &self,
        params: &RequestParams,
        config: &TemplateConfig,
    ) -> Result<Option<Value>, ControllerError> {
        let rendered = match render_cluster_instance(&config.cluster_instance_defaults, params) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(
                    "Skipping label sync for ClusterInstance {}: {}",
                    params.cluster_name, e
                );
                return Ok(None);
            }
        };
        let existing = self
            .call(
                "get ClusterInstance",
                self.store
                    .get_cluster_instance(&params.cluster_name, &params.cluster_name),
            )
            .await?;
        let Some(mut record) = existing else {
            return Ok(Some(rendered));
        };
        if sync_extra_metadata(&rendered, &mut record.doc.spec) {
            self.call(
                "apply ClusterInstance",
                self.store.apply_cluster_instance(&record.doc, false),
            )
            .await?;
            info!(
                "Updated labels and annotations of ClusterInstance {}/{}",
                record.doc.namespace, record.doc.name
            );
        }
        Ok(Some(rendered))
    }
}
