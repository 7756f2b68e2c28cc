//! ClusterTemplate reconciliation.
//!
//! A template is validated once. Every check runs and every failure is
//! reported in one condition message. After validation the referenced
//! configuration documents are frozen and the spec may no longer change; a
//! new version must be published as a new template instead.

use super::duration::duration_from_config;
use super::hardware::HardwareProfile;
use super::release::check_release_matches;
use super::schema::{check_node_schema, check_required_parameters, property_schema};
use super::{LONG_REQUEUE, MAX_STATUS_ATTEMPTS, ReconcileAction, Reconciler, parse_yaml_map};
use crate::error::ControllerError;
use crate::store::ConfigDocument;
use crds::{
    CLUSTER_CONFIGURATION_TIMEOUT_KEY, CLUSTER_INSTALLATION_TIMEOUT_KEY,
    CLUSTER_INSTANCE_DEFAULTS_KEY, CLUSTER_TEMPLATE_FINALIZER, ClusterTemplate,
    ClusterTemplateStatus, ConditionReason, ConditionStatus, ConditionType, PARAM_CLUSTER_INSTANCE,
    POLICY_TEMPLATE_DEFAULTS_KEY, set_condition,
};
use kube::ResourceExt;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default cluster installation timeout
pub const DEFAULT_INSTALLATION_TIMEOUT: Duration = Duration::from_secs(90 * 60);
/// Default cluster configuration timeout
pub const DEFAULT_CONFIGURATION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Condition message after a successful validation
pub const VALIDATION_SUCCEEDED: &str = "The cluster template validation succeeded";

/// Defaults key naming the ClusterImageSet
const IMAGE_SET_KEY: &str = "clusterImageSetNameRef";

/// Parsed configuration documents referenced by a template
#[derive(Debug, Clone)]
pub struct TemplateConfig {
    pub template_namespace: String,
    pub cluster_instance_defaults: Value,
    pub installation_timeout: Duration,
    pub policy_defaults: Value,
    pub configuration_timeout: Duration,
    pub hardware: Option<HardwareProfile>,
}

/// Record an input problem as a validation reason; propagate anything else
fn collect<T>(
    reasons: &mut Vec<String>,
    result: Result<T, ControllerError>,
) -> Result<Option<T>, ControllerError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_input() => {
            reasons.push(e.to_string());
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

impl Reconciler {
    /// Reconcile one ClusterTemplate
    pub async fn reconcile_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileAction, ControllerError> {
        let Some(template) = self
            .call("get ClusterTemplate", self.store.get_template(namespace, name))
            .await?
        else {
            debug!("ClusterTemplate {}/{} is gone, nothing to do", namespace, name);
            return Ok(ReconcileAction::await_change());
        };

        if template.metadata.deletion_timestamp.is_some() {
            return self.finalize_template(&template).await;
        }
        let template = self.ensure_template_finalizer(template).await?;

        info!("Reconciling ClusterTemplate {}/{}", namespace, name);

        let validated_generation = template.status.as_ref().and_then(|s| s.validated_generation);
        if validated_generation.is_some() {
            if template.is_validated() {
                debug!("ClusterTemplate {}/{} already validated", namespace, name);
                return Ok(ReconcileAction::await_change());
            }
            if validated_generation != template.metadata.generation {
                warn!("ClusterTemplate {}/{} was modified after validation", namespace, name);
                let message = format!(
                    "the ClusterTemplate {} is immutable once validated; publish a new version instead",
                    template.canonical_name()
                );
                self.commit_template_condition(&template, ConditionStatus::False, ConditionReason::Failed, &message, None)
                    .await?;
                return Ok(ReconcileAction::await_change());
            }
        }

        let template = match template.spec.template_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => template,
            _ => {
                let id = Uuid::new_v4().to_string();
                info!("Generated templateId {} for ClusterTemplate {}/{}", id, namespace, name);
                self.call("set ClusterTemplate templateId", self.store.set_template_id(namespace, name, &id))
                    .await?
            }
        };

        let reasons = self.validate_template(&template).await?;
        if !reasons.is_empty() {
            let message = reasons.join("; ");
            info!("ClusterTemplate {}/{} failed validation: {}", namespace, name, message);
            self.commit_template_condition(&template, ConditionStatus::False, ConditionReason::Failed, &message, None)
                .await?;
            // Referenced documents may appear later
            return Ok(ReconcileAction::requeue(LONG_REQUEUE));
        }

        for doc_name in referenced_documents(&template) {
            self.call(
                "mark ConfigMap immutable",
                self.store.mark_config_map_immutable(namespace, doc_name),
            )
            .await?;
        }
        self.commit_template_condition(
            &template,
            ConditionStatus::True,
            ConditionReason::Completed,
            VALIDATION_SUCCEEDED,
            template.metadata.generation,
        )
        .await?;
        info!("ClusterTemplate {}/{} validated", namespace, name);
        Ok(ReconcileAction::await_change())
    }

    /// Run every template check and collect the failure reasons.
    ///
    /// Only transport problems are returned as errors.
    pub async fn validate_template(
        &self,
        template: &ClusterTemplate,
    ) -> Result<Vec<String>, ControllerError> {
        let mut reasons = Vec::new();
        let namespace = template.namespace().unwrap_or_default();
        let name = template.name_any();
        let canonical = template.canonical_name();

        if name != canonical {
            reasons.push(format!(
                "failed to validate ClusterTemplate name {name}, should be in the format <spec.name>.<spec.version>: {canonical}"
            ));
        }

        if let Some(id) = template.spec.template_id.as_deref() {
            if Uuid::parse_str(id).is_err() {
                reasons.push(format!("failed to validate templateID, invalid UUID: {id}"));
            } else {
                let others = self
                    .call("list ClusterTemplates", self.store.list_templates())
                    .await?;
                if let Some(other) = others.iter().find(|other| {
                    other.namespace().as_deref() == Some(namespace.as_str())
                        && other.name_any() != name
                        && other.spec.template_id.as_deref() == Some(id)
                }) {
                    reasons.push(format!(
                        "templateID {id} is already used by ClusterTemplate {}",
                        other.name_any()
                    ));
                }
            }
        }

        let defaults = collect(&mut reasons, self.load_cluster_instance_defaults(template).await)?;
        if let Some((defaults, _)) = &defaults {
            collect(&mut reasons, self.check_release(template, defaults).await)?;
        }
        collect(&mut reasons, self.load_policy_defaults(template).await)?;

        let schema = &template.spec.template_parameter_schema;
        if template.spec.templates.hw_template.is_some() {
            collect(&mut reasons, self.load_hardware_profile(template).await)?;
        } else if let Some(cluster_instance_schema) = property_schema(schema, PARAM_CLUSTER_INSTANCE) {
            reasons.extend(check_node_schema(cluster_instance_schema));
        }

        if let Some(problem) = check_required_parameters(schema) {
            reasons.push(problem);
        }

        Ok(reasons)
    }

    /// Load and parse every document the template references
    pub(crate) async fn load_template_config(
        &self,
        template: &ClusterTemplate,
    ) -> Result<TemplateConfig, ControllerError> {
        let (cluster_instance_defaults, installation_timeout) =
            self.load_cluster_instance_defaults(template).await?;
        let (policy_defaults, configuration_timeout) = self.load_policy_defaults(template).await?;
        let hardware = self.load_hardware_profile(template).await?;
        Ok(TemplateConfig {
            template_namespace: template.namespace().unwrap_or_default(),
            cluster_instance_defaults,
            installation_timeout,
            policy_defaults,
            configuration_timeout,
            hardware,
        })
    }

    async fn fetch_document(
        &self,
        template: &ClusterTemplate,
        name: &str,
        field: &str,
    ) -> Result<ConfigDocument, ControllerError> {
        let namespace = template.namespace().unwrap_or_default();
        self.call("get ConfigMap", self.store.get_config_map(&namespace, name))
            .await?
            .ok_or_else(|| {
                ControllerError::Input(format!(
                    "the ConfigMap {name} referenced by templates.{field} was not found in namespace {namespace}"
                ))
            })
    }

    async fn load_cluster_instance_defaults(
        &self,
        template: &ClusterTemplate,
    ) -> Result<(Value, Duration), ControllerError> {
        let doc = self
            .fetch_document(
                template,
                &template.spec.templates.cluster_instance_defaults,
                "clusterInstanceDefaults",
            )
            .await?;
        parse_defaults_document(
            &doc,
            CLUSTER_INSTANCE_DEFAULTS_KEY,
            CLUSTER_INSTALLATION_TIMEOUT_KEY,
            DEFAULT_INSTALLATION_TIMEOUT,
        )
    }

    async fn load_policy_defaults(
        &self,
        template: &ClusterTemplate,
    ) -> Result<(Value, Duration), ControllerError> {
        let doc = self
            .fetch_document(
                template,
                &template.spec.templates.policy_template_defaults,
                "policyTemplateDefaults",
            )
            .await?;
        parse_defaults_document(
            &doc,
            POLICY_TEMPLATE_DEFAULTS_KEY,
            CLUSTER_CONFIGURATION_TIMEOUT_KEY,
            DEFAULT_CONFIGURATION_TIMEOUT,
        )
    }

    async fn load_hardware_profile(
        &self,
        template: &ClusterTemplate,
    ) -> Result<Option<HardwareProfile>, ControllerError> {
        let Some(hw_template) = template.spec.templates.hw_template.as_deref() else {
            return Ok(None);
        };
        let doc = self.fetch_document(template, hw_template, "hwTemplate").await?;
        HardwareProfile::from_config(&doc)
            .map(Some)
            .map_err(ControllerError::Input)
    }

    async fn check_release(
        &self,
        template: &ClusterTemplate,
        defaults: &Value,
    ) -> Result<(), ControllerError> {
        let image_set = defaults
            .get(IMAGE_SET_KEY)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ControllerError::Input(format!(
                    "{IMAGE_SET_KEY} is missing from the ConfigMap {}",
                    template.spec.templates.cluster_instance_defaults
                ))
            })?;
        let release_image = self
            .call("get ClusterImageSet", self.store.get_cluster_image_set(image_set))
            .await?
            .ok_or_else(|| {
                ControllerError::Input(format!("the ClusterImageSet {image_set} was not found"))
            })?;
        check_release_matches(image_set, &release_image, &template.spec.release)
            .map_err(ControllerError::Input)
    }

    /// Add the deletion finalizer, returning the stored template afterwards
    async fn ensure_template_finalizer(
        &self,
        template: ClusterTemplate,
    ) -> Result<ClusterTemplate, ControllerError> {
        let mut finalizers = template.finalizers().to_vec();
        if finalizers.iter().any(|f| f == CLUSTER_TEMPLATE_FINALIZER) {
            return Ok(template);
        }
        finalizers.push(CLUSTER_TEMPLATE_FINALIZER.to_string());
        let namespace = template.namespace().unwrap_or_default();
        let name = template.name_any();
        self.call(
            "add ClusterTemplate finalizer",
            self.store.set_template_finalizers(&namespace, &name, finalizers),
        )
        .await?;
        self.call("get ClusterTemplate", self.store.get_template(&namespace, &name))
            .await?
            .ok_or_else(|| {
                ControllerError::Fatal(format!("ClusterTemplate {namespace}/{name} disappeared"))
            })
    }

    /// Release the finalizer once no request references the template
    async fn finalize_template(
        &self,
        template: &ClusterTemplate,
    ) -> Result<ReconcileAction, ControllerError> {
        let namespace = template.namespace().unwrap_or_default();
        let name = template.name_any();
        if !template.finalizers().iter().any(|f| f == CLUSTER_TEMPLATE_FINALIZER) {
            return Ok(ReconcileAction::await_change());
        }

        let canonical = template.canonical_name();
        let requests = self
            .call("list ProvisioningRequests", self.store.list_requests())
            .await?;
        let users: Vec<String> = requests
            .iter()
            .filter(|r| r.spec.template_ref() == canonical)
            .map(ResourceExt::name_any)
            .collect();
        if !users.is_empty() {
            info!(
                "ClusterTemplate {}/{} is still referenced by {}; deletion blocked",
                namespace,
                name,
                users.join(", ")
            );
            return Ok(ReconcileAction::requeue(LONG_REQUEUE));
        }

        let finalizers: Vec<String> = template
            .finalizers()
            .iter()
            .filter(|f| *f != CLUSTER_TEMPLATE_FINALIZER)
            .cloned()
            .collect();
        self.call(
            "remove ClusterTemplate finalizer",
            self.store.set_template_finalizers(&namespace, &name, finalizers),
        )
        .await?;
        info!("Released ClusterTemplate {}/{}", namespace, name);
        Ok(ReconcileAction::await_change())
    }

    /// Write the validation condition with an optimistic retry.
    ///
    /// `validated_generation` is only touched when `Some`.
    async fn commit_template_condition(
        &self,
        template: &ClusterTemplate,
        status: ConditionStatus,
        reason: ConditionReason,
        message: &str,
        validated_generation: Option<i64>,
    ) -> Result<(), ControllerError> {
        let namespace = template.namespace().unwrap_or_default();
        let name = template.name_any();
        let mut current = template.clone();

        for attempt in 1..=MAX_STATUS_ATTEMPTS {
            let mut desired = current.status.clone().unwrap_or_else(ClusterTemplateStatus::default);
            let mut changed = set_condition(
                &mut desired.conditions,
                ConditionType::ClusterTemplateValidated,
                status,
                reason,
                message,
            );
            if validated_generation.is_some() && desired.validated_generation != validated_generation {
                desired.validated_generation = validated_generation;
                changed = true;
            }
            if !changed {
                return Ok(());
            }

            current.status = Some(desired);
            match self
                .call("update ClusterTemplate status", self.store.replace_template_status(&current))
                .await
            {
                Ok(_) => return Ok(()),
                Err(ControllerError::Conflict(msg)) => {
                    debug!(
                        "ClusterTemplate {}/{} status conflict (attempt {}): {}",
                        namespace, name, attempt, msg
                    );
                    current = self
                        .call("get ClusterTemplate", self.store.get_template(&namespace, &name))
                        .await?
                        .ok_or_else(|| {
                            ControllerError::Fatal(format!(
                                "ClusterTemplate {namespace}/{name} disappeared during a status update"
                            ))
                        })?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(ControllerError::Conflict(format!(
            "ClusterTemplate {namespace}/{name} status update lost {MAX_STATUS_ATTEMPTS} races"
        )))
    }
}

/// Names of the configuration documents a template references
fn referenced_documents(template: &ClusterTemplate) -> Vec<&str> {
    let templates = &template.spec.templates;
    let mut names = vec![
        templates.cluster_instance_defaults.as_str(),
        templates.policy_template_defaults.as_str(),
    ];
    names.extend(templates.hw_template.as_deref());
    names
}

/// Parse a defaults document and its optional timeout, reporting both problems
fn parse_defaults_document(
    doc: &ConfigDocument,
    payload_key: &str,
    timeout_key: &str,
    default_timeout: Duration,
) -> Result<(Value, Duration), ControllerError> {
    let payload = parse_yaml_map(doc, payload_key);
    let timeout = duration_from_config(&doc.data, timeout_key, &doc.name, default_timeout);
    match (payload, timeout) {
        (Ok(payload), Ok(timeout)) => Ok((payload, timeout)),
        (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(ControllerError::Input(e)),
        (Err(a), Err(b)) => Err(ControllerError::Input(format!("{a}; {b}"))),
    }
}
