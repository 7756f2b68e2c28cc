//! ProvisioningRequest state machine.
//!
//! Each pass walks the request through validation, rendering, hardware,
//! installation and compliance, then commits the resulting status once.

use super::render::RequestParams;
use super::schema::{disallow_unknown_fields, validate_document};
use super::template::TemplateConfig;
use super::merge::merge_documents;
use super::{
    Flow, LONG_REQUEUE, MAX_STATUS_ATTEMPTS, MEDIUM_REQUEUE, ReconcileAction, Reconciler,
};
use crate::error::{ControllerError, ErrorClass};
use chrono::Utc;
use crds::{
    ClusterDetails, ClusterTemplate, ConditionReason, ConditionStatus, ConditionType,
    PARAM_CLUSTER_INSTANCE, PARAM_NODE_CLUSTER_NAME, PARAM_POLICY_CONFIG,
    PROVISIONING_REQUEST_FINALIZER, ProvisioningPhase, ProvisioningRequest,
    ProvisioningRequestStatus, is_condition_true, set_condition,
};
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Installer condition the ClusterInstance reports
const INSTANCE_PROVISIONED: &str = "Provisioned";

fn set_phase(status: &mut ProvisioningRequestStatus, phase: ProvisioningPhase, details: impl Into<String>) {
    status.phase = phase;
    status.phase_details = Some(details.into());
}

/// Validate request parameters against a template's parameter schema.
///
/// `clusterInstanceParameters` is checked strictly (unknown fields are
/// rejected); `policyTemplateParameters` is checked after merging it onto
/// the template's policy defaults.
pub fn validate_template_parameters(
    schema: &Value,
    params: &Value,
    policy_defaults: &Value,
) -> Result<(), String> {
    let mut schema = schema.clone();
    if let Some(cluster_schema) = schema
        .get_mut("properties")
        .and_then(|p| p.get_mut(PARAM_CLUSTER_INSTANCE))
    {
        disallow_unknown_fields(cluster_schema);
    }

    let mut document = params.clone();
    if let Some(fields) = document.as_object_mut() {
        if let Some(policy) = fields.get(PARAM_POLICY_CONFIG) {
            let merged = merge_documents(policy_defaults, policy, false)?;
            fields.insert(PARAM_POLICY_CONFIG.to_string(), merged);
        }
    }

    validate_document(&schema, &document)
        .map_err(|e| format!("failed to validate the ProvisioningRequest parameters: {e}"))
}

impl Reconciler {
    /// Reconcile one ProvisioningRequest
    pub async fn reconcile_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileAction, ControllerError> {
        info!("Reconciling ProvisioningRequest {}/{}", namespace, name);

        let Some(request) = self
            .call("get ProvisioningRequest", self.store.get_request(namespace, name))
            .await?
        else {
            debug!("ProvisioningRequest {}/{} no longer exists", namespace, name);
            return Ok(ReconcileAction::await_change());
        };

        if request.metadata.deletion_timestamp.is_some() {
            return self.finalize_request(&request).await;
        }
        let request = self.ensure_request_finalizer(request).await?;

        let original = request.status.clone().unwrap_or_default();
        let mut status = original.clone();
        if matches!(status.phase, ProvisioningPhase::Pending | ProvisioningPhase::Failed) {
            set_phase(&mut status, ProvisioningPhase::Validating, "Validating the request");
        }

        let outcome = self.run_pipeline(&request, &mut status).await;
        status.observed_generation = request.metadata.generation;

        let result = match outcome {
            Ok(action) => Ok(action),
            Err(e) => match e.class() {
                ErrorClass::Input => {
                    warn!("ProvisioningRequest {}/{} failed: {}", namespace, name, e);
                    set_phase(&mut status, ProvisioningPhase::Failed, e.to_string());
                    Ok(ReconcileAction::requeue(LONG_REQUEUE))
                }
                ErrorClass::Fatal => {
                    set_phase(&mut status, ProvisioningPhase::Failed, e.to_string());
                    Err(e)
                }
                ErrorClass::Transient | ErrorClass::Conflict => {
                    status.phase = original.phase.clone();
                    status.phase_details.clone_from(&original.phase_details);
                    Err(e)
                }
            },
        };

        if status.phase != original.phase {
            info!(
                "ProvisioningRequest {}/{} phase {} -> {}",
                namespace, name, original.phase, status.phase
            );
        }
        self.commit_request_status(&request, status).await?;
        result
    }

    async fn run_pipeline(
        &self,
        request: &ProvisioningRequest,
        status: &mut ProvisioningRequestStatus,
    ) -> Result<ReconcileAction, ControllerError> {
        let previously_validated = is_condition_true(&status.conditions, ConditionType::Validated);
        let (config, params) = match self.validate_request(request, previously_validated).await {
            Ok(validated) => validated,
            Err(e) => {
                if matches!(e.class(), ErrorClass::Input | ErrorClass::Fatal) {
                    set_condition(
                        &mut status.conditions,
                        ConditionType::Validated,
                        ConditionStatus::False,
                        ConditionReason::Failed,
                        format!("Failed to validate the ProvisioningRequest: {e}"),
                    );
                }
                return Err(e);
            }
        };
        set_condition(
            &mut status.conditions,
            ConditionType::Validated,
            ConditionStatus::True,
            ConditionReason::Completed,
            "The provisioning request validation succeeded",
        );
        if status.phase == ProvisioningPhase::Validating {
            set_phase(status, ProvisioningPhase::Rendering, "Rendering the ClusterInstance");
        }

        let hardware_done = is_condition_true(&status.conditions, ConditionType::HardwareProvisioned);
        let install_started = config.hardware.is_none()
            && status
                .cluster_details
                .as_ref()
                .is_some_and(|d| d.cluster_provision_started_at.is_some());

        if hardware_done || install_started {
            if let Some(rendered) = self.sync_rendered_metadata(&params, &config).await? {
                self.policy_config_stage(&params, &config, &rendered).await?;
            }
        } else {
            let mut doc = self.render_stage(&params, &config, status).await?;
            self.policy_config_stage(&params, &config, &doc.spec).await?;
            match &config.hardware {
                Some(profile) => {
                    let generation = request.metadata.generation.unwrap_or_default();
                    let flow = self
                        .hardware_stage(
                            &request.name_any(),
                            generation,
                            &params,
                            profile,
                            &mut doc,
                            status,
                        )
                        .await?;
                    if let Flow::Stop(action) = flow {
                        return Ok(action);
                    }
                }
                None => {
                    self.bmc_secret_stage(&request.name_any(), &params, &mut doc)
                        .await?;
                    self.call(
                        "apply ClusterInstance",
                        self.store.apply_cluster_instance(&doc, false),
                    )
                    .await?;
                    info!("Applied ClusterInstance {}/{}", doc.namespace, doc.name);
                }
            }
            let details = status.cluster_details.get_or_insert_with(ClusterDetails::default);
            details.cluster_provision_started_at = Some(Utc::now());
            set_phase(status, ProvisioningPhase::Installing, "Cluster installation is in progress");
        }

        if let Flow::Stop(action) = self.install_stage(&params, &config, status).await? {
            return Ok(action);
        }
        self.compliance_stage(&params.cluster_name, config.configuration_timeout, status)
            .await
    }

    async fn validate_request(
        &self,
        request: &ProvisioningRequest,
        previously_validated: bool,
    ) -> Result<(TemplateConfig, RequestParams), ControllerError> {
        let template = self.resolve_template(request, previously_validated).await?;
        if !template.is_validated() {
            return Err(ControllerError::Input(format!(
                "the ClusterTemplate {} is not validated",
                template.canonical_name()
            )));
        }
        let config = self.load_template_config(&template).await?;
        validate_template_parameters(
            &template.spec.template_parameter_schema,
            &request.spec.template_parameters,
            &config.policy_defaults,
        )
        .map_err(ControllerError::Input)?;
        let params = RequestParams::from_document(&request.spec.template_parameters)
            .map_err(ControllerError::Input)?;
        Ok((config, params))
    }

    /// Find the referenced template, preferring the request's own namespace.
    ///
    /// A template that vanishes after the request was validated against it is
    /// fatal; one that never resolved is an input error.
    async fn resolve_template(
        &self,
        request: &ProvisioningRequest,
        previously_validated: bool,
    ) -> Result<ClusterTemplate, ControllerError> {
        let canonical = request.spec.template_ref();
        let namespace = request.namespace().unwrap_or_default();
        if let Some(template) = self
            .call("get ClusterTemplate", self.store.get_template(&namespace, &canonical))
            .await?
        {
            return Ok(template);
        }

        let mut matches: Vec<ClusterTemplate> = self
            .call("list ClusterTemplates", self.store.list_templates())
            .await?
            .into_iter()
            .filter(|t| t.name_any() == canonical)
            .collect();
        match matches.len() {
            0 if previously_validated => Err(ControllerError::Fatal(format!(
                "the ClusterTemplate {canonical} disappeared after the request was validated"
            ))),
            0 => Err(ControllerError::Input(format!(
                "the ClusterTemplate {canonical} was not found"
            ))),
            1 => Ok(matches.remove(0)),
            _ => {
                let mut namespaces: Vec<String> =
                    matches.iter().filter_map(ResourceExt::namespace).collect();
                namespaces.sort();
                Err(ControllerError::Input(format!(
                    "the ClusterTemplate {canonical} is ambiguous; it exists in namespaces {}",
                    namespaces.join(", ")
                )))
            }
        }
    }

    /// Track the installer's `Provisioned` condition
    async fn install_stage(
        &self,
        params: &RequestParams,
        config: &TemplateConfig,
        status: &mut ProvisioningRequestStatus,
    ) -> Result<Flow, ControllerError> {
        if is_condition_true(&status.conditions, ConditionType::ClusterProvisioned) {
            if status.phase != ProvisioningPhase::Monitoring {
                set_phase(status, ProvisioningPhase::Monitoring, "Cluster is provisioned");
            }
            return Ok(Flow::Continue);
        }

        let namespace = &params.cluster_name;
        let record = self
            .call(
                "get ClusterInstance",
                self.store.get_cluster_instance(namespace, namespace),
            )
            .await?
            .ok_or_else(|| {
                ControllerError::Transient(format!(
                    "ClusterInstance {namespace}/{namespace} not found yet"
                ))
            })?;

        let provisioned = record.condition(INSTANCE_PROVISIONED);
        if let Some(condition) = provisioned {
            if condition.status == "True" {
                set_condition(
                    &mut status.conditions,
                    ConditionType::ClusterProvisioned,
                    ConditionStatus::True,
                    ConditionReason::Completed,
                    "Provisioning completed",
                );
                set_phase(status, ProvisioningPhase::Monitoring, "Cluster is provisioned");
                info!("Cluster {} is provisioned", namespace);
                return Ok(Flow::Continue);
            }
            if condition.reason == ConditionReason::Failed.as_str() {
                let message = format!("Provisioning failed: {}", condition.message);
                set_condition(
                    &mut status.conditions,
                    ConditionType::ClusterProvisioned,
                    ConditionStatus::False,
                    ConditionReason::Failed,
                    message.clone(),
                );
                set_phase(status, ProvisioningPhase::Failed, message);
                return Ok(Flow::Stop(ReconcileAction::requeue(LONG_REQUEUE)));
            }
        }

        let started = status
            .cluster_details
            .as_ref()
            .and_then(|d| d.cluster_provision_started_at)
            .unwrap_or_else(Utc::now);
        let elapsed = Utc::now().signed_duration_since(started).to_std().unwrap_or_default();
        if elapsed > config.installation_timeout {
            let message = format!(
                "Cluster installation timed out after {:?}",
                config.installation_timeout
            );
            set_condition(
                &mut status.conditions,
                ConditionType::ClusterProvisioned,
                ConditionStatus::False,
                ConditionReason::TimedOut,
                message.clone(),
            );
            set_phase(status, ProvisioningPhase::Failed, message);
            return Ok(Flow::Stop(ReconcileAction::requeue(LONG_REQUEUE)));
        }

        let message = provisioned
            .map(|c| c.message.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "Provisioning cluster".to_string());
        set_condition(
            &mut status.conditions,
            ConditionType::ClusterProvisioned,
            ConditionStatus::False,
            ConditionReason::InProgress,
            message,
        );
        set_phase(status, ProvisioningPhase::Installing, "Cluster installation is in progress");
        Ok(Flow::Stop(ReconcileAction::requeue(MEDIUM_REQUEUE)))
    }

    async fn ensure_request_finalizer(
        &self,
        request: ProvisioningRequest,
    ) -> Result<ProvisioningRequest, ControllerError> {
        let mut finalizers = request.finalizers().to_vec();
        if finalizers.iter().any(|f| f == PROVISIONING_REQUEST_FINALIZER) {
            return Ok(request);
        }
        finalizers.push(PROVISIONING_REQUEST_FINALIZER.to_string());
        let namespace = request.namespace().unwrap_or_default();
        let name = request.name_any();
        self.call(
            "add ProvisioningRequest finalizer",
            self.store.set_request_finalizers(&namespace, &name, finalizers),
        )
        .await?;
        self.call("get ProvisioningRequest", self.store.get_request(&namespace, &name))
            .await?
            .ok_or_else(|| {
                ControllerError::Fatal(format!("ProvisioningRequest {namespace}/{name} disappeared"))
            })
    }

    /// Tear down everything a request owns, then release its finalizer
    async fn finalize_request(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ReconcileAction, ControllerError> {
        let namespace = request.namespace().unwrap_or_default();
        let name = request.name_any();
        if !request.finalizers().iter().any(|f| f == PROVISIONING_REQUEST_FINALIZER) {
            return Ok(ReconcileAction::await_change());
        }
        info!("Cleaning up ProvisioningRequest {}/{}", namespace, name);

        self.release_hardware(&name, request.status.as_ref()).await?;

        let cluster = request
            .status
            .as_ref()
            .and_then(|s| s.cluster_details.as_ref())
            .map(|d| d.name.clone())
            .filter(|n| !n.is_empty())
            .or_else(|| {
                request
                    .spec
                    .template_parameters
                    .get(PARAM_NODE_CLUSTER_NAME)
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
        if let Some(cluster) = cluster {
            self.call(
                "delete ClusterInstance",
                self.store.delete_cluster_instance(&cluster, &cluster),
            )
            .await?;
            debug!("Deleted ClusterInstance {}/{}", cluster, cluster);
        }

        let finalizers: Vec<String> = request
            .finalizers()
            .iter()
            .filter(|f| *f != PROVISIONING_REQUEST_FINALIZER)
            .cloned()
            .collect();
        self.call(
            "remove ProvisioningRequest finalizer",
            self.store.set_request_finalizers(&namespace, &name, finalizers),
        )
        .await?;
        info!("Released ProvisioningRequest {}/{}", namespace, name);
        Ok(ReconcileAction::await_change())
    }

    /// Write a request status with optimistic retries.
    ///
    /// The callback marker is owned by the callback endpoint, so the stored
    /// value is always kept.
    async fn commit_request_status(
        &self,
        request: &ProvisioningRequest,
        desired: ProvisioningRequestStatus,
    ) -> Result<(), ControllerError> {
        let namespace = request.namespace().unwrap_or_default();
        let name = request.name_any();
        let mut current = request.clone();

        for attempt in 1..=MAX_STATUS_ATTEMPTS {
            let stored = current.status.clone().unwrap_or_default();
            let mut next = desired.clone();
            next.callback = stored.callback.clone();
            if next == stored {
                return Ok(());
            }

            current.status = Some(next);
            match self
                .call(
                    "update ProvisioningRequest status",
                    self.store.replace_request_status(&current),
                )
                .await
            {
                Ok(_) => return Ok(()),
                Err(ControllerError::Conflict(msg)) => {
                    debug!(
                        "ProvisioningRequest {}/{} status conflict (attempt {}): {}",
                        namespace, name, attempt, msg
                    );
                    current = self
                        .call("get ProvisioningRequest", self.store.get_request(&namespace, &name))
                        .await?
                        .ok_or_else(|| {
                            ControllerError::Fatal(format!(
                                "ProvisioningRequest {namespace}/{name} disappeared during a status update"
                            ))
                        })?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(ControllerError::Conflict(format!(
            "ProvisioningRequest {namespace}/{name} status update lost {MAX_STATUS_ATTEMPTS} races"
        )))
    }
}
