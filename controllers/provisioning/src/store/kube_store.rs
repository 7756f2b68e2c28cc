//! Kubernetes-backed store.
//!
//! Owned records (templates, requests, allocated-node mirrors) go through the
//! typed CRD APIs. Installer, policy-engine and image-set objects belong to
//! other operators and are reached as `DynamicObject`s.

use super::{
    ClusterInstanceDoc, ClusterInstanceRecord, ConfigDocument, InstanceCondition, PolicyRecord,
    ProvisioningStore, ROOT_POLICY_LABEL,
};
use crate::error::{ControllerError, kube_status_code};
use crds::{AllocatedNode, ClusterTemplate, ProvisioningRequest};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams, PostParams,
};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Field manager used for server-side apply
const FIELD_MANAGER: &str = "provisioning-controller";

fn cluster_instance_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "siteconfig.open-cluster-management.io",
        "v1alpha1",
        "ClusterInstance",
    ))
}

fn cluster_image_set_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("hive.openshift.io", "v1", "ClusterImageSet"))
}

fn policy_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "policy.open-cluster-management.io",
        "v1",
        "Policy",
    ))
}

/// Store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    watch_namespace: Option<String>,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("watch_namespace", &self.watch_namespace)
            .finish_non_exhaustive()
    }
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client, watch_namespace: Option<String>) -> Self {
        Self {
            client,
            watch_namespace,
        }
    }

    fn scoped<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match &self.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn replace_status<K>(&self, api: Api<K>, object: &K) -> Result<K, ControllerError>
    where
        K: Resource + Clone + Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let name = object.meta().name.clone().ok_or_else(|| {
            ControllerError::Fatal("status write for an object without a name".to_string())
        })?;
        let data = serde_json::to_vec(object)?;
        match api.replace_status(&name, &PostParams::default(), data).await {
            Ok(updated) => Ok(updated),
            Err(e) if kube_status_code(&e) == Some(409) => Err(ControllerError::Conflict(format!(
                "{name} was modified concurrently: {e}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_finalizers<K>(
        &self,
        api: Api<K>,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ControllerError>
    where
        K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProvisioningStore for KubeStore {
    async fn get_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ProvisioningRequest>, ControllerError> {
        let api: Api<ProvisioningRequest> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_requests(&self) -> Result<Vec<ProvisioningRequest>, ControllerError> {
        let api: Api<ProvisioningRequest> = self.scoped();
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn replace_request_status(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningRequest, ControllerError> {
        let namespace = request.namespace().unwrap_or_default();
        let api: Api<ProvisioningRequest> = Api::namespaced(self.client.clone(), &namespace);
        self.replace_status(api, request).await
    }

    async fn set_request_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ControllerError> {
        let api: Api<ProvisioningRequest> = Api::namespaced(self.client.clone(), namespace);
        self.patch_finalizers(api, name, finalizers).await
    }

    async fn get_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterTemplate>, ControllerError> {
        let api: Api<ClusterTemplate> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_templates(&self) -> Result<Vec<ClusterTemplate>, ControllerError> {
        let api: Api<ClusterTemplate> = self.scoped();
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn replace_template_status(
        &self,
        template: &ClusterTemplate,
    ) -> Result<ClusterTemplate, ControllerError> {
        let namespace = template.namespace().unwrap_or_default();
        let api: Api<ClusterTemplate> = Api::namespaced(self.client.clone(), &namespace);
        self.replace_status(api, template).await
    }

    async fn set_template_id(
        &self,
        namespace: &str,
        name: &str,
        template_id: &str,
    ) -> Result<ClusterTemplate, ControllerError> {
        let api: Api<ClusterTemplate> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "spec": { "templateId": template_id } });
        info!("Setting templateId {} on ClusterTemplate {}/{}", template_id, namespace, name);
        Ok(api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn set_template_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ControllerError> {
        let api: Api<ClusterTemplate> = Api::namespaced(self.client.clone(), namespace);
        self.patch_finalizers(api, name, finalizers).await
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigDocument>, ControllerError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(|cm| ConfigDocument {
            name: name.to_string(),
            namespace: namespace.to_string(),
            data: cm.data.unwrap_or_default(),
            immutable: cm.immutable.unwrap_or(false),
        }))
    }

    async fn apply_config_map(&self, doc: &ConfigDocument) -> Result<(), ControllerError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &doc.namespace);
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(doc.name.clone()),
                namespace: Some(doc.namespace.clone()),
                ..Default::default()
            },
            data: Some(doc.data.clone()),
            ..Default::default()
        };
        api.patch(
            &doc.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&config_map),
        )
        .await?;
        debug!("Applied ConfigMap {}/{}", doc.namespace, doc.name);
        Ok(())
    }

    async fn mark_config_map_immutable(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "immutable": true });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if kube_status_code(&e) == Some(422) => Err(ControllerError::Input(format!(
                "failed to mark ConfigMap {namespace}/{name} immutable: {e}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_cluster_image_set(&self, name: &str) -> Result<Option<String>, ControllerError> {
        let api: Api<DynamicObject> =
            Api::all_with(self.client.clone(), &cluster_image_set_resource());
        Ok(api.get_opt(name).await?.map(|obj| {
            obj.data
                .pointer("/spec/releaseImage")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string()
        }))
    }

    async fn ensure_namespace(&self, name: &str) -> Result<(), ControllerError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(name).await?.is_some() {
            return Ok(());
        }
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                info!("Created namespace {}", name);
                Ok(())
            }
            Err(e) if kube_status_code(&e) == Some(409) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_cluster_instance(
        &self,
        doc: &ClusterInstanceDoc,
        dry_run: bool,
    ) -> Result<(), ControllerError> {
        let ar = cluster_instance_resource();
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &doc.namespace, &ar);
        let object = json!({
            "apiVersion": ar.api_version,
            "kind": ar.kind,
            "metadata": { "name": doc.name, "namespace": doc.namespace },
            "spec": doc.spec,
        });
        let mut params = PatchParams::apply(FIELD_MANAGER).force();
        params.dry_run = dry_run;
        debug!(
            "Applying ClusterInstance {}/{} (dry run: {})",
            doc.namespace, doc.name, dry_run
        );
        match api.patch(&doc.name, &params, &Patch::Apply(&object)).await {
            Ok(_) => Ok(()),
            Err(e) if matches!(kube_status_code(&e), Some(400 | 422)) => {
                Err(ControllerError::Input(format!(
                    "failed to validate the rendered ClusterInstance {}/{}: {e}",
                    doc.namespace, doc.name
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_cluster_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterInstanceRecord>, ControllerError> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &cluster_instance_resource());
        let Some(obj) = api.get_opt(name).await? else {
            return Ok(None);
        };
        let conditions: Vec<InstanceCondition> = obj
            .data
            .pointer("/status/conditions")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        Ok(Some(ClusterInstanceRecord {
            doc: ClusterInstanceDoc {
                namespace: namespace.to_string(),
                name: name.to_string(),
                spec: obj.data.get("spec").cloned().unwrap_or_default(),
            },
            conditions,
        }))
    }

    async fn delete_cluster_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &cluster_instance_resource());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Deleted ClusterInstance {}/{}", namespace, name);
                Ok(())
            }
            Err(e) if kube_status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn copy_secret(
        &self,
        from_namespace: &str,
        name: &str,
        to_namespace: &str,
    ) -> Result<(), ControllerError> {
        let source: Api<Secret> = Api::namespaced(self.client.clone(), from_namespace);
        let secret = source.get_opt(name).await?.ok_or_else(|| {
            ControllerError::Input(format!("BMC secret {from_namespace}/{name} not found"))
        })?;
        let copy = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(to_namespace.to_string()),
                ..Default::default()
            },
            data: secret.data,
            type_: secret.type_,
            ..Default::default()
        };
        let target: Api<Secret> = Api::namespaced(self.client.clone(), to_namespace);
        target
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&copy),
            )
            .await?;
        debug!("Copied secret {} from {} to {}", name, from_namespace, to_namespace);
        Ok(())
    }

    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), ControllerError> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await?;
        debug!("Applied secret {}/{}", namespace, name);
        Ok(())
    }

    async fn apply_allocated_node(&self, node: &AllocatedNode) -> Result<(), ControllerError> {
        let name = node.name_any();
        let namespace = node.namespace().unwrap_or_default();
        let api: Api<AllocatedNode> = Api::namespaced(self.client.clone(), &namespace);
        let mut desired = node.clone();
        desired.status = None;
        desired.metadata.managed_fields = None;
        desired.metadata.resource_version = None;
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&desired),
        )
        .await?;
        if let Some(status) = &node.status {
            let patch = json!({ "status": status });
            api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        Ok(())
    }

    async fn delete_allocated_nodes(
        &self,
        namespace: &str,
        provisioning_request: &str,
    ) -> Result<(), ControllerError> {
        let api: Api<AllocatedNode> = Api::namespaced(self.client.clone(), namespace);
        for node in api.list(&ListParams::default()).await?.items {
            if node.spec.provisioning_request != provisioning_request {
                continue;
            }
            let name = node.name_any();
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => info!("Deleted AllocatedNode {}/{}", namespace, name),
                Err(e) if kube_status_code(&e) == Some(404) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn list_cluster_policies(
        &self,
        cluster_namespace: &str,
    ) -> Result<Vec<PolicyRecord>, ControllerError> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), cluster_namespace, &policy_resource());
        let policies = api
            .list(&ListParams::default().labels(ROOT_POLICY_LABEL))
            .await?;
        Ok(policies
            .items
            .into_iter()
            .map(|policy| {
                let text = |pointer: &str| {
                    policy
                        .data
                        .pointer(pointer)
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                PolicyRecord {
                    name: policy.name_any(),
                    namespace: cluster_namespace.to_string(),
                    compliant: text("/status/compliant"),
                    remediation_action: text("/spec/remediationAction").to_lowercase(),
                }
            })
            .collect())
    }
}
