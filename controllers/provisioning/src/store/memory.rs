//! In-memory store for unit tests.
//!
//! Mimics the API server rules the reconciler depends on: resource versions
//! guard status writes, spec edits bump the generation, and immutable
//! ConfigMaps cannot be changed.

use super::{
    ClusterInstanceDoc, ClusterInstanceRecord, ConfigDocument, InstanceCondition, PolicyRecord,
    ProvisioningStore,
};
use crate::error::ControllerError;
use crds::{AllocatedNode, ClusterTemplate, ProvisioningRequest};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Debug, Default)]
struct State {
    requests: HashMap<Key, ProvisioningRequest>,
    templates: HashMap<Key, ClusterTemplate>,
    config_maps: HashMap<Key, ConfigDocument>,
    image_sets: HashMap<String, String>,
    namespaces: HashSet<String>,
    secrets: HashSet<Key>,
    secret_data: HashMap<Key, BTreeMap<String, Vec<u8>>>,
    instances: HashMap<Key, ClusterInstanceRecord>,
    allocated_nodes: HashMap<Key, AllocatedNode>,
    policies: HashMap<String, Vec<PolicyRecord>>,
    next_version: u64,
    dry_run_rejection: Option<String>,
    pending_conflicts: usize,
    status_writes: usize,
    dry_runs: usize,
    policies_unavailable: bool,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// Store holding every record in process memory
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request as a user would create it
    pub fn put_request(&self, mut request: ProvisioningRequest) {
        let mut state = self.state.lock().unwrap();
        request.metadata.resource_version = Some(state.bump());
        request.metadata.generation.get_or_insert(1);
        state
            .requests
            .insert(key(&request.namespace().unwrap_or_default(), &request.name_any()), request);
    }

    /// Edit a request spec the way `kubectl edit` would
    pub fn update_request_spec(
        &self,
        namespace: &str,
        name: &str,
        edit: impl FnOnce(&mut crds::ProvisioningRequestSpec),
    ) {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let request = state.requests.get_mut(&key(namespace, name)).unwrap();
        edit(&mut request.spec);
        request.metadata.generation = Some(request.metadata.generation.unwrap_or(1) + 1);
        request.metadata.resource_version = Some(version);
    }

    /// Mark a request as being deleted
    pub fn mark_request_deleted(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let request = state.requests.get_mut(&key(namespace, name)).unwrap();
        request.metadata.deletion_timestamp = deletion_time();
    }

    pub fn request(&self, namespace: &str, name: &str) -> Option<ProvisioningRequest> {
        self.state.lock().unwrap().requests.get(&key(namespace, name)).cloned()
    }

    /// Insert a template as an operator would create it
    pub fn put_template(&self, mut template: ClusterTemplate) {
        let mut state = self.state.lock().unwrap();
        template.metadata.resource_version = Some(state.bump());
        template.metadata.generation.get_or_insert(1);
        state.templates.insert(
            key(&template.namespace().unwrap_or_default(), &template.name_any()),
            template,
        );
    }

    /// Edit a template spec; bumps the generation
    pub fn update_template_spec(
        &self,
        namespace: &str,
        name: &str,
        edit: impl FnOnce(&mut crds::ClusterTemplateSpec),
    ) {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let template = state.templates.get_mut(&key(namespace, name)).unwrap();
        edit(&mut template.spec);
        template.metadata.generation = Some(template.metadata.generation.unwrap_or(1) + 1);
        template.metadata.resource_version = Some(version);
    }

    pub fn mark_template_deleted(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let template = state.templates.get_mut(&key(namespace, name)).unwrap();
        template.metadata.deletion_timestamp = deletion_time();
    }

    /// Drop a template without running its finalizer
    pub fn remove_template(&self, namespace: &str, name: &str) {
        self.state.lock().unwrap().templates.remove(&key(namespace, name));
    }

    pub fn template(&self, namespace: &str, name: &str) -> Option<ClusterTemplate> {
        self.state.lock().unwrap().templates.get(&key(namespace, name)).cloned()
    }

    /// Create or replace a ConfigMap, enforcing immutability
    pub fn put_config_map(&self, doc: ConfigDocument) -> Result<(), ControllerError> {
        let mut state = self.state.lock().unwrap();
        let k = key(&doc.namespace, &doc.name);
        if let Some(existing) = state.config_maps.get(&k) {
            if existing.immutable && (!doc.immutable || existing.data != doc.data) {
                return Err(ControllerError::Input(format!(
                    "ConfigMap {}/{} is immutable",
                    doc.namespace, doc.name
                )));
            }
        }
        state.config_maps.insert(k, doc);
        Ok(())
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigDocument> {
        self.state.lock().unwrap().config_maps.get(&key(namespace, name)).cloned()
    }

    pub fn put_image_set(&self, name: &str, release_image: &str) {
        self.state
            .lock()
            .unwrap()
            .image_sets
            .insert(name.to_string(), release_image.to_string());
    }

    pub fn put_secret(&self, namespace: &str, name: &str) {
        self.state.lock().unwrap().secrets.insert(key(namespace, name));
    }

    pub fn has_secret(&self, namespace: &str, name: &str) -> bool {
        self.state.lock().unwrap().secrets.contains(&key(namespace, name))
    }

    pub fn secret_data(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, Vec<u8>>> {
        self.state.lock().unwrap().secret_data.get(&key(namespace, name)).cloned()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().unwrap().namespaces.contains(name)
    }

    pub fn set_policies(&self, cluster_namespace: &str, policies: Vec<PolicyRecord>) {
        self.state
            .lock()
            .unwrap()
            .policies
            .insert(cluster_namespace.to_string(), policies);
    }

    /// Make policy listing fail with a transient error
    pub fn set_policies_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().policies_unavailable = unavailable;
    }

    /// Set an installer condition on an applied ClusterInstance
    pub fn set_instance_condition(
        &self,
        namespace: &str,
        name: &str,
        type_: &str,
        status: &str,
        reason: &str,
    ) {
        let mut state = self.state.lock().unwrap();
        let record = state.instances.get_mut(&key(namespace, name)).unwrap();
        record.conditions.retain(|c| c.type_ != type_);
        record.conditions.push(InstanceCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: String::new(),
        });
    }

    pub fn instance(&self, namespace: &str, name: &str) -> Option<ClusterInstanceRecord> {
        self.state.lock().unwrap().instances.get(&key(namespace, name)).cloned()
    }

    pub fn allocated_node(&self, namespace: &str, name: &str) -> Option<AllocatedNode> {
        self.state
            .lock()
            .unwrap()
            .allocated_nodes
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn allocated_node_count(&self) -> usize {
        self.state.lock().unwrap().allocated_nodes.len()
    }

    /// Reject every dry-run apply with this message
    pub fn reject_dry_run(&self, message: &str) {
        self.state.lock().unwrap().dry_run_rejection = Some(message.to_string());
    }

    /// Fail the next `count` status writes with a conflict
    pub fn inject_status_conflicts(&self, count: usize) {
        self.state.lock().unwrap().pending_conflicts = count;
    }

    /// Successful status writes so far
    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }

    pub fn dry_runs(&self) -> usize {
        self.state.lock().unwrap().dry_runs
    }
}

#[async_trait::async_trait]
impl ProvisioningStore for InMemoryStore {
    async fn get_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ProvisioningRequest>, ControllerError> {
        Ok(self.request(namespace, name))
    }

    async fn list_requests(&self) -> Result<Vec<ProvisioningRequest>, ControllerError> {
        Ok(self.state.lock().unwrap().requests.values().cloned().collect())
    }

    async fn replace_request_status(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningRequest, ControllerError> {
        let mut state = self.state.lock().unwrap();
        let k = key(&request.namespace().unwrap_or_default(), &request.name_any());
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            // Simulate a concurrent writer
            let version = state.bump();
            if let Some(stored) = state.requests.get_mut(&k) {
                stored.metadata.resource_version = Some(version);
            }
            return Err(ControllerError::Conflict(format!("{} was modified", k.1)));
        }
        let version = state.bump();
        let stored = state
            .requests
            .get_mut(&k)
            .ok_or_else(|| ControllerError::Fatal(format!("ProvisioningRequest {} not found", k.1)))?;
        if stored.metadata.resource_version != request.metadata.resource_version {
            return Err(ControllerError::Conflict(format!("{} was modified", k.1)));
        }
        stored.status = request.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.status_writes += 1;
        Ok(updated)
    }

    async fn set_request_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ControllerError> {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let k = key(namespace, name);
        let Some(stored) = state.requests.get_mut(&k) else {
            return Ok(());
        };
        stored.metadata.finalizers = Some(finalizers);
        stored.metadata.resource_version = Some(version);
        // The API server drops a deleted object once its last finalizer goes
        if stored.metadata.deletion_timestamp.is_some()
            && stored.metadata.finalizers.as_ref().is_none_or(Vec::is_empty)
        {
            state.requests.remove(&k);
        }
        Ok(())
    }

    async fn get_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterTemplate>, ControllerError> {
        Ok(self.template(namespace, name))
    }

    async fn list_templates(&self) -> Result<Vec<ClusterTemplate>, ControllerError> {
        Ok(self.state.lock().unwrap().templates.values().cloned().collect())
    }

    async fn replace_template_status(
        &self,
        template: &ClusterTemplate,
    ) -> Result<ClusterTemplate, ControllerError> {
        let mut state = self.state.lock().unwrap();
        let k = key(&template.namespace().unwrap_or_default(), &template.name_any());
        let version = state.bump();
        let stored = state
            .templates
            .get_mut(&k)
            .ok_or_else(|| ControllerError::Fatal(format!("ClusterTemplate {} not found", k.1)))?;
        if stored.metadata.resource_version != template.metadata.resource_version {
            return Err(ControllerError::Conflict(format!("{} was modified", k.1)));
        }
        stored.status = template.status.clone();
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn set_template_id(
        &self,
        namespace: &str,
        name: &str,
        template_id: &str,
    ) -> Result<ClusterTemplate, ControllerError> {
        self.update_template_spec(namespace, name, |spec| {
            spec.template_id = Some(template_id.to_string());
        });
        self.template(namespace, name)
            .ok_or_else(|| ControllerError::Fatal(format!("ClusterTemplate {name} not found")))
    }

    async fn set_template_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ControllerError> {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let k = key(namespace, name);
        let Some(stored) = state.templates.get_mut(&k) else {
            return Ok(());
        };
        stored.metadata.finalizers = Some(finalizers);
        stored.metadata.resource_version = Some(version);
        if stored.metadata.deletion_timestamp.is_some()
            && stored.metadata.finalizers.as_ref().is_none_or(Vec::is_empty)
        {
            state.templates.remove(&k);
        }
        Ok(())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigDocument>, ControllerError> {
        Ok(self.config_map(namespace, name))
    }

    async fn apply_config_map(&self, doc: &ConfigDocument) -> Result<(), ControllerError> {
        self.put_config_map(doc.clone())
    }

    async fn mark_config_map_immutable(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        let mut state = self.state.lock().unwrap();
        let doc = state.config_maps.get_mut(&key(namespace, name)).ok_or_else(|| {
            ControllerError::Input(format!("ConfigMap {namespace}/{name} not found"))
        })?;
        doc.immutable = true;
        Ok(())
    }

    async fn get_cluster_image_set(&self, name: &str) -> Result<Option<String>, ControllerError> {
        Ok(self.state.lock().unwrap().image_sets.get(name).cloned())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<(), ControllerError> {
        self.state.lock().unwrap().namespaces.insert(name.to_string());
        Ok(())
    }

    async fn apply_cluster_instance(
        &self,
        doc: &ClusterInstanceDoc,
        dry_run: bool,
    ) -> Result<(), ControllerError> {
        let mut state = self.state.lock().unwrap();
        if !state.namespaces.contains(&doc.namespace) {
            return Err(ControllerError::Input(format!(
                "namespace {} not found",
                doc.namespace
            )));
        }
        if dry_run {
            state.dry_runs += 1;
            if let Some(message) = &state.dry_run_rejection {
                return Err(ControllerError::Input(format!(
                    "failed to validate the rendered ClusterInstance {}/{}: {message}",
                    doc.namespace, doc.name
                )));
            }
            return Ok(());
        }
        let k = key(&doc.namespace, &doc.name);
        let conditions = state
            .instances
            .get(&k)
            .map(|r| r.conditions.clone())
            .unwrap_or_default();
        state.instances.insert(
            k,
            ClusterInstanceRecord {
                doc: doc.clone(),
                conditions,
            },
        );
        Ok(())
    }

    async fn get_cluster_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterInstanceRecord>, ControllerError> {
        Ok(self.instance(namespace, name))
    }

    async fn delete_cluster_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        self.state.lock().unwrap().instances.remove(&key(namespace, name));
        Ok(())
    }

    async fn copy_secret(
        &self,
        from_namespace: &str,
        name: &str,
        to_namespace: &str,
    ) -> Result<(), ControllerError> {
        let mut state = self.state.lock().unwrap();
        if !state.secrets.contains(&key(from_namespace, name)) {
            return Err(ControllerError::Input(format!(
                "BMC secret {from_namespace}/{name} not found"
            )));
        }
        state.secrets.insert(key(to_namespace, name));
        Ok(())
    }

    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), ControllerError> {
        let mut state = self.state.lock().unwrap();
        state.secrets.insert(key(namespace, name));
        state.secret_data.insert(key(namespace, name), data);
        Ok(())
    }

    async fn apply_allocated_node(&self, node: &AllocatedNode) -> Result<(), ControllerError> {
        self.state.lock().unwrap().allocated_nodes.insert(
            key(&node.namespace().unwrap_or_default(), &node.name_any()),
            node.clone(),
        );
        Ok(())
    }

    async fn delete_allocated_nodes(
        &self,
        namespace: &str,
        provisioning_request: &str,
    ) -> Result<(), ControllerError> {
        self.state.lock().unwrap().allocated_nodes.retain(|(ns, _), node| {
            ns != namespace || node.spec.provisioning_request != provisioning_request
        });
        Ok(())
    }

    async fn list_cluster_policies(
        &self,
        cluster_namespace: &str,
    ) -> Result<Vec<PolicyRecord>, ControllerError> {
        let state = self.state.lock().unwrap();
        if state.policies_unavailable {
            return Err(ControllerError::Transient(
                "policy engine unavailable".to_string(),
            ));
        }
        Ok(state
            .policies
            .get(cluster_namespace)
            .cloned()
            .unwrap_or_default())
    }
}

fn deletion_time<T: serde::de::DeserializeOwned>() -> Option<T> {
    serde_json::from_value(serde_json::json!(chrono::Utc::now().to_rfc3339_opts(
        chrono::SecondsFormat::Secs,
        true
    )))
    .ok()
}

/// ConfigMap builder for tests
pub fn config_map(namespace: &str, name: &str, data: &[(&str, &str)]) -> ConfigDocument {
    ConfigDocument {
        name: name.to_string(),
        namespace: namespace.to_string(),
        data: data
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<BTreeMap<_, _>>(),
        immutable: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immutable_config_map_cannot_flip_back() {
        let store = InMemoryStore::new();
        let mut doc = config_map("ns", "defaults", &[("k", "v")]);
        doc.immutable = true;
        store.put_config_map(doc.clone()).unwrap();

        // Re-applying the same immutable document is fine
        store.put_config_map(doc.clone()).unwrap();

        doc.immutable = false;
        let err = store.put_config_map(doc).unwrap_err();
        assert!(err.is_input());
    }
}
