//! Mock HardwarePluginClient for unit testing
//!
//! Stores allocations and nodes in memory. Tests drive the allocation
//! lifecycle with `set_provisioned` and inspect call counts.

use crate::error::HardwarePluginError;
use crate::models::*;
use crate::plugin_trait::HardwarePluginClientTrait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Mock HardwarePluginClient for testing
#[derive(Clone, Debug, Default)]
pub struct MockHardwarePluginClient {
    name: String,
    requests: Arc<Mutex<HashMap<String, NodeAllocationRequestResponse>>>,
    allocated_nodes: Arc<Mutex<HashMap<String, Vec<AllocatedNode>>>>,
    next_id: Arc<AtomicUsize>,
    create_calls: Arc<AtomicUsize>,
    update_calls: Arc<AtomicUsize>,
    delete_calls: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
}

impl MockHardwarePluginClient {
    /// Create a new mock client
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_id: Arc::new(AtomicUsize::new(1)),
            ..Default::default()
        }
    }

    /// Set the `Provisioned` condition of an allocation (for test setup)
    pub fn set_provisioned(&self, id: &str, status: &str, reason: &str, message: &str) {
        let mut requests = self.requests.lock().unwrap();
        let entry = requests.entry(id.to_string()).or_default();
        let conditions = &mut entry.status.get_or_insert_with(Default::default).conditions;
        conditions.retain(|c| c.type_ != CONDITION_PROVISIONED);
        conditions.push(PluginCondition {
            type_: CONDITION_PROVISIONED.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Some(chrono::Utc::now()),
        });
    }

    /// Register nodes allocated for an allocation (for test setup)
    pub fn set_allocated_nodes(&self, id: &str, nodes: Vec<AllocatedNode>) {
        self.allocated_nodes.lock().unwrap().insert(id.to_string(), nodes);
    }

    /// Make every call fail with a 503 until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Stored allocation body, if any
    pub fn stored_request(&self, id: &str) -> Option<NodeAllocationRequest> {
        self.requests
            .lock()
            .unwrap()
            .get(id)
            .and_then(|r| r.node_allocation_request.clone())
    }

    /// Number of create calls
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of update calls
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Number of delete calls
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), HardwarePluginError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(HardwarePluginError::Api {
                status: 503,
                message: "empty or unexpected error response for NodeAllocationRequest '': Service Unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl HardwarePluginClientTrait for MockHardwarePluginClient {
    fn plugin_name(&self) -> &str {
        &self.name
    }

    async fn get_api_versions(&self) -> Result<ApiVersions, HardwarePluginError> {
        self.check_available()?;
        Ok(ApiVersions {
            uri_prefix: Some("/hardware-manager/provisioning/v1".to_string()),
            api_versions: vec![ApiVersion {
                version: Some("v1".to_string()),
            }],
        })
    }

    async fn get_node_allocation_request(
        &self,
        id: &str,
    ) -> Result<Option<NodeAllocationRequestResponse>, HardwarePluginError> {
        self.check_available()?;
        Ok(self.requests.lock().unwrap().get(id).cloned())
    }

    async fn create_node_allocation_request(
        &self,
        request: &NodeAllocationRequest,
    ) -> Result<String, HardwarePluginError> {
        self.check_available()?;
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let id = format!("nar-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.requests.lock().unwrap().insert(
            id.clone(),
            NodeAllocationRequestResponse {
                node_allocation_request: Some(request.clone()),
                status: Some(NodeAllocationRequestStatus::default()),
            },
        );
        Ok(id)
    }

    async fn update_node_allocation_request(
        &self,
        id: &str,
        request: &NodeAllocationRequest,
    ) -> Result<String, HardwarePluginError> {
        self.check_available()?;
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut requests = self.requests.lock().unwrap();
        let entry = requests
            .get_mut(id)
            .ok_or_else(|| HardwarePluginError::NotFound(format!("NodeAllocationRequest {id}")))?;
        entry.node_allocation_request = Some(request.clone());
        Ok(id.to_string())
    }

    async fn delete_node_allocation_request(
        &self,
        id: &str,
    ) -> Result<Option<String>, HardwarePluginError> {
        self.check_available()?;
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.allocated_nodes.lock().unwrap().remove(id);
        Ok(self.requests.lock().unwrap().remove(id).map(|_| id.to_string()))
    }

    async fn get_allocated_nodes(
        &self,
        node_allocation_request_id: &str,
    ) -> Result<Vec<AllocatedNode>, HardwarePluginError> {
        self.check_available()?;
        Ok(self
            .allocated_nodes
            .lock()
            .unwrap()
            .get(node_allocation_request_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_allocated_node(
        &self,
        node_id: &str,
    ) -> Result<Option<AllocatedNode>, HardwarePluginError> {
        self.check_available()?;
        Ok(self
            .allocated_nodes
            .lock()
            .unwrap()
            .values()
            .flatten()
            .find(|n| n.id == node_id)
            .cloned())
    }
}
