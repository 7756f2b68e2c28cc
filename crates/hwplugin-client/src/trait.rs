//! HardwarePluginClient trait for mocking
//!
//! The concrete `HardwarePluginClient` implements this trait, and the
//! controller's tests use `MockHardwarePluginClient` instead.

use crate::error::HardwarePluginError;
use crate::models::*;

/// Trait for hardware plugin provisioning API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait HardwarePluginClientTrait: Send + Sync {
    /// Plugin name
    fn plugin_name(&self) -> &str;

    /// Version discovery
    async fn get_api_versions(&self) -> Result<ApiVersions, HardwarePluginError>;

    /// Fetch an allocation; `Ok(None)` when the plugin does not know it yet
    async fn get_node_allocation_request(
        &self,
        id: &str,
    ) -> Result<Option<NodeAllocationRequestResponse>, HardwarePluginError>;

    /// Submit an allocation; returns the plugin-assigned identifier
    async fn create_node_allocation_request(
        &self,
        request: &NodeAllocationRequest,
    ) -> Result<String, HardwarePluginError>;

    /// Replace the node groups of an existing allocation
    async fn update_node_allocation_request(
        &self,
        id: &str,
        request: &NodeAllocationRequest,
    ) -> Result<String, HardwarePluginError>;

    /// Delete an allocation; `Ok(None)` when it was already gone
    async fn delete_node_allocation_request(
        &self,
        id: &str,
    ) -> Result<Option<String>, HardwarePluginError>;

    /// Nodes allocated for an allocation request
    async fn get_allocated_nodes(
        &self,
        node_allocation_request_id: &str,
    ) -> Result<Vec<AllocatedNode>, HardwarePluginError>;

    /// A single allocated node
    async fn get_allocated_node(
        &self,
        node_id: &str,
    ) -> Result<Option<AllocatedNode>, HardwarePluginError>;
}
