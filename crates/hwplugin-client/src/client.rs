//! Hardware plugin API client
//!
//! Implements the plugin provisioning API under
//! `/hardware-manager/provisioning/v1`. Non-success responses are folded into a
//! single descriptive error carrying the HTTP status text and the plugin's
//! `application/problem+json` detail.

use crate::auth::{AuthConfig, Authenticator};
use crate::error::HardwarePluginError;
use crate::models::*;
use crate::plugin_trait::HardwarePluginClientTrait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error, info};

/// API root shared by all provisioning endpoints
const PROVISIONING_PREFIX: &str = "/hardware-manager/provisioning";
/// Versioned API root
const PROVISIONING_V1: &str = "/hardware-manager/provisioning/v1";

/// Settings for a [`HardwarePluginClient`]
#[derive(Debug, Clone)]
pub struct PluginClientConfig {
    /// Plugin name, used in logs and status
    pub name: String,
    /// Plugin base URL (e.g. "https://loopback-plugin:8443")
    pub base_url: String,
    /// Authentication mode
    pub auth: AuthConfig,
    /// Per-call timeout
    pub timeout: Duration,
}

/// Hardware plugin API client
#[derive(Debug)]
pub struct HardwarePluginClient {
    client: Client,
    base_url: String,
    name: String,
    auth: Authenticator,
}

impl HardwarePluginClient {
    /// Create a new hardware plugin client
    ///
    /// # Errors
    /// Returns `InvalidConfig` when TLS material cannot be loaded.
    pub fn new(config: PluginClientConfig) -> Result<Self, HardwarePluginError> {
        let auth = Authenticator::new(config.auth);
        let builder = Client::builder().timeout(config.timeout);
        let client = auth.configure_builder(builder)?.build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            name: config.name,
            auth,
        })
    }

    /// Get the base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&NodeAllocationRequest>,
    ) -> Result<Response, HardwarePluginError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut request = self
            .client
            .request(method, &url)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }
        let request = self.auth.authorize(&self.client, request).await?;
        let response = request.send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.auth.invalidate().await;
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, HardwarePluginError> {
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Convert a non-success response into an error
    async fn error_from_response(
        &self,
        response: Response,
        resource_type: &str,
        resource_id: &str,
        action: &str,
    ) -> HardwarePluginError {
        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or("Unknown Status");
        let body = response.text().await.unwrap_or_default();
        let problem = serde_json::from_str::<ProblemDetails>(&body)
            .ok()
            .filter(|p| !p.detail.is_empty());

        let message = match problem {
            Some(problem) => {
                error!(
                    "Plugin {} failed to {} {} '{}': {} - {}",
                    self.name, action, resource_type, resource_id, status_text, problem.detail
                );
                format!(
                    "failed to {action} {resource_type} '{resource_id}': {status_text} - {}",
                    problem.detail
                )
            }
            None => {
                error!(
                    "Plugin {} returned empty or unexpected error response for {} '{}': {}",
                    self.name, resource_type, resource_id, status
                );
                format!(
                    "empty or unexpected error response for {resource_type} '{resource_id}': {status_text}"
                )
            }
        };

        HardwarePluginError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait::async_trait]
impl HardwarePluginClientTrait for HardwarePluginClient {
    fn plugin_name(&self) -> &str {
        &self.name
    }

    async fn get_api_versions(&self) -> Result<ApiVersions, HardwarePluginError> {
        let path = format!("{PROVISIONING_PREFIX}/api-versions");
        let response = self.send(Method::GET, &path, None).await?;
        if !response.status().is_success() {
            return Err(self.error_from_response(response, "APIVersions", "", "GET").await);
        }
        Self::decode(response).await
    }

    async fn get_node_allocation_request(
        &self,
        id: &str,
    ) -> Result<Option<NodeAllocationRequestResponse>, HardwarePluginError> {
        let path = format!("{PROVISIONING_V1}/node-allocation-requests/{id}");
        let response = self.send(Method::GET, &path, None).await?;
        match response.status() {
            StatusCode::OK => Ok(Some(Self::decode(response).await?)),
            StatusCode::NOT_FOUND => {
                info!("NodeAllocationRequest {} not found on plugin {}", id, self.name);
                Ok(None)
            }
            _ => Err(self
                .error_from_response(response, "NodeAllocationRequest", id, "GET")
                .await),
        }
    }

    async fn create_node_allocation_request(
        &self,
        request: &NodeAllocationRequest,
    ) -> Result<String, HardwarePluginError> {
        let path = format!("{PROVISIONING_V1}/node-allocation-requests");
        let response = self.send(Method::POST, &path, Some(request)).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(self
                .error_from_response(response, "NodeAllocationRequest", "", "POST")
                .await);
        }
        let id: String = Self::decode(response).await?;
        info!(
            "Created NodeAllocationRequest {} for cluster {} on plugin {}",
            id, request.cluster_id, self.name
        );
        Ok(id)
    }

    async fn update_node_allocation_request(
        &self,
        id: &str,
        request: &NodeAllocationRequest,
    ) -> Result<String, HardwarePluginError> {
        let path = format!("{PROVISIONING_V1}/node-allocation-requests/{id}");
        let response = self.send(Method::PUT, &path, Some(request)).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(self
                .error_from_response(response, "NodeAllocationRequest", id, "PUT")
                .await);
        }
        Self::decode(response).await
    }

    async fn delete_node_allocation_request(
        &self,
        id: &str,
    ) -> Result<Option<String>, HardwarePluginError> {
        let path = format!("{PROVISIONING_V1}/node-allocation-requests/{id}");
        let response = self.send(Method::DELETE, &path, None).await?;
        match response.status() {
            StatusCode::ACCEPTED => Ok(Some(Self::decode(response).await?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(self
                .error_from_response(response, "NodeAllocationRequest", id, "DELETE")
                .await),
        }
    }

    async fn get_allocated_nodes(
        &self,
        node_allocation_request_id: &str,
    ) -> Result<Vec<AllocatedNode>, HardwarePluginError> {
        let path = format!(
            "{PROVISIONING_V1}/node-allocation-requests/{node_allocation_request_id}/allocated-nodes"
        );
        let response = self.send(Method::GET, &path, None).await?;
        if response.status() != StatusCode::OK {
            return Err(self
                .error_from_response(
                    response,
                    "AllocatedNodesFromNodeAllocationRequest",
                    node_allocation_request_id,
                    "GET",
                )
                .await);
        }
        Self::decode(response).await
    }

    async fn get_allocated_node(
        &self,
        node_id: &str,
    ) -> Result<Option<AllocatedNode>, HardwarePluginError> {
        let path = format!("{PROVISIONING_V1}/allocated-nodes/{node_id}");
        let response = self.send(Method::GET, &path, None).await?;
        match response.status() {
            StatusCode::OK => Ok(Some(Self::decode(response).await?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(self
                .error_from_response(response, "AllocatedNode", node_id, "GET")
                .await),
        }
    }
}
