//! Hardware plugin callback endpoint.
//!
//! Plugins POST `/{provisioningRequestName}/callback` when an allocation
//! changes state. The handler only records the idempotency marker on the
//! request status and enqueues the request; it never waits for a pass.

use crate::error::ControllerError;
use crate::queue::{WorkKey, WorkQueue};
use crate::reconciler::MAX_STATUS_ATTEMPTS;
use crate::store::ProvisioningStore;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use crds::{CallbackMarker, ProvisioningRequest};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const MAX_NAME_LENGTH: usize = 253;
const MAX_ERROR_LENGTH: usize = 1000;
const API_VERSION: &str = "1.0.0";
const URI_PREFIX: &str = "/nar-callback/v1";

/// Accepted callback status values
pub const CALLBACK_STATUSES: &[&str] = &[
    "pending",
    "inProgress",
    "completed",
    "failed",
    "timedOut",
    "unprovisioned",
    "notInitialized",
    "configurationUpdateRequested",
    "configurationApplied",
    "invalidInput",
];

/// Statuses that must carry an error message
const FAILURE_STATUSES: &[&str] = &["failed", "timedOut", "invalidInput"];

/// Callback body sent by a hardware plugin
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    #[serde(default)]
    pub node_allocation_request_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallbackPayload {
    /// Check a payload before anything is looked up
    pub fn validate(&self, request_name: &str) -> Result<(), String> {
        if request_name.trim().is_empty() {
            return Err("provisioningRequestName cannot be empty".to_string());
        }
        if request_name.len() > MAX_NAME_LENGTH {
            return Err(format!(
                "provisioningRequestName exceeds maximum length of {MAX_NAME_LENGTH} characters"
            ));
        }
        if self.node_allocation_request_id.trim().is_empty() {
            return Err("nodeAllocationRequestId cannot be empty".to_string());
        }
        if self.node_allocation_request_id.len() > MAX_NAME_LENGTH {
            return Err(format!(
                "nodeAllocationRequestId exceeds maximum length of {MAX_NAME_LENGTH} characters"
            ));
        }
        if !CALLBACK_STATUSES.contains(&self.status.as_str()) {
            return Err(format!(
                "invalid status value: {}, must be one of: {}",
                self.status,
                CALLBACK_STATUSES.join(", ")
            ));
        }
        if self.timestamp.is_none_or(|ts| ts.timestamp() <= 0) {
            return Err("timestamp cannot be zero".to_string());
        }

        let error = self.error.as_deref().map(str::trim).filter(|e| !e.is_empty());
        if let Some(message) = error {
            if message.len() > MAX_ERROR_LENGTH {
                return Err(format!(
                    "error message exceeds maximum length of {MAX_ERROR_LENGTH} characters"
                ));
            }
        }
        let failure = FAILURE_STATUSES.contains(&self.status.as_str());
        match (failure, error) {
            (false, Some(_)) => Err(format!(
                "error message should only be provided when status indicates a failure ({})",
                FAILURE_STATUSES.join(", ")
            )),
            (true, None) => Err(format!(
                "error message is required when status indicates a failure ({})",
                self.status
            )),
            _ => Ok(()),
        }
    }
}

/// `application/problem+json` body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Problem {
    pub status: u16,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// Errors returned to the plugin
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    /// Payload failed validation
    #[error("{0}")]
    InvalidPayload(String),
    /// No request with that name
    #[error("ProvisioningRequest {0} not found")]
    NotFound(String),
    /// Marker could not be persisted
    #[error("Failed to update ProvisioningRequest: {0}")]
    Persistence(#[from] ControllerError),
}

impl IntoResponse for CallbackError {
    fn into_response(self) -> Response {
        let (status, title) = match &self {
            Self::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "Invalid callback payload"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "ProvisioningRequest not found"),
            Self::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };
        let problem = Problem {
            status: status.as_u16(),
            title: title.to_string(),
            detail: self.to_string(),
        };
        (
            status,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/problem+json"),
            )],
            Json(problem),
        )
            .into_response()
    }
}

/// API version listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiVersions {
    pub uri_prefix: String,
    pub api_versions: Vec<ApiVersion>,
}

/// One supported API version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiVersion {
    pub version: String,
}

/// Result of accepting a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// Marker already matched; nothing written
    Duplicate,
    /// Marker updated and the request enqueued
    Recorded,
}

/// Shared state of the callback server
pub struct CallbackState {
    store: Arc<dyn ProvisioningStore>,
    queue: WorkQueue,
}

impl CallbackState {
    pub fn new(store: Arc<dyn ProvisioningStore>, queue: WorkQueue) -> Self {
        Self { store, queue }
    }

    async fn find_request(&self, name: &str) -> Result<ProvisioningRequest, CallbackError> {
        let mut matches: Vec<ProvisioningRequest> = self
            .store
            .list_requests()
            .await?
            .into_iter()
            .filter(|r| r.name_any() == name)
            .collect();
        match matches.len() {
            0 => Err(CallbackError::NotFound(name.to_string())),
            1 => Ok(matches.remove(0)),
            _ => Err(CallbackError::InvalidPayload(format!(
                "provisioningRequestName {name} matches requests in several namespaces"
            ))),
        }
    }

    /// Compare-and-swap the idempotency marker, then enqueue the request
    pub async fn accept(
        &self,
        name: &str,
        payload: &CallbackPayload,
    ) -> Result<Accepted, CallbackError> {
        for attempt in 1..=MAX_STATUS_ATTEMPTS {
            let mut request = self.find_request(name).await?;
            let mut status = request.status.clone().unwrap_or_default();
            let previous = status.callback.clone();
            if previous.as_ref().is_some_and(|m| {
                m.status == payload.status
                    && m.node_allocation_request_id == payload.node_allocation_request_id
            }) {
                debug!(
                    "Duplicate callback for ProvisioningRequest {} ({} / {}); ignoring",
                    name, payload.node_allocation_request_id, payload.status
                );
                return Ok(Accepted::Duplicate);
            }

            status.callback = Some(CallbackMarker {
                status: payload.status.clone(),
                node_allocation_request_id: payload.node_allocation_request_id.clone(),
                received_at: Utc::now(),
            });
            request.status = Some(status);
            match self.store.replace_request_status(&request).await {
                Ok(_) => {
                    let namespace = request.namespace().unwrap_or_default();
                    info!(
                        "Callback for ProvisioningRequest {}/{}: {} -> {} (NodeAllocationRequest {})",
                        namespace,
                        name,
                        previous.map_or_else(|| "none".to_string(), |m| m.status),
                        payload.status,
                        payload.node_allocation_request_id
                    );
                    self.queue.add(WorkKey::request(namespace, name));
                    return Ok(Accepted::Recorded);
                }
                Err(ControllerError::Conflict(msg)) => {
                    debug!("Callback marker conflict for {} (attempt {}): {}", name, attempt, msg);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ControllerError::Conflict(format!(
            "callback marker update for {name} lost {MAX_STATUS_ATTEMPTS} races"
        ))
        .into())
    }
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<StatusCode, CallbackError> {
    let payload: CallbackPayload = serde_json::from_slice(&body)
        .map_err(|e| CallbackError::InvalidPayload(format!("failed to decode callback body: {e}")))?;
    if let Err(detail) = payload.validate(&name) {
        warn!("Rejected callback for ProvisioningRequest {}: {}", name, detail);
        return Err(CallbackError::InvalidPayload(detail));
    }
    match state.accept(&name, &payload).await {
        Ok(_) => Ok(StatusCode::OK),
        Err(e) => {
            if matches!(e, CallbackError::Persistence(_)) {
                error!("Callback for ProvisioningRequest {} failed: {}", name, e);
            }
            Err(e)
        }
    }
}

async fn api_versions() -> Json<ApiVersions> {
    Json(ApiVersions {
        uri_prefix: URI_PREFIX.to_string(),
        api_versions: vec![ApiVersion {
            version: API_VERSION.to_string(),
        }],
    })
}

/// Routes of the callback server
pub fn router(state: Arc<CallbackState>) -> Router {
    Router::new()
        .route("/api-versions", get(api_versions))
        .route("/{name}/callback", post(handle_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
