//! Controller-specific error types.
//!
//! Every error maps onto one of four handling classes (see [`ErrorClass`]);
//! the work loop picks the requeue policy from the class alone.

use hwplugin_client::HardwarePluginError;
use kube::Error as KubeError;
use thiserror::Error;

/// How an error is handled by the work loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed template, request or configuration; needs user correction
    Input,
    /// Backend unavailable or slow; retried with backoff
    Transient,
    /// Optimistic-concurrency collision on a status write
    Conflict,
    /// Invariant violation; surfaced as Failed with a long backoff
    Fatal,
}

/// Errors that can occur in the provisioning controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Hardware plugin API error
    #[error("Hardware plugin error: {0}")]
    HardwarePlugin(#[from] HardwarePluginError),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parse error in a configuration document
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid controller configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid template, request or configuration document
    #[error("{0}")]
    Input(String),

    /// Status write lost the optimistic-concurrency race
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A backend call exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Retryable failure not covered by a wrapped error
    #[error("Transient error: {0}")]
    Transient(String),

    /// Invariant violation
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Callback server failed
    #[error("Callback server error: {0}")]
    Server(String),
}

impl ControllerError {
    /// Handling class of this error
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Kube(e) => match kube_status_code(e) {
                Some(409) => ErrorClass::Conflict,
                Some(400 | 404 | 422) => ErrorClass::Input,
                _ => ErrorClass::Transient,
            },
            Self::HardwarePlugin(e) => {
                if e.is_transient() {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Input
                }
            }
            Self::Serialization(_) | Self::Yaml(_) | Self::Input(_) => ErrorClass::Input,
            Self::Conflict(_) => ErrorClass::Conflict,
            Self::Timeout(_) | Self::Transient(_) | Self::Watch(_) | Self::Server(_) => {
                ErrorClass::Transient
            }
            Self::InvalidConfig(_) | Self::Fatal(_) => ErrorClass::Fatal,
        }
    }

    /// True for errors that need user correction
    #[must_use]
    pub fn is_input(&self) -> bool {
        self.class() == ErrorClass::Input
    }
}

/// HTTP status of an API error response, if this is one
pub(crate) fn kube_status_code(error: &KubeError) -> Option<u16> {
    match error {
        KubeError::Api(response) => Some(response.code),
        _ => None,
    }
}
