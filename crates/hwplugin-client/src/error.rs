//! Hardware plugin client errors

use thiserror::Error;

/// Errors that can occur when interacting with a hardware plugin
#[derive(Debug, Error)]
pub enum HardwarePluginError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Plugin returned an error response (problem detail folded into the message)
    #[error("Hardware plugin API error: {message}")]
    Api {
        /// HTTP status code returned by the plugin
        status: u16,
        /// Descriptive message including the status text and problem detail
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Token acquisition or credential problem
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid client configuration (bad URL, unreadable certificate, etc.)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HardwarePluginError {
    /// Whether retrying the same call later may succeed
    ///
    /// Transport failures, timeouts, throttling and 5xx responses are transient.
    /// Other 4xx responses mean the request itself is wrong.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Authentication(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::Serialization(_) | Self::NotFound(_) | Self::InvalidConfig(_) => false,
        }
    }
}
