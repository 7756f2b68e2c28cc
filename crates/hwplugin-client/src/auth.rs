//! Per-plugin authentication
//!
//! A plugin is reached with HTTP basic auth, an OAuth2 client-credentials
//! bearer token, or a client certificate (mTLS). Bearer tokens are cached
//! until shortly before they expire.

use crate::error::HardwarePluginError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

/// Refresh tokens this long before the server-side expiry
const TOKEN_EXPIRY_SKEW_SECS: i64 = 30;

/// Authentication settings for one hardware plugin
#[derive(Debug, Clone, Default)]
pub enum AuthConfig {
    /// No authentication
    #[default]
    None,
    /// HTTP basic auth
    Basic {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// OAuth2 client-credentials grant
    OAuth {
        /// Token endpoint
        token_url: String,
        /// Client identifier
        client_id: String,
        /// Client secret
        client_secret: String,
        /// Requested scopes
        scopes: Vec<String>,
    },
    /// Mutual TLS with a client certificate
    Mtls {
        /// PEM with the client certificate followed by its private key
        identity_pem: Vec<u8>,
        /// Optional PEM CA bundle used to verify the plugin
        ca_pem: Option<Vec<u8>>,
    },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|exp| now < exp)
    }
}

/// Applies the configured credentials to outgoing requests
#[derive(Debug)]
pub(crate) struct Authenticator {
    config: AuthConfig,
    token: Mutex<Option<CachedToken>>,
}

impl Authenticator {
    pub(crate) fn new(config: AuthConfig) -> Self {
        Self {
            config,
            token: Mutex::new(None),
        }
    }

    /// TLS client settings needed by the config (mTLS only)
    pub(crate) fn configure_builder(
        &self,
        mut builder: reqwest::ClientBuilder,
    ) -> Result<reqwest::ClientBuilder, HardwarePluginError> {
        if let AuthConfig::Mtls { identity_pem, ca_pem } = &self.config {
            let identity = reqwest::Identity::from_pem(identity_pem).map_err(|e| {
                HardwarePluginError::InvalidConfig(format!("invalid client certificate: {e}"))
            })?;
            builder = builder.identity(identity);
            if let Some(ca) = ca_pem {
                let cert = reqwest::Certificate::from_pem(ca).map_err(|e| {
                    HardwarePluginError::InvalidConfig(format!("invalid CA certificate: {e}"))
                })?;
                builder = builder.add_root_certificate(cert);
            }
        }
        Ok(builder)
    }

    /// Attach credentials to a request
    pub(crate) async fn authorize(
        &self,
        http: &Client,
        request: RequestBuilder,
    ) -> Result<RequestBuilder, HardwarePluginError> {
        match &self.config {
            AuthConfig::None | AuthConfig::Mtls { .. } => Ok(request),
            AuthConfig::Basic { username, password } => {
                Ok(request.basic_auth(username, Some(password)))
            }
            AuthConfig::OAuth { .. } => {
                let token = self.bearer_token(http).await?;
                Ok(request.bearer_auth(token))
            }
        }
    }

    /// Drop a cached token so the next call fetches a new one (after a 401)
    pub(crate) async fn invalidate(&self) {
        *self.token.lock().await = None;
    }

    async fn bearer_token(&self, http: &Client) -> Result<String, HardwarePluginError> {
        let AuthConfig::OAuth {
            token_url,
            client_id,
            client_secret,
            scopes,
        } = &self.config
        else {
            return Err(HardwarePluginError::Authentication(
                "bearer token requested without OAuth configuration".to_string(),
            ));
        };

        let mut cached = self.token.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(now)) {
            return Ok(token.value.clone());
        }

        debug!("Fetching OAuth token from {}", token_url);
        let scope = scopes.join(" ");
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
        ];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        let response = http.post(token_url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HardwarePluginError::Authentication(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        let token: TokenResponse = response.json().await?;
        let expires_at = token
            .expires_in
            .map(|secs| now + ChronoDuration::seconds(secs - TOKEN_EXPIRY_SKEW_SECS));
        let value = token.access_token;
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at,
        });
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_token_freshness() {
        let now = Utc::now();
        let fresh = CachedToken {
            value: "a".to_string(),
            expires_at: Some(now + ChronoDuration::seconds(60)),
        };
        let stale = CachedToken {
            value: "b".to_string(),
            expires_at: Some(now - ChronoDuration::seconds(1)),
        };
        let no_expiry = CachedToken {
            value: "c".to_string(),
            expires_at: None,
        };
        assert!(fresh.is_fresh(now));
        assert!(!stale.is_fresh(now));
        assert!(no_expiry.is_fresh(now));
    }
}
