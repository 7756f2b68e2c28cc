//! Controller configuration from environment variables.

use crate::error::ControllerError;
use hwplugin_client::{AuthConfig, PluginClientConfig};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_CALLBACK_ADDR: &str = "0.0.0.0:8090";
const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const DEFAULT_PLUGIN_NAMESPACE: &str = "hwplugins";
const DEFAULT_PLUGIN_NAME: &str = "hwplugin";

/// Runtime settings for the provisioning controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch; all namespaces when unset
    pub watch_namespace: Option<String>,
    /// Hardware plugin connection
    pub plugin: PluginClientConfig,
    /// Namespace holding the plugin's BMC credential secrets
    pub plugin_namespace: String,
    /// Callback listener address
    pub callback_addr: SocketAddr,
    /// Number of reconcile workers
    pub worker_count: usize,
    /// Deadline for a single backend call
    pub call_timeout: Duration,
    /// How long shutdown waits for in-flight passes
    pub shutdown_grace: Duration,
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| {
                ControllerError::InvalidConfig(format!("{key} environment variable is required"))
            })
        };

        let base_url = required("HWPLUGIN_URL")?;
        let auth = match get("HWPLUGIN_AUTH").as_deref().unwrap_or("none") {
            "none" => AuthConfig::None,
            "basic" => AuthConfig::Basic {
                username: required("HWPLUGIN_USERNAME")?,
                password: required("HWPLUGIN_PASSWORD")?,
            },
            "oauth" => AuthConfig::OAuth {
                token_url: required("HWPLUGIN_OAUTH_TOKEN_URL")?,
                client_id: required("HWPLUGIN_OAUTH_CLIENT_ID")?,
                client_secret: required("HWPLUGIN_OAUTH_CLIENT_SECRET")?,
                scopes: get("HWPLUGIN_OAUTH_SCOPES")
                    .map(|s| {
                        s.split([',', ' '])
                            .filter(|scope| !scope.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            "mtls" => {
                let mut identity_pem = read_pem(&required("HWPLUGIN_CLIENT_CERT")?)?;
                identity_pem.extend(read_pem(&required("HWPLUGIN_CLIENT_KEY")?)?);
                let ca_pem = get("HWPLUGIN_CA_CERT").map(|p| read_pem(&p)).transpose()?;
                AuthConfig::Mtls { identity_pem, ca_pem }
            }
            other => {
                return Err(ControllerError::InvalidConfig(format!(
                    "HWPLUGIN_AUTH must be one of none, basic, oauth, mtls (got {other})"
                )));
            }
        };

        let call_timeout = Duration::from_secs(parse_number(
            get("CALL_TIMEOUT_SECS"),
            "CALL_TIMEOUT_SECS",
            DEFAULT_CALL_TIMEOUT_SECS,
        )?);

        let callback_addr = get("CALLBACK_ADDR")
            .as_deref()
            .unwrap_or(DEFAULT_CALLBACK_ADDR)
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("CALLBACK_ADDR: {e}")))?;

        let worker_count = parse_number(get("WORKER_COUNT"), "WORKER_COUNT", DEFAULT_WORKER_COUNT)?;
        if worker_count == 0 {
            return Err(ControllerError::InvalidConfig(
                "WORKER_COUNT must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            watch_namespace: get("WATCH_NAMESPACE"),
            plugin: PluginClientConfig {
                name: get("HWPLUGIN_NAME").unwrap_or_else(|| DEFAULT_PLUGIN_NAME.to_string()),
                base_url,
                auth,
                timeout: call_timeout,
            },
            plugin_namespace: get("HWPLUGIN_NAMESPACE")
                .unwrap_or_else(|| DEFAULT_PLUGIN_NAMESPACE.to_string()),
            callback_addr,
            worker_count,
            call_timeout,
            shutdown_grace: Duration::from_secs(parse_number(
                get("SHUTDOWN_GRACE_SECS"),
                "SHUTDOWN_GRACE_SECS",
                DEFAULT_SHUTDOWN_GRACE_SECS,
            )?),
        })
    }
}

fn parse_number<T: std::str::FromStr>(
    value: Option<String>,
    key: &str,
    default: T,
) -> Result<T, ControllerError>
where
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{key}: {e}"))),
        None => Ok(default),
    }
}

fn read_pem(path: &str) -> Result<Vec<u8>, ControllerError> {
    std::fs::read(path)
        .map_err(|e| ControllerError::InvalidConfig(format!("failed to read {path}: {e}")))
}
