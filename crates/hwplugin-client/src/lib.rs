//! Hardware Plugin API Client
//!
//! A Rust client for the hardware plugin provisioning API. Hardware plugins
//! own node inventory and fulfil node allocation requests asynchronously.
//!
//! # Example
//!
//! ```no_run
//! use hwplugin_client::{AuthConfig, HardwarePluginClient, HardwarePluginClientTrait, PluginClientConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HardwarePluginClient::new(PluginClientConfig {
//!     name: "loopback".to_string(),
//!     base_url: "https://loopback-plugin:8443".to_string(),
//!     auth: AuthConfig::Basic {
//!         username: "admin".to_string(),
//!         password: "secret".to_string(),
//!     },
//!     timeout: Duration::from_secs(30),
//! })?;
//!
//! // 404 on lookup means "not yet created"
//! if client.get_node_allocation_request("cluster-1").await?.is_none() {
//!     println!("allocation not submitted yet");
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod plugin_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use auth::AuthConfig;
pub use client::{HardwarePluginClient, PluginClientConfig};
pub use error::HardwarePluginError;
pub use models::*;
pub use plugin_trait::HardwarePluginClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockHardwarePluginClient;
