//! Cluster lifecycle CRD definitions
//!
//! Kubernetes Custom Resource Definitions for the provisioning controller.

pub mod allocated_node;
pub mod cluster_template;
pub mod condition;
pub mod provisioning_request;

pub use allocated_node::*;
pub use cluster_template::*;
pub use condition::*;
pub use provisioning_request::*;
