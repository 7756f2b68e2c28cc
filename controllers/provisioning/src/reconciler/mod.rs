//! Reconciliation logic for provisioning resources.
//!
//! This module is organized by the stages a request moves through:
//! - `template`: ClusterTemplate validation, immutability and deletion
//! - `request`: the ProvisioningRequest state machine
//! - `render`, `resources`, `hardware`, `compliance`: the request pipeline stages
//! - `merge`, `schema`, `duration`, `release`: pure helpers

pub mod compliance;
pub mod duration;
pub mod hardware;
pub mod merge;
pub mod release;
pub mod render;
pub mod request;
pub mod resources;
pub mod schema;
pub mod template;

#[cfg(test)]
mod merge_test;
#[cfg(test)]
mod render_test;

use crate::backoff::FibonacciBackoff;
use crate::error::{ControllerError, ErrorClass};
use crate::queue::{WorkKey, WorkKind};
use crate::store::ProvisioningStore;
use hwplugin_client::HardwarePluginClientTrait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Requeue while waiting on hardware
pub const SHORT_REQUEUE: Duration = Duration::from_secs(15);
/// Requeue while waiting on installation or compliance
pub const MEDIUM_REQUEUE: Duration = Duration::from_secs(60);
/// Requeue after input errors and in steady state
pub const LONG_REQUEUE: Duration = Duration::from_secs(5 * 60);
/// Requeue after fatal errors
pub const FATAL_REQUEUE: Duration = Duration::from_secs(10 * 60);
/// Consecutive transient failures before falling back to the long requeue
pub const MAX_TRANSIENT_FAILURES: u32 = 8;
/// Attempts for an optimistic read-modify-write of a status
pub const MAX_STATUS_ATTEMPTS: usize = 5;

/// What the work loop should do with a key after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileAction {
    /// Re-run the key after this delay; `None` waits for the next change
    pub requeue_after: Option<Duration>,
}

impl ReconcileAction {
    #[must_use]
    pub fn requeue(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    #[must_use]
    pub fn await_change() -> Self {
        Self { requeue_after: None }
    }
}

/// Outcome of one request pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Stage is done; run the next one
    Continue,
    /// Stop this pass and requeue as given
    Stop(ReconcileAction),
}

/// Tunables the reconciler needs from the controller configuration
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Deadline for a single backend call
    pub call_timeout: Duration,
    /// Namespace holding the plugin's BMC secrets and AllocatedNode mirrors
    pub plugin_namespace: String,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            plugin_namespace: "hwplugins".to_string(),
        }
    }
}

/// Backoff state for a key
#[derive(Debug, Clone, Default)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

/// Reconciles ClusterTemplates and ProvisioningRequests.
pub struct Reconciler {
    pub(crate) store: Arc<dyn ProvisioningStore>,
    pub(crate) hw_client: Arc<dyn HardwarePluginClientTrait>,
    pub(crate) settings: ReconcilerSettings,
    /// Error count tracking per key
    backoff_states: Arc<Mutex<HashMap<WorkKey, BackoffState>>>,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        store: Arc<dyn ProvisioningStore>,
        hw_client: Arc<dyn HardwarePluginClientTrait>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            hw_client,
            settings,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run one pass for a key and decide when it runs next.
    ///
    /// Errors never escape: they are logged and turned into a requeue delay
    /// chosen by their class.
    pub async fn process(&self, key: &WorkKey) -> ReconcileAction {
        let result = match key.kind {
            WorkKind::Template => self.reconcile_template(&key.namespace, &key.name).await,
            WorkKind::Request => self.reconcile_request(&key.namespace, &key.name).await,
        };
        match result {
            Ok(action) => {
                self.reset_backoff(key);
                action
            }
            Err(e) => self.error_action(key, &e),
        }
    }

    fn error_action(&self, key: &WorkKey, error: &ControllerError) -> ReconcileAction {
        match error.class() {
            ErrorClass::Input => {
                warn!("{} needs user correction: {}", key, error);
                self.reset_backoff(key);
                ReconcileAction::requeue(LONG_REQUEUE)
            }
            ErrorClass::Transient | ErrorClass::Conflict => {
                let mut states = self.backoff_states.lock().unwrap_or_else(PoisonError::into_inner);
                let state = states.entry(key.clone()).or_default();
                state.error_count += 1;
                if state.error_count > MAX_TRANSIENT_FAILURES {
                    warn!(
                        "{} failed {} times in a row, backing off to {:?}: {}",
                        key, state.error_count, LONG_REQUEUE, error
                    );
                    return ReconcileAction::requeue(LONG_REQUEUE);
                }
                let delay = state.backoff.next_backoff();
                debug!(
                    "{} transient failure #{} (retry in {:?}): {}",
                    key, state.error_count, delay, error
                );
                ReconcileAction::requeue(delay)
            }
            ErrorClass::Fatal => {
                error!("{} hit a fatal error: {}", key, error);
                ReconcileAction::requeue(FATAL_REQUEUE)
            }
        }
    }

    fn reset_backoff(&self, key: &WorkKey) {
        self.backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Consecutive transient failures recorded for a key
    #[cfg(test)]
    pub(crate) fn error_count(&self, key: &WorkKey) -> u32 {
        self.backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, |s| s.error_count)
    }

    /// Run a backend call under the per-call deadline.
    ///
    /// An elapsed deadline becomes a transient `Timeout` error.
    pub(crate) async fn call<T, E, F>(&self, what: &str, fut: F) -> Result<T, ControllerError>
    where
        F: Future<Output = Result<T, E>>,
        ControllerError: From<E>,
    {
        match tokio::time::timeout(self.settings.call_timeout, fut).await {
            Ok(result) => result.map_err(ControllerError::from),
            Err(_) => Err(ControllerError::Timeout(format!(
                "{what} did not complete within {:?}",
                self.settings.call_timeout
            ))),
        }
    }
}

/// Parse a YAML document stored under `key` of a ConfigMap into a mapping
pub(crate) fn parse_yaml_map(
    doc: &crate::store::ConfigDocument,
    key: &str,
) -> Result<serde_json::Value, String> {
    let raw = doc
        .data
        .get(key)
        .ok_or_else(|| format!("the ConfigMap {} does not contain the key {key}", doc.name))?;
    let value: serde_json::Value = serde_yaml::from_str(raw).map_err(|e| {
        format!("the value of key {key} from ConfigMap {} is not in a valid YAML string: {e}", doc.name)
    })?;
    if !value.is_object() {
        return Err(format!(
            "the value of key {key} from ConfigMap {} is not a YAML mapping",
            doc.name
        ));
    }
    Ok(value)
}
