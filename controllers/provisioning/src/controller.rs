//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the watchers,
//! the work queue, the reconcile workers and the callback server together
//! and drives them until a shutdown signal arrives.

use crate::callback::{self, CallbackState};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::queue::WorkQueue;
use crate::reconciler::{Reconciler, ReconcilerSettings};
use crate::store::{KubeStore, ProvisioningStore};
use crate::watcher::Watcher;
use crds::{ClusterTemplate, ProvisioningRequest};
use hwplugin_client::{HardwarePluginClient, HardwarePluginClientTrait};
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Run one worker: take keys until the queue shuts down
pub(crate) async fn run_worker(id: usize, queue: WorkQueue, reconciler: Arc<Reconciler>) {
    debug!("Worker {} started", id);
    while let Some(key) = queue.next().await {
        let action = reconciler.process(&key).await;
        queue.done(&key);
        if let Some(delay) = action.requeue_after {
            queue.add_after(key, delay);
        }
    }
    debug!("Worker {} stopped", id);
}

/// Main controller for cluster provisioning.
pub struct Controller {
    config: ControllerConfig,
    queue: WorkQueue,
    reconciler: Arc<Reconciler>,
    store: Arc<dyn ProvisioningStore>,
    watcher: Arc<Watcher>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing provisioning controller");

        let kube_client = Client::try_default().await?;

        let hw_client = HardwarePluginClient::new(config.plugin.clone())?;
        info!("Checking hardware plugin {} at {}", config.plugin.name, config.plugin.base_url);
        match hw_client.get_api_versions().await {
            Ok(versions) => info!(
                "Hardware plugin reachable (versions: {})",
                versions
                    .api_versions
                    .iter()
                    .filter_map(|v| v.version.as_deref())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            // Allocation calls retry with backoff, so an unreachable plugin
            // at startup is not fatal
            Err(e) => warn!("Hardware plugin not reachable yet: {}", e),
        }

        let store: Arc<dyn ProvisioningStore> =
            Arc::new(KubeStore::new(kube_client.clone(), config.watch_namespace.clone()));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::new(hw_client),
            ReconcilerSettings {
                call_timeout: config.call_timeout,
                plugin_namespace: config.plugin_namespace.clone(),
            },
        ));

        let (templates, requests): (Api<ClusterTemplate>, Api<ProvisioningRequest>) =
            match config.watch_namespace.as_deref() {
                Some(ns) => (
                    Api::namespaced(kube_client.clone(), ns),
                    Api::namespaced(kube_client, ns),
                ),
                None => (Api::all(kube_client.clone()), Api::all(kube_client)),
            };
        let queue = WorkQueue::new();
        let watcher = Arc::new(Watcher::new(templates, requests, queue.clone()));

        Ok(Self {
            config,
            queue,
            reconciler,
            store,
            watcher,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!(
            "Provisioning controller running with {} workers",
            self.config.worker_count
        );

        let mut workers = JoinSet::new();
        for id in 0..self.config.worker_count {
            workers.spawn(run_worker(id, self.queue.clone(), Arc::clone(&self.reconciler)));
        }

        let mut template_watcher: JoinHandle<Result<(), ControllerError>> = {
            let watcher = Arc::clone(&self.watcher);
            tokio::spawn(async move { watcher.watch_templates().await })
        };
        let mut request_watcher: JoinHandle<Result<(), ControllerError>> = {
            let watcher = Arc::clone(&self.watcher);
            tokio::spawn(async move { watcher.watch_requests().await })
        };

        let listener = tokio::net::TcpListener::bind(self.config.callback_addr)
            .await
            .map_err(|e| {
                ControllerError::Server(format!("failed to bind {}: {e}", self.config.callback_addr))
            })?;
        info!("Callback server listening on {}", self.config.callback_addr);
        let app = callback::router(Arc::new(CallbackState::new(
            Arc::clone(&self.store),
            self.queue.clone(),
        )));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await
                .map_err(|e| ControllerError::Server(e.to_string()))
        });

        let outcome = tokio::select! {
            () = shutdown_signal() => {
                info!("Shutdown signal received");
                Ok(())
            }
            result = &mut template_watcher => flatten("ClusterTemplate watcher", result),
            result = &mut request_watcher => flatten("ProvisioningRequest watcher", result),
            result = &mut server => flatten("Callback server", result),
        };

        let _ = stop_tx.send(());
        template_watcher.abort();
        request_watcher.abort();
        self.queue.shutdown();

        info!(
            "Draining {} in-flight passes (grace period {:?})",
            self.queue.in_flight(),
            self.config.shutdown_grace
        );
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Grace period elapsed; aborting remaining workers");
            workers.abort_all();
        }
        if tokio::time::timeout(self.config.shutdown_grace, &mut server)
            .await
            .is_err()
        {
            server.abort();
        }

        info!("Provisioning controller stopped");
        outcome
    }
}

fn flatten(
    what: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    let outcome = result
        .map_err(|e| ControllerError::Watch(format!("{what} panicked: {e}")))
        .and_then(|inner| inner);
    if let Err(e) = &outcome {
        error!("{} exited: {}", what, e);
    }
    outcome
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::WorkKey;
    use crate::store::memory::InMemoryStore;
    use crate::test_utils::create_test_reconciler;
    use hwplugin_client::MockHardwarePluginClient;
    use std::time::Duration;

    #[tokio::test]
    async fn test_worker_processes_keys_until_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = Arc::new(create_test_reconciler(
            store,
            Arc::new(MockHardwarePluginClient::new("mock")),
        ));
        let queue = WorkQueue::new();
        let worker = tokio::spawn(run_worker(0, queue.clone(), reconciler));

        // Missing objects just wait for the next change
        queue.add(WorkKey::request("default", "absent"));
        queue.add(WorkKey::template("default", "absent.v1"));
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.len() > 0 || queue.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        queue.shutdown();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
