//! Kubernetes resource watchers.
//!
//! Watch streams feed the shared work queue; reconciliation itself runs on
//! the worker pool. Status-only updates are filtered out so the controller's
//! own writes do not retrigger passes.

use crate::error::ControllerError;
use crate::queue::{WorkKey, WorkQueue};
use crds::{ClusterTemplate, ProvisioningRequest};
use futures::{Stream, StreamExt};
use kube::{Api, Resource, ResourceExt};
use kube_runtime::watcher::{self, Event};
use kube_runtime::WatchStreamExt;
use std::collections::HashMap;
use tracing::{debug, error, info};

/// Fields whose change warrants a new pass
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    generation: Option<i64>,
    deleting: bool,
    finalizers: Vec<String>,
}

impl Fingerprint {
    fn of<K: Resource>(object: &K) -> Self {
        let meta = object.meta();
        Self {
            generation: meta.generation,
            deleting: meta.deletion_timestamp.is_some(),
            finalizers: meta.finalizers.clone().unwrap_or_default(),
        }
    }
}

/// Remembers what each object looked like when it was last enqueued
#[derive(Debug, Default)]
struct ChangeFilter {
    seen: HashMap<(String, String), Fingerprint>,
}

impl ChangeFilter {
    fn changed<K: Resource>(&mut self, object: &K) -> bool {
        let key = (object.namespace().unwrap_or_default(), object.name_any());
        let fingerprint = Fingerprint::of(object);
        if self.seen.get(&key) == Some(&fingerprint) {
            return false;
        }
        self.seen.insert(key, fingerprint);
        true
    }

    fn forget<K: Resource>(&mut self, object: &K) {
        self.seen
            .remove(&(object.namespace().unwrap_or_default(), object.name_any()));
    }
}

/// Watches ClusterTemplates and ProvisioningRequests
pub struct Watcher {
    templates: Api<ClusterTemplate>,
    requests: Api<ProvisioningRequest>,
    queue: WorkQueue,
}

impl Watcher {
    pub fn new(
        templates: Api<ClusterTemplate>,
        requests: Api<ProvisioningRequest>,
        queue: WorkQueue,
    ) -> Self {
        Self {
            templates,
            requests,
            queue,
        }
    }

    fn events<K>(api: Api<K>) -> impl Stream<Item = Result<Event<K>, watcher::Error>> + Send
    where
        K: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + 'static,
        K::DynamicType: Default,
    {
        watcher::watcher(api, watcher::Config::default()).default_backoff()
    }

    /// Enqueue requests on spec, deletion or finalizer changes
    pub async fn watch_requests(&self) -> Result<(), ControllerError> {
        info!("Starting ProvisioningRequest watcher");
        let mut filter = ChangeFilter::default();
        let mut stream = Box::pin(Self::events(self.requests.clone()));
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(request) | Event::InitApply(request)) => {
                    if filter.changed(&request) {
                        self.queue.add(WorkKey::request(
                            request.namespace().unwrap_or_default(),
                            request.name_any(),
                        ));
                    }
                }
                Ok(Event::Delete(request)) => {
                    debug!("ProvisioningRequest {} deleted", request.name_any());
                    filter.forget(&request);
                }
                Ok(Event::Init | Event::InitDone) => {}
                Err(e) => error!("ProvisioningRequest watch error: {}", e),
            }
        }
        Err(ControllerError::Watch(
            "ProvisioningRequest watch stream ended".to_string(),
        ))
    }

    /// Enqueue templates on change, plus every request that references them
    pub async fn watch_templates(&self) -> Result<(), ControllerError> {
        info!("Starting ClusterTemplate watcher");
        let mut filter = ChangeFilter::default();
        let mut stream = Box::pin(Self::events(self.templates.clone()));
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(template) | Event::InitApply(template)) => {
                    let namespace = template.namespace().unwrap_or_default();
                    if filter.changed(&template) {
                        self.queue
                            .add(WorkKey::template(namespace.clone(), template.name_any()));
                    }
                    // Validation status lives in status, so referencing
                    // requests follow every template event.
                    self.enqueue_referencing_requests(&template.canonical_name())
                        .await;
                }
                Ok(Event::Delete(template)) => {
                    debug!("ClusterTemplate {} deleted", template.name_any());
                    filter.forget(&template);
                }
                Ok(Event::Init | Event::InitDone) => {}
                Err(e) => error!("ClusterTemplate watch error: {}", e),
            }
        }
        Err(ControllerError::Watch(
            "ClusterTemplate watch stream ended".to_string(),
        ))
    }

    async fn enqueue_referencing_requests(&self, canonical: &str) {
        match self.requests.list(&Default::default()).await {
            Ok(list) => {
                for request in list
                    .items
                    .iter()
                    .filter(|r| r.spec.template_ref() == canonical)
                {
                    self.queue.add(WorkKey::request(
                        request.namespace().unwrap_or_default(),
                        request.name_any(),
                    ));
                }
            }
            Err(e) => error!(
                "Failed to list ProvisioningRequests for ClusterTemplate {}: {}",
                canonical, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_request, create_test_template};

    #[test]
    fn test_status_only_changes_are_filtered() {
        let mut filter = ChangeFilter::default();
        let mut request = create_test_request("default", "cluster-1", "sno", "v1", "cluster-1");
        request.metadata.generation = Some(1);
        assert!(filter.changed(&request));

        request.status = Some(crds::ProvisioningRequestStatus::default());
        assert!(!filter.changed(&request));

        request.metadata.generation = Some(2);
        assert!(filter.changed(&request));

        request.metadata.finalizers = Some(vec!["x".to_string()]);
        assert!(filter.changed(&request));
    }

    #[test]
    fn test_forgotten_objects_are_seen_again() {
        let mut filter = ChangeFilter::default();
        let template = create_test_template("default", "sno", "v1");
        assert!(filter.changed(&template));
        assert!(!filter.changed(&template));
        filter.forget(&template);
        assert!(filter.changed(&template));
    }
}
