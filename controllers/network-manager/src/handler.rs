//! Pod event handling.
//!
//! Turns watch events into admission operations and writes the resulting
//! annotations back onto the pod. Only annotations are patched: spec fields a
//! plugin sets on create (host ports) only take effect when the same plugin
//! runs at admission time, and a status derived from them is observed again
//! without them before it is written.

use cloudprovider::{AdmissionOperation, DispatchOutcome, Dispatcher};
use cluster_client::{ClusterClientTrait, ClusterError};
use k8s_openapi::api::core::v1::Pod;
use network_api::{network_type, pod_annotation, pod_key, NETWORK_STATUS_ANNOTATION};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Operation a live pod maps to, `None` while it is terminating.
///
/// A pod without a network status has not been through its plugin yet.
pub fn operation_for(pod: &Pod) -> Option<AdmissionOperation> {
    if pod.metadata.deletion_timestamp.is_some() {
        return None;
    }
    match pod_annotation(pod, NETWORK_STATUS_ANNOTATION) {
        Some(_) => Some(AdmissionOperation::Update),
        None => Some(AdmissionOperation::Create),
    }
}

/// Annotations `mutated` adds or changes compared to `original`
pub fn changed_annotations(original: &Pod, mutated: &Pod) -> BTreeMap<String, String> {
    let before = original.metadata.annotations.as_ref();
    mutated
        .metadata
        .annotations
        .iter()
        .flatten()
        .filter(|(k, v)| before.and_then(|b| b.get(*k)) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Runs the plugin of each pod event and persists the outcome.
#[derive(Clone)]
pub struct PodHandler {
    dispatcher: Dispatcher,
    client: Arc<dyn ClusterClientTrait>,
}

impl std::fmt::Debug for PodHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodHandler")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl PodHandler {
    /// Create a handler writing through `client`.
    pub fn new(dispatcher: Dispatcher, client: Arc<dyn ClusterClientTrait>) -> Self {
        Self { dispatcher, client }
    }

    /// Handle a pod that was created or changed.
    ///
    /// Returns whether the pod was patched.
    pub async fn on_applied(&self, pod: &Pod) -> Result<bool, ClusterError> {
        if network_type(pod).is_none() {
            return Ok(false);
        }
        let Some(operation) = operation_for(pod) else {
            debug!("Pod {} is terminating, waiting for its deletion", pod_key(pod));
            return Ok(false);
        };

        let mutated = match self.dispatcher.dispatch(operation, pod).await {
            DispatchOutcome::Mutated(mutated) => mutated,
            DispatchOutcome::TimedOut => {
                warn!("Plugin for pod {} timed out, retrying on the next event", pod_key(pod));
                return Ok(false);
            }
            _ => return Ok(false),
        };
        let Some(mutated) = self.without_spec_changes(pod, mutated).await else {
            return Ok(false);
        };

        let changed = changed_annotations(pod, &mutated);
        if changed.is_empty() {
            return Ok(false);
        }

        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        self.client.patch_pod_annotations(namespace, name, &changed).await?;
        info!(
            "Patched {} annotation(s) on pod {}",
            changed.len(),
            pod_key(pod)
        );
        Ok(true)
    }

    /// Spec changes made by a plugin are dropped by the annotation patch, so
    /// the network status is observed again on the pod as it will be stored.
    async fn without_spec_changes(&self, pod: &Pod, mutated: Box<Pod>) -> Option<Box<Pod>> {
        if mutated.spec == pod.spec {
            return Some(mutated);
        }
        warn!(
            "Plugin changed the spec of running pod {}, only its annotations are kept",
            pod_key(pod)
        );

        let mut stored = pod.clone();
        stored.metadata.annotations = mutated.metadata.annotations;
        match self.dispatcher.dispatch(AdmissionOperation::Update, &stored).await {
            DispatchOutcome::Mutated(settled) => Some(settled),
            DispatchOutcome::Unchanged => Some(Box::new(stored)),
            _ => None,
        }
    }

    /// Handle a pod that is gone.
    pub async fn on_deleted(&self, pod: &Pod) {
        if network_type(pod).is_none() {
            return;
        }
        match self.dispatcher.dispatch(AdmissionOperation::Delete, pod).await {
            DispatchOutcome::Failed(e) => {
                warn!("Releasing network of pod {} failed: {}", pod_key(pod), e);
            }
            _ => debug!("Released network of pod {}", pod_key(pod)),
        }
    }
}
