//! Mock ClusterClient for unit testing
//!
//! This module provides an in-memory implementation of `ClusterClientTrait`
//! that can be used in unit tests without a running API server.
//!
//! The mock is organized by object kind:
//! - `pods.rs` - pods and nodes
//! - `services.rs` - services, including fake node-port and load-balancer assignment
//!
//! Any operation can be made to fail with [`MockClusterClient::fail_operation`]
//! and every call is counted, so tests can assert idempotency.

mod pods;
mod services;

use crate::cluster_trait::{ClusterClientTrait, EventType};
use crate::error::ClusterError;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// An event recorded through the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// `namespace/name` of the pod
    pub pod: String,
    /// Event type
    pub event_type: EventType,
    /// Short machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

/// Mock ClusterClient for testing
///
/// Clones share the same in-memory state.
#[derive(Clone, Default)]
pub struct MockClusterClient {
    pub(crate) pods: Arc<Mutex<HashMap<(String, String), Pod>>>,
    pub(crate) nodes: Arc<Mutex<HashMap<String, Node>>>,
    pub(crate) services: Arc<Mutex<HashMap<(String, String), Service>>>,
    pub(crate) events: Arc<Mutex<Vec<RecordedEvent>>>,
    pub(crate) failures: Arc<Mutex<HashSet<String>>>,
    pub(crate) calls: Arc<Mutex<HashMap<String, usize>>>,
    // Counter for fake node ports and uids
    pub(crate) next_id: Arc<Mutex<u32>>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient").finish_non_exhaustive()
    }
}

impl MockClusterClient {
    /// Create an empty mock cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pod to the mock store (for test setup)
    pub fn add_pod(&self, pod: Pod) {
        let key = object_key(&pod.metadata);
        self.pods.lock().unwrap().insert(key, pod);
    }

    /// Remove a pod from the mock store
    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Add a node to the mock store (for test setup)
    pub fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.nodes.lock().unwrap().insert(name, node);
    }

    /// Current copy of a service
    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.services
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// All stored services
    pub fn services(&self) -> Vec<Service> {
        self.services.lock().unwrap().values().cloned().collect()
    }

    /// Add a service directly, bypassing create semantics
    pub fn add_service(&self, service: Service) {
        let key = object_key(&service.metadata);
        self.services.lock().unwrap().insert(key, service);
    }

    /// Delete a service out-of-band (simulates an operator or cloud removing it)
    pub fn remove_service(&self, namespace: &str, name: &str) {
        self.services
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Simulate the cloud controller publishing a load-balancer address
    pub fn set_load_balancer_ingress(&self, namespace: &str, name: &str, ip: &str) {
        services::set_ingress(self, namespace, name, ip);
    }

    /// Recorded events, oldest first
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Make every call to `operation` fail until cleared
    pub fn fail_operation(&self, operation: &str) {
        self.failures.lock().unwrap().insert(operation.to_string());
    }

    /// Clear all injected failures
    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    /// How many times `operation` was called
    pub fn call_count(&self, operation: &str) -> usize {
        self.calls.lock().unwrap().get(operation).copied().unwrap_or(0)
    }

    /// Count the call and return the injected failure, if any
    pub(crate) fn enter(&self, operation: &str) -> Result<(), ClusterError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_insert(0) += 1;
        if self.failures.lock().unwrap().contains(operation) {
            return Err(ClusterError::InvalidRequest(format!(
                "injected failure: {}",
                operation
            )));
        }
        Ok(())
    }

    /// Generate next ID
    pub(crate) fn next_id(&self) -> u32 {
        let mut id = self.next_id.lock().unwrap();
        *id += 1;
        *id
    }
}

pub(crate) fn object_key(
    meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
        meta.name.clone().unwrap_or_default(),
    )
}

#[async_trait::async_trait]
impl ClusterClientTrait for MockClusterClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        pods::get_pod(self, namespace, name)
    }

    async fn list_pods(&self, label_selector: Option<&str>) -> Result<Vec<Pod>, ClusterError> {
        pods::list_pods(self, label_selector)
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Pod, ClusterError> {
        pods::patch_pod_annotations(self, namespace, name, annotations)
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        pods::get_node(self, name)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError> {
        services::get_service(self, namespace, name)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, ClusterError> {
        services::create_service(self, namespace, service)
    }

    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service, ClusterError> {
        services::replace_service(self, namespace, service)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        services::delete_service(self, namespace, name)
    }

    async fn list_services(&self, label_selector: &str) -> Result<Vec<Service>, ClusterError> {
        services::list_services(self, label_selector)
    }

    async fn record_pod_event(
        &self,
        pod: &Pod,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<(), ClusterError> {
        self.enter("record_pod_event")?;
        let (namespace, name) = object_key(&pod.metadata);
        self.events.lock().unwrap().push(RecordedEvent {
            pod: format!("{}/{}", namespace, name),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}
