//! ClusterClient trait for mocking
//!
//! This trait abstracts the Kubernetes calls the network plugins make.
//! `KubeClusterClient` implements it against a live API server, tests use
//! `MockClusterClient`.

use crate::error::ClusterError;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use std::collections::BTreeMap;
use std::fmt;

/// Kubernetes event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Informational event
    Normal,
    /// Something needs attention
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

/// Trait for the Kubernetes operations used by network plugins
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
/// Label selectors use the `key=value,key2=value2` equality form.
#[async_trait::async_trait]
pub trait ClusterClientTrait: Send + Sync {
    // Pods
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError>;
    async fn list_pods(&self, label_selector: Option<&str>) -> Result<Vec<Pod>, ClusterError>;
    async fn patch_pod_annotations(&self, namespace: &str, name: &str, annotations: &BTreeMap<String, String>) -> Result<Pod, ClusterError>;

    // Nodes
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;

    // Services
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError>;
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, ClusterError>;
    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service, ClusterError>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
    async fn list_services(&self, label_selector: &str) -> Result<Vec<Service>, ClusterError>;

    // Events
    async fn record_pod_event(&self, pod: &Pod, event_type: EventType, reason: &str, message: &str) -> Result<(), ClusterError>;
}
