//! Kubernetes-backed cluster client
//!
//! Implements `ClusterClientTrait` on top of `kube::Client`.

use crate::error::ClusterError;
use crate::cluster_trait::{ClusterClientTrait, EventType};
use k8s_openapi::api::core::v1::{Event, EventSource, Node, ObjectReference, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::debug;

/// Component name reported on recorded events
const EVENT_SOURCE: &str = "network-manager";

/// Cluster client talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    /// Restricts list calls to one namespace when set
    namespace: Option<String>,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    /// Create a client from an existing `kube::Client`
    ///
    /// # Arguments
    /// * `client` - Kubernetes client
    /// * `namespace` - Namespace list calls are scoped to (`None` = all namespaces)
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    /// Create a client from the in-cluster or kubeconfig environment.
    pub async fn try_default(namespace: Option<String>) -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }

    /// The underlying `kube::Client`
    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn scoped<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClientTrait for KubeClusterClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        self.pods(namespace)
            .get(name)
            .await
            .map_err(|e| ClusterError::from_kube(e, format!("pod {}/{}", namespace, name)))
    }

    async fn list_pods(&self, label_selector: Option<&str>) -> Result<Vec<Pod>, ClusterError> {
        let mut lp = ListParams::default();
        if let Some(selector) = label_selector {
            lp = lp.labels(selector);
        }
        let pods = self.scoped::<Pod>().list(&lp).await?;
        debug!("Listed {} pods", pods.items.len());
        Ok(pods.items)
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Pod, ClusterError> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": annotations
            }
        });
        self.pods(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ClusterError::from_kube(e, format!("pod {}/{}", namespace, name)))
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        Api::<Node>::all(self.client.clone())
            .get(name)
            .await
            .map_err(|e| ClusterError::from_kube(e, format!("node {}", name)))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError> {
        self.services(namespace)
            .get(name)
            .await
            .map_err(|e| ClusterError::from_kube(e, format!("service {}/{}", namespace, name)))
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, ClusterError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.services(namespace)
            .create(&PostParams::default(), service)
            .await
            .map_err(|e| ClusterError::from_kube(e, format!("service {}/{}", namespace, name)))
    }

    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service, ClusterError> {
        let name = service
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::InvalidRequest("service without name".to_string()))?;
        self.services(namespace)
            .replace(&name, &PostParams::default(), service)
            .await
            .map_err(|e| ClusterError::from_kube(e, format!("service {}/{}", namespace, name)))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.services(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| ClusterError::from_kube(e, format!("service {}/{}", namespace, name)))?;
        Ok(())
    }

    async fn list_services(&self, label_selector: &str) -> Result<Vec<Service>, ClusterError> {
        let services = self
            .scoped::<Service>()
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(services.items)
    }

    async fn record_pod_event(
        &self,
        pod: &Pod,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<(), ClusterError> {
        let namespace = pod.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        let pod_name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::InvalidRequest("pod without name".to_string()))?;

        let event = Event {
            metadata: ObjectMeta {
                name: Some(format!("{}.{}", pod_name, uuid::Uuid::new_v4().simple())),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Pod".to_string()),
                name: Some(pod_name),
                namespace: Some(namespace.clone()),
                uid: pod.metadata.uid.clone(),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some(event_type.to_string()),
            count: Some(1),
            source: Some(EventSource {
                component: Some(EVENT_SOURCE.to_string()),
                host: None,
            }),
            ..Default::default()
        };

        Api::<Event>::namespaced(self.client.clone(), &namespace)
            .create(&PostParams::default(), &event)
            .await?;
        Ok(())
    }
}
