//! Pod and node operations for MockClusterClient

use super::MockClusterClient;
use crate::error::ClusterError;
use crate::selector_matches;
use k8s_openapi::api::core::v1::{Node, Pod};
use std::collections::BTreeMap;

pub fn get_pod(client: &MockClusterClient, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
    client.enter("get_pod")?;
    client
        .pods
        .lock()
        .unwrap()
        .get(&(namespace.to_string(), name.to_string()))
        .cloned()
        .ok_or_else(|| ClusterError::NotFound(format!("pod {}/{}", namespace, name)))
}

pub fn list_pods(client: &MockClusterClient, label_selector: Option<&str>) -> Result<Vec<Pod>, ClusterError> {
    client.enter("list_pods")?;
    let selector = label_selector.unwrap_or_default();
    let mut pods: Vec<Pod> = client
        .pods
        .lock()
        .unwrap()
        .values()
        .filter(|p| selector_matches(p.metadata.labels.as_ref(), selector))
        .cloned()
        .collect();
    pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    Ok(pods)
}

pub fn patch_pod_annotations(
    client: &MockClusterClient,
    namespace: &str,
    name: &str,
    annotations: &BTreeMap<String, String>,
) -> Result<Pod, ClusterError> {
    client.enter("patch_pod_annotations")?;
    let mut pods = client.pods.lock().unwrap();
    let pod = pods
        .get_mut(&(namespace.to_string(), name.to_string()))
        .ok_or_else(|| ClusterError::NotFound(format!("pod {}/{}", namespace, name)))?;
    pod.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(pod.clone())
}

pub fn get_node(client: &MockClusterClient, name: &str) -> Result<Node, ClusterError> {
    client.enter("get_node")?;
    client
        .nodes
        .lock()
        .unwrap()
        .get(name)
        .cloned()
        .ok_or_else(|| ClusterError::NotFound(format!("node {}", name)))
}
