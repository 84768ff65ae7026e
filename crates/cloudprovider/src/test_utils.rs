//! Test utilities for unit testing plugins
//!
//! Builders for the pods and nodes the plugin tests feed into a
//! `MockClusterClient`.

use k8s_openapi::api::core::v1::{Container, Node, NodeAddress, NodeStatus, Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use network_api::{set_pod_annotation, NetworkConf, NETWORK_CONF_ANNOTATION, NETWORK_TYPE_ANNOTATION};

/// Pod in `default` with one `game` container, the network type and conf annotations set
pub fn test_pod(name: &str, network_type: &str, conf: &[(&str, &str)]) -> Pod {
    let mut pod = Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "game".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    };
    set_pod_annotation(&mut pod, NETWORK_TYPE_ANNOTATION, network_type.to_string());
    if !conf.is_empty() {
        let conf = NetworkConf::from_pairs(conf.iter().copied());
        set_pod_annotation(&mut pod, NETWORK_CONF_ANNOTATION, conf.to_annotation());
    }
    pod
}

/// Same pod, scheduled on `node` with a pod IP and a UID
pub fn scheduled(mut pod: Pod, node: &str, ip: &str, uid: &str) -> Pod {
    pod.metadata.uid = Some(uid.to_string());
    pod.spec.get_or_insert_with(Default::default).node_name = Some(node.to_string());
    pod.status = Some(PodStatus {
        pod_ip: Some(ip.to_string()),
        phase: Some("Running".to_string()),
        ..Default::default()
    });
    pod
}

/// Node with an InternalIP and optionally an ExternalIP
pub fn test_node(name: &str, external_ip: Option<&str>, internal_ip: &str) -> Node {
    let mut addresses = vec![NodeAddress {
        type_: "InternalIP".to_string(),
        address: internal_ip.to_string(),
    }];
    if let Some(ip) = external_ip {
        addresses.push(NodeAddress {
            type_: "ExternalIP".to_string(),
            address: ip.to_string(),
        });
    }
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: None,
        status: Some(NodeStatus {
            addresses: Some(addresses),
            ..Default::default()
        }),
    }
}
