//! Shared fixtures for the integration tests

use cloudprovider::{
    AlibabaCloudOptions, CloudProviderConfig, Dispatcher, KubernetesOptions, PortPoolOptions,
    ProviderManager,
};
use cluster_client::MockClusterClient;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use network_api::{set_pod_annotation, NetworkConf, NETWORK_CONF_ANNOTATION, NETWORK_TYPE_ANNOTATION};
use std::sync::Arc;

pub fn pool(min: u16, max: u16) -> PortPoolOptions {
    PortPoolOptions {
        min_port: min,
        max_port: max,
        block_ports: vec![],
    }
}

pub fn config(host_ports: PortPoolOptions, slb: PortPoolOptions) -> CloudProviderConfig {
    CloudProviderConfig {
        kubernetes: KubernetesOptions {
            enable: true,
            host_port: host_ports,
        },
        alibabacloud: AlibabaCloudOptions { enable: true, slb },
    }
}

pub async fn dispatcher(client: &MockClusterClient, config: &CloudProviderConfig) -> Dispatcher {
    let manager = ProviderManager::from_config(config).expect("config registers");
    manager.init(client).await;
    Dispatcher::new(Arc::new(manager), Arc::new(client.clone()))
}

pub fn game_pod(name: &str, network_type: &str, conf: &[(&str, &str)]) -> Pod {
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
    let conf = NetworkConf::from_pairs(conf.iter().copied());
    set_pod_annotation(&mut pod, NETWORK_CONF_ANNOTATION, conf.to_annotation());
    pod
}
