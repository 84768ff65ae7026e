//! Kubernetes-NodePort plugin.
//!
//! One `NodePort` Service per pod. The API server picks the node ports, so
//! there is nothing to cache; the Service is the allocation.

use crate::config::CloudProviderOptions;
use crate::context::PluginContext;
use crate::errors::PluginError;
use crate::plugin::Plugin;
use crate::plugins::{
    apply_service, build_service, confirm_deletion, delete_pod_service, internal_addresses,
    lookup_node_address, service_port, service_port_protocol, DeletionCheck, PORT_PROTOCOLS_PARAM,
};
use crate::status::{converge, Observation};
use async_trait::async_trait;
use cluster_client::ClusterClientTrait;
use k8s_openapi::api::core::v1::{Pod, Service};
use network_api::{
    network_disabled, parse_port_protocols, pod_key, NetworkAddress, NetworkConf, NetworkPort,
    NetworkState, NetworkStatus, PortProtocol,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Network type
pub const NODE_PORT_PLUGIN: &str = "Kubernetes-NodePort";

/// Node port plugin
#[derive(Debug, Default)]
pub struct NodePortPlugin;

impl NodePortPlugin {
    /// New plugin.
    pub fn new() -> Self {
        Self
    }

    async fn sync(
        &self,
        client: &dyn ClusterClientTrait,
        mut pod: Pod,
        ctx: &PluginContext,
    ) -> Result<Pod, PluginError> {
        let conf = NetworkConf::from_pod(&pod)?;
        let ports = parse_port_protocols(conf.require(PORT_PROTOCOLS_PARAM)?)?;

        let desired = build_service(
            &pod,
            NODE_PORT_PLUGIN,
            "NodePort",
            ports
                .iter()
                .map(|p| service_port(p.port, p.port, p.protocol))
                .collect(),
            BTreeMap::new(),
        )?;

        ctx.ensure_active("service apply")?;
        let (svc, created) = apply_service(client, desired).await?;

        let was_ready = NetworkStatus::from_pod(&pod)
            .is_some_and(|s| s.current_network_state == NetworkState::Ready);
        let observation = if network_disabled(&pod) {
            Observation::Disabled
        } else if created && was_ready {
            info!("Service of pod {} had disappeared, recreated it", pod_key(&pod));
            Observation::Lost
        } else {
            observe(client, &pod, &svc, &ports, ctx).await?
        };

        let state = converge(&mut pod, observation);
        debug!("Pod {} network is {}", pod_key(&pod), state);
        Ok(pod)
    }
}

async fn observe(
    client: &dyn ClusterClientTrait,
    pod: &Pod,
    svc: &Service,
    ports: &[PortProtocol],
    ctx: &PluginContext,
) -> Result<Observation, PluginError> {
    let node_ports: Option<Vec<NetworkPort>> = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|svc_ports| {
            svc_ports
                .iter()
                .map(|p| {
                    let node_port = u16::try_from(p.node_port?).ok()?;
                    Some(NetworkPort::new(node_port, service_port_protocol(p)))
                })
                .collect()
        });

    let node = pod.spec.as_ref().and_then(|s| s.node_name.clone());
    let (Some(node_ports), Some(node)) = (node_ports, node) else {
        return Ok(Observation::Pending);
    };

    ctx.ensure_active("node lookup")?;
    let Some(node_ip) = lookup_node_address(client, &node).await? else {
        return Ok(Observation::Pending);
    };

    Ok(Observation::Ready {
        internal: internal_addresses(pod, ports),
        external: vec![NetworkAddress {
            ip: node_ip,
            ports: node_ports,
            end_point: None,
        }],
    })
}

#[async_trait]
impl Plugin for NodePortPlugin {
    fn name(&self) -> &str {
        NODE_PORT_PLUGIN
    }

    fn alias(&self) -> &str {
        "nodeport"
    }

    async fn init(
        &self,
        _client: &dyn ClusterClientTrait,
        options: &CloudProviderOptions,
        _ctx: &PluginContext,
    ) -> Result<(), PluginError> {
        match options {
            CloudProviderOptions::Kubernetes(_) => Ok(()),
            _ => Err(PluginError::Parameter(format!(
                "{} needs Kubernetes provider options",
                NODE_PORT_PLUGIN
            ))),
        }
    }

    async fn on_pod_added(
        &self,
        client: &dyn ClusterClientTrait,
        pod: Pod,
        ctx: &PluginContext,
    ) -> Result<Pod, PluginError> {
        self.sync(client, pod, ctx).await
    }

    async fn on_pod_updated(
        &self,
        client: &dyn ClusterClientTrait,
        pod: Pod,
        ctx: &PluginContext,
    ) -> Result<Pod, PluginError> {
        self.sync(client, pod, ctx).await
    }

    async fn on_pod_deleted(
        &self,
        client: &dyn ClusterClientTrait,
        pod: &Pod,
        _ctx: &PluginContext,
    ) -> Result<(), PluginError> {
        if confirm_deletion(client, pod).await? == DeletionCheck::Replaced {
            info!("Pod {} was recreated, keeping its service", pod_key(pod));
            return Ok(());
        }
        delete_pod_service(client, pod).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::plugins::DISABLED_SELECTOR_LABEL;
    use crate::test_utils::{scheduled, test_node, test_pod};
    use cluster_client::MockClusterClient;
    use network_api::{set_pod_annotation, NETWORK_DISABLED_ANNOTATION};

    fn pod() -> Pod {
        test_pod("gs-0", NODE_PORT_PLUGIN, &[(PORT_PROTOCOLS_PARAM, "7777/UDP,8080")])
    }

    fn state(pod: &Pod) -> NetworkState {
        NetworkStatus::from_pod(pod).unwrap().current_network_state
    }

    #[tokio::test]
    async fn test_add_creates_one_service() {
        let client = MockClusterClient::new();
        let ctx = PluginContext::background();
        let plugin = NodePortPlugin::new();

        let first = plugin.on_pod_added(&client, pod(), &ctx).await.unwrap();
        plugin.on_pod_added(&client, pod(), &ctx).await.unwrap();

        assert_eq!(client.services().len(), 1);
        assert_eq!(client.call_count("create_service"), 1);
        assert_eq!(state(&first), NetworkState::Waiting);

        let svc = client.service("default", "gs-0").unwrap();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(spec.ports.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ready_when_scheduled() {
        let client = MockClusterClient::new();
        client.add_node(test_node("node-a", None, "192.168.0.7"));
        let ctx = PluginContext::background();
        let plugin = NodePortPlugin::new();

        let admitted = plugin.on_pod_added(&client, pod(), &ctx).await.unwrap();
        let running = scheduled(admitted, "node-a", "10.0.0.5", "uid-1");
        let updated = plugin.on_pod_updated(&client, running, &ctx).await.unwrap();

        let status = NetworkStatus::from_pod(&updated).unwrap();
        assert_eq!(status.current_network_state, NetworkState::Ready);
        assert_eq!(status.external_addresses[0].ip, "192.168.0.7");
        assert_eq!(status.external_addresses[0].ports.len(), 2);
        assert_eq!(status.internal_addresses[0].ip, "10.0.0.5");
    }

    #[tokio::test]
    async fn test_disable_and_lost_service() {
        let client = MockClusterClient::new();
        client.add_node(test_node("node-a", None, "192.168.0.7"));
        let ctx = PluginContext::background();
        let plugin = NodePortPlugin::new();

        let pod = scheduled(pod(), "node-a", "10.0.0.5", "uid-1");
        let ready = plugin.on_pod_added(&client, pod, &ctx).await.unwrap();
        assert_eq!(state(&ready), NetworkState::Ready);

        let mut disabled = ready.clone();
        set_pod_annotation(&mut disabled, NETWORK_DISABLED_ANNOTATION, "true".to_string());
        let disabled = plugin.on_pod_updated(&client, disabled, &ctx).await.unwrap();
        assert_eq!(state(&disabled), NetworkState::NotReady);
        let selector = client.service("default", "gs-0").unwrap().spec.unwrap().selector.unwrap();
        assert!(selector.contains_key(DISABLED_SELECTOR_LABEL));

        client.remove_service("default", "gs-0");
        let recovered = plugin.on_pod_updated(&client, ready, &ctx).await.unwrap();
        assert_eq!(state(&recovered), NetworkState::Waiting);
        assert!(client.service("default", "gs-0").is_some());
    }

    #[tokio::test]
    async fn test_missing_ports_is_parameter_error() {
        let client = MockClusterClient::new();
        let err = NodePortPlugin::new()
            .on_pod_added(
                &client,
                test_pod("gs-0", NODE_PORT_PLUGIN, &[]),
                &PluginContext::background(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParameterError);
    }

    #[tokio::test]
    async fn test_api_failure_is_api_call_error() {
        let client = MockClusterClient::new();
        client.fail_operation("create_service");
        let err = NodePortPlugin::new()
            .on_pod_added(&client, pod(), &PluginContext::background())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ApiCallError);
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_service() {
        let client = MockClusterClient::new();
        let ctx = PluginContext::background();
        let plugin = NodePortPlugin::new();

        plugin.on_pod_added(&client, pod(), &ctx).await.unwrap();
        plugin.on_pod_deleted(&client, &pod(), &ctx).await.unwrap();
        assert!(client.services().is_empty());
        plugin.on_pod_deleted(&client, &pod(), &ctx).await.unwrap();
    }
}
