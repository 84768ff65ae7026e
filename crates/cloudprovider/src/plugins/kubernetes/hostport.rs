//! Kubernetes-HostPort plugin.
//!
//! Gives every declared container port a host port from the configured
//! range. Host ports are unique per node: a pod pinned to a node (through
//! `spec.nodeName` or a `kubernetes.io/hostname` node selector) allocates
//! under that node, any other pod under [`CLUSTER_WIDE_KEY`] and leaves
//! placement to the scheduler's host port check.
//!
//! Host ports are written into the pod spec on create only; the pod API does
//! not allow changing them afterwards. The allocation is also recorded in
//! the `network-allocation` annotation, which is what the cache is rebuilt
//! from.

use crate::cache::{AllocationCache, AllocationRecord, Owner, PortRange};
use crate::config::CloudProviderOptions;
use crate::context::PluginContext;
use crate::errors::PluginError;
use crate::plugin::Plugin;
use crate::plugins::{confirm_deletion, lookup_node_address, pod_ip, pod_node, DeletionCheck};
use crate::status::{converge, Observation};
use async_trait::async_trait;
use cluster_client::ClusterClientTrait;
use k8s_openapi::api::core::v1::{ContainerPort, Pod};
use network_api::{
    network_type, parse_container_ports, pod_key, AllocationAnnotation, ContainerPorts,
    NetworkAddress, NetworkConf, NetworkPort, PortProtocol,
};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Network type
pub const HOST_PORT_PLUGIN: &str = "Kubernetes-HostPort";

/// `container:port/PROTO,...;container2:...` ports needing a host port
pub const CONTAINER_PORTS_PARAM: &str = "ContainerPorts";

/// Allocation key of pods not pinned to a node
pub const CLUSTER_WIDE_KEY: &str = "*";

/// Host port plugin
pub struct HostPortPlugin {
    cache: OnceLock<Arc<AllocationCache>>,
}

impl HostPortPlugin {
    /// Uninitialized plugin.
    pub fn new() -> Self {
        Self {
            cache: OnceLock::new(),
        }
    }

    fn cache(&self) -> Result<&Arc<AllocationCache>, PluginError> {
        self.cache
            .get()
            .ok_or_else(|| PluginError::Internal(format!("{} used before init", HOST_PORT_PLUGIN)))
    }

    /// Host port allocations recorded on live pods.
    async fn observed_allocations(
        client: &dyn ClusterClientTrait,
    ) -> Result<Vec<AllocationRecord>, PluginError> {
        let pods = client.list_pods(None).await?;
        let records = pods
            .iter()
            .filter(|pod| network_type(pod) == Some(HOST_PORT_PLUGIN))
            .filter(|pod| !is_terminated(pod))
            .filter_map(|pod| {
                AllocationAnnotation::from_pod(pod).map(|allocation| (Owner::from_pod(pod), allocation))
            })
            .flat_map(|(owner, allocation)| {
                allocation.ports.into_iter().map(move |unit| AllocationRecord {
                    key: allocation.key.clone(),
                    unit,
                    owner: owner.clone(),
                })
            })
            .collect();
        Ok(records)
    }

    async fn rebuild(&self, client: &dyn ClusterClientTrait) -> Result<(), PluginError> {
        let cache = self.cache()?;
        let summary = cache.rebuild(Self::observed_allocations(client).await?);
        for conflict in &summary.conflicts {
            warn!(
                "Host port {} on {} claimed by more than one pod, ignoring {}",
                conflict.unit, conflict.key, conflict.owner
            );
        }
        debug!(
            "{} cache rebuilt: {} allocations, {} in flight",
            HOST_PORT_PLUGIN, summary.records, summary.retained
        );
        Ok(())
    }

    /// Make sure the pod holds host ports, returning the key and the ports in
    /// declaration order.
    ///
    /// Ports the pod name still holds under another key are released only
    /// after the new key had room, and only when they belong to this
    /// incarnation.
    fn ensure_allocation(
        &self,
        pod: &Pod,
        declared: &[PortProtocol],
    ) -> Result<(String, Vec<u16>), PluginError> {
        let cache = self.cache()?;
        let owner = Owner::from_pod(pod);
        let key = match AllocationAnnotation::from_pod(pod) {
            Some(recorded) => recorded.key,
            None => pod_node(pod).unwrap_or_else(|| CLUSTER_WIDE_KEY.to_string()),
        };

        let previous = cache.held_by(&owner).filter(|(held_key, _)| *held_key != key);
        let ports = cache.allocate(&key, &owner, declared.len(), &[])?;

        if let Some((held_key, units)) = previous {
            let released = cache.release(&held_key, &owner, &units, false);
            if !released.is_empty() {
                info!(
                    "Pod {} moved from {} to {}, released host ports {:?}",
                    owner, held_key, key, released
                );
            }
        }
        Ok((key, ports))
    }

    async fn observe(
        &self,
        client: &dyn ClusterClientTrait,
        pod: &Pod,
        groups: &[ContainerPorts],
        host_ports: &[u16],
        ctx: &PluginContext,
    ) -> Result<Observation, PluginError> {
        let (Some(node), Some(ip)) = (pod.spec.as_ref().and_then(|s| s.node_name.clone()), pod_ip(pod))
        else {
            return Ok(Observation::Pending);
        };

        // annotation-only persistence leaves the spec without host ports
        let bound = bound_host_ports(pod, groups);
        if bound.len() != host_ports.len() || bound.iter().zip(host_ports).any(|(b, h)| *b != Some(*h)) {
            warn!(
                "Pod {} runs without its host ports {:?} (bound {:?}), recreate it through admission",
                pod_key(pod),
                host_ports,
                bound
            );
            return Ok(Observation::Lost);
        }
        let declared: Vec<PortProtocol> = groups
            .iter()
            .flat_map(|g| g.ports.iter().copied())
            .collect();

        ctx.ensure_active("node lookup")?;
        let Some(node_ip) = lookup_node_address(client, &node).await? else {
            warn!("Node {} of pod {} has no address or is gone", node, pod_key(pod));
            return Ok(Observation::Lost);
        };

        let internal = NetworkAddress {
            ip: ip.to_string(),
            ports: declared
                .iter()
                .map(|p| NetworkPort::new(p.port, p.protocol))
                .collect(),
            end_point: None,
        };
        let external = NetworkAddress {
            ip: node_ip,
            ports: declared
                .iter()
                .zip(host_ports)
                .map(|(p, host)| NetworkPort::new(*host, p.protocol))
                .collect(),
            end_point: None,
        };
        Ok(Observation::Ready {
            internal: vec![internal],
            external: vec![external],
        })
    }
}

impl Default for HostPortPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn is_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// Declared container ports, validated against the pod's containers.
fn declared_ports(pod: &Pod) -> Result<(Vec<ContainerPorts>, Vec<PortProtocol>), PluginError> {
    let conf = NetworkConf::from_pod(pod)?;
    let declared = parse_container_ports(conf.require(CONTAINER_PORTS_PARAM)?)?;

    let containers = pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default();
    if let Some(missing) = declared
        .iter()
        .find(|d| !containers.iter().any(|c| c.name == d.container))
    {
        return Err(PluginError::Parameter(format!(
            "container {} of pod {} does not exist",
            missing.container,
            pod_key(pod)
        )));
    }

    let flat = declared.iter().flat_map(|d| d.ports.iter().copied()).collect();
    Ok((declared, flat))
}

fn matches_port(port: &ContainerPort, wanted: &PortProtocol) -> bool {
    port.container_port == i32::from(wanted.port)
        && port.protocol.as_deref().unwrap_or("TCP") == wanted.protocol.as_str()
}

/// Host ports the pod's containers carry, in declaration order.
fn bound_host_ports(pod: &Pod, declared: &[ContainerPorts]) -> Vec<Option<u16>> {
    let containers = pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default();
    declared
        .iter()
        .flat_map(|group| {
            let ports = containers
                .iter()
                .find(|c| c.name == group.container)
                .and_then(|c| c.ports.as_deref())
                .unwrap_or_default();
            group.ports.iter().map(move |wanted| {
                ports
                    .iter()
                    .find(|p| matches_port(p, wanted))
                    .and_then(|p| p.host_port)
                    .and_then(|h| u16::try_from(h).ok())
            })
        })
        .collect()
}

/// Write the host ports into the matching container ports, adding the port
/// to the container when it is not declared there.
fn bind_host_ports(pod: &mut Pod, declared: &[ContainerPorts], host_ports: &[u16]) {
    let Some(spec) = pod.spec.as_mut() else {
        return;
    };
    let mut host_ports = host_ports.iter();

    for group in declared {
        let Some(container) = spec.containers.iter_mut().find(|c| c.name == group.container) else {
            continue;
        };
        let ports = container.ports.get_or_insert_with(Vec::new);
        for wanted in &group.ports {
            let Some(host) = host_ports.next() else {
                return;
            };
            match ports.iter_mut().find(|p| matches_port(p, wanted)) {
                Some(port) => port.host_port = Some(i32::from(*host)),
                None => ports.push(ContainerPort {
                    container_port: i32::from(wanted.port),
                    host_port: Some(i32::from(*host)),
                    protocol: Some(wanted.protocol.as_str().to_string()),
                    ..Default::default()
                }),
            }
        }
    }
}

#[async_trait]
impl Plugin for HostPortPlugin {
    fn name(&self) -> &str {
        HOST_PORT_PLUGIN
    }

    fn alias(&self) -> &str {
        "hostport"
    }

    async fn init(
        &self,
        client: &dyn ClusterClientTrait,
        options: &CloudProviderOptions,
        _ctx: &PluginContext,
    ) -> Result<(), PluginError> {
        let CloudProviderOptions::Kubernetes(options) = options else {
            return Err(PluginError::Parameter(format!(
                "{} needs Kubernetes provider options",
                HOST_PORT_PLUGIN
            )));
        };
        if !options.host_port.valid() {
            return Err(PluginError::Parameter(format!(
                "invalid host port range {}-{}",
                options.host_port.min_port, options.host_port.max_port
            )));
        }

        let cache = AllocationCache::new(PortRange::from(&options.host_port));
        self.cache
            .set(Arc::new(cache))
            .map_err(|_| PluginError::Internal(format!("{} initialized twice", HOST_PORT_PLUGIN)))?;
        self.rebuild(client).await?;

        info!(
            "{} ready with host ports {}-{}",
            HOST_PORT_PLUGIN, options.host_port.min_port, options.host_port.max_port
        );
        Ok(())
    }

    async fn on_pod_added(
        &self,
        client: &dyn ClusterClientTrait,
        mut pod: Pod,
        ctx: &PluginContext,
    ) -> Result<Pod, PluginError> {
        let (declared, flat) = declared_ports(&pod)?;
        let (key, host_ports) = self.ensure_allocation(&pod, &flat)?;
        info!("Pod {} gets host ports {:?} on {}", pod_key(&pod), host_ports, key);

        bind_host_ports(&mut pod, &declared, &host_ports);
        AllocationAnnotation {
            key,
            ports: host_ports.clone(),
        }
        .write_to(&mut pod);

        let observation = self.observe(client, &pod, &declared, &host_ports, ctx).await?;
        converge(&mut pod, observation);
        Ok(pod)
    }

    async fn on_pod_updated(
        &self,
        client: &dyn ClusterClientTrait,
        mut pod: Pod,
        ctx: &PluginContext,
    ) -> Result<Pod, PluginError> {
        let (declared, flat) = declared_ports(&pod)?;
        let Some(recorded) = AllocationAnnotation::from_pod(&pod) else {
            return Err(PluginError::NotImplemented(format!(
                "pod {} was admitted without host ports, recreate it to get some",
                pod_key(&pod)
            )));
        };
        if recorded.ports.len() != flat.len() {
            return Err(PluginError::NotImplemented(format!(
                "host ports of pod {} cannot change after creation ({} allocated, {} declared)",
                pod_key(&pod),
                recorded.ports.len(),
                flat.len()
            )));
        }

        // recorded ports are authoritative; this also learns the pod UID
        self.cache()?
            .claim(&recorded.key, &Owner::from_pod(&pod), &recorded.ports)?;

        let observation = self
            .observe(client, &pod, &declared, &recorded.ports, ctx)
            .await?;
        converge(&mut pod, observation);
        Ok(pod)
    }

    async fn on_pod_deleted(
        &self,
        client: &dyn ClusterClientTrait,
        pod: &Pod,
        _ctx: &PluginContext,
    ) -> Result<(), PluginError> {
        let cache = self.cache()?;
        let owner = Owner::from_pod(pod);

        let released = match confirm_deletion(client, pod).await? {
            DeletionCheck::Gone => cache.release_owner(&owner, true),
            DeletionCheck::Present => cache.release_owner(&owner, false),
            DeletionCheck::Replaced => {
                info!("Pod {} was recreated, keeping its host ports", owner);
                Vec::new()
            }
        };
        for (key, units) in released {
            info!("Released host ports {:?} on {} from pod {}", units, key, owner);
        }
        Ok(())
    }

    async fn reconcile(&self, client: &dyn ClusterClientTrait) -> Result<(), PluginError> {
        self.rebuild(client).await
    }
}
