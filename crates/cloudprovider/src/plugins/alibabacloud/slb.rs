//! AlibabaCloud-SLB plugin.
//!
//! Pods share a small set of existing SLB instances. Each pod gets one
//! listener port per declared port on the first SLB of its `SlbIds` list
//! that has room, and a `LoadBalancer` Service bound to that SLB through the
//! load-balancer-id annotation. Listener ports are the scarce resource: the
//! cache key is the SLB id, the units are listener ports from the
//! configured range.
//!
//! The Services are the record of truth; the cache is rebuilt from every
//! Service labelled with this plugin.

use crate::cache::{AllocationCache, AllocationRecord, Owner, PortRange};
use crate::config::CloudProviderOptions;
use crate::context::PluginContext;
use crate::errors::PluginError;
use crate::plugin::Plugin;
use crate::plugins::{
    apply_service, build_service, confirm_deletion, delete_pod_service, internal_addresses,
    load_balancer_address, service_port, service_port_protocol, DeletionCheck,
    PORT_PROTOCOLS_PARAM,
};
use crate::status::{converge, Observation};
use async_trait::async_trait;
use cluster_client::ClusterClientTrait;
use k8s_openapi::api::core::v1::{Pod, Service};
use network_api::{
    network_disabled, parse_port_protocols, pod_key, NetworkAddress, NetworkConf, NetworkPort,
    NetworkState, NetworkStatus, NETWORK_PLUGIN_LABEL, OWNER_POD_UID_ANNOTATION,
};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Network type
pub const SLB_PLUGIN: &str = "AlibabaCloud-SLB";

/// Comma-separated SLB ids the pod may be placed on, in preference order
pub const SLB_IDS_PARAM: &str = "SlbIds";

/// Binds a Service to an existing SLB instance
pub const SLB_ID_ANNOTATION: &str = "service.beta.kubernetes.io/alibaba-cloud-loadbalancer-id";

/// Lets the Service manage listeners on an SLB it did not create
pub const SLB_FORCE_OVERRIDE_ANNOTATION: &str =
    "service.beta.kubernetes.io/alibaba-cloud-loadbalancer-force-override-listeners";

/// Shared SLB plugin
pub struct SlbPlugin {
    cache: OnceLock<Arc<AllocationCache>>,
}

impl SlbPlugin {
    /// Uninitialized plugin.
    pub fn new() -> Self {
        Self {
            cache: OnceLock::new(),
        }
    }

    fn cache(&self) -> Result<&Arc<AllocationCache>, PluginError> {
        self.cache
            .get()
            .ok_or_else(|| PluginError::Internal(format!("{} used before init", SLB_PLUGIN)))
    }

    async fn rebuild(&self, client: &dyn ClusterClientTrait) -> Result<(), PluginError> {
        let cache = self.cache()?;
        let selector = format!("{}={}", NETWORK_PLUGIN_LABEL, SLB_PLUGIN);
        let services = client.list_services(&selector).await?;
        let summary = cache.rebuild(services.iter().flat_map(listener_records));

        for conflict in &summary.conflicts {
            warn!(
                "Listener {} on SLB {} is claimed by more than one service, ignoring {}",
                conflict.unit, conflict.key, conflict.owner
            );
        }
        debug!(
            "{} cache rebuilt from {} services: {} listeners, {} in flight",
            SLB_PLUGIN,
            services.len(),
            summary.records,
            summary.retained
        );
        Ok(())
    }

    async fn sync(
        &self,
        client: &dyn ClusterClientTrait,
        mut pod: Pod,
        ctx: &PluginContext,
    ) -> Result<Pod, PluginError> {
        let cache = self.cache()?;
        let conf = NetworkConf::from_pod(&pod)?;
        let slb_ids = parse_slb_ids(conf.require(SLB_IDS_PARAM)?)?;
        let ports = parse_port_protocols(conf.require(PORT_PROTOCOLS_PARAM)?)?;

        let owner = Owner::from_pod(&pod);
        let (slb_id, listeners) = cache.allocate_first_fit(&slb_ids, &owner, ports.len(), &[])?;
        debug!("Pod {} holds listeners {:?} on SLB {}", owner, listeners, slb_id);

        let mut annotations = BTreeMap::new();
        annotations.insert(SLB_ID_ANNOTATION.to_string(), slb_id.clone());
        annotations.insert(SLB_FORCE_OVERRIDE_ANNOTATION.to_string(), "true".to_string());
        let desired = build_service(
            &pod,
            SLB_PLUGIN,
            "LoadBalancer",
            ports
                .iter()
                .zip(&listeners)
                .map(|(p, listener)| service_port(*listener, p.port, p.protocol))
                .collect(),
            annotations,
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
            match load_balancer_address(&svc) {
                Some((ip, end_point)) => Observation::Ready {
                    internal: internal_addresses(&pod, &ports),
                    external: vec![NetworkAddress {
                        ip,
                        ports: service_listeners(&svc),
                        end_point,
                    }],
                },
                None => Observation::Pending,
            }
        };

        let state = converge(&mut pod, observation);
        debug!("Pod {} network is {} on SLB {}", pod_key(&pod), state, slb_id);
        Ok(pod)
    }
}

impl Default for SlbPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_slb_ids(raw: &str) -> Result<Vec<String>, PluginError> {
    let ids: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        return Err(PluginError::Parameter(format!("{} lists no SLB", SLB_IDS_PARAM)));
    }
    Ok(ids)
}

fn service_listeners(svc: &Service) -> Vec<NetworkPort> {
    svc.spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| {
                    let port = u16::try_from(p.port).ok()?;
                    Some(NetworkPort::new(port, service_port_protocol(p)))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Listener ports a plugin Service holds on its SLB.
fn listener_records(svc: &Service) -> Vec<AllocationRecord> {
    let annotations = svc.metadata.annotations.as_ref();
    let Some(slb_id) = annotations.and_then(|a| a.get(SLB_ID_ANNOTATION)) else {
        return Vec::new();
    };
    let owner = Owner::new(
        format!(
            "{}/{}",
            svc.metadata.namespace.as_deref().unwrap_or("default"),
            svc.metadata.name.as_deref().unwrap_or_default()
        ),
        annotations.and_then(|a| a.get(OWNER_POD_UID_ANNOTATION)).cloned(),
    );
    service_listeners(svc)
        .into_iter()
        .map(|listener| AllocationRecord {
            key: slb_id.clone(),
            unit: listener.port,
            owner: owner.clone(),
        })
        .collect()
}

#[async_trait]
impl Plugin for SlbPlugin {
    fn name(&self) -> &str {
        SLB_PLUGIN
    }

    fn alias(&self) -> &str {
        "slb"
    }

    async fn init(
        &self,
        client: &dyn ClusterClientTrait,
        options: &CloudProviderOptions,
        _ctx: &PluginContext,
    ) -> Result<(), PluginError> {
        let CloudProviderOptions::AlibabaCloud(options) = options else {
            return Err(PluginError::Parameter(format!(
                "{} needs AlibabaCloud provider options",
                SLB_PLUGIN
            )));
        };
        if !options.slb.valid() {
            return Err(PluginError::Parameter(format!(
                "invalid SLB listener range {}-{}",
                options.slb.min_port, options.slb.max_port
            )));
        }

        self.cache
            .set(Arc::new(AllocationCache::new(PortRange::from(&options.slb))))
            .map_err(|_| PluginError::Internal(format!("{} initialized twice", SLB_PLUGIN)))?;
        self.rebuild(client).await?;

        info!(
            "{} ready with listener ports {}-{}",
            SLB_PLUGIN, options.slb.min_port, options.slb.max_port
        );
        Ok(())
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
        let cache = self.cache()?;
        let owner = Owner::from_pod(pod);

        let force = match confirm_deletion(client, pod).await? {
            DeletionCheck::Replaced => {
                info!("Pod {} was recreated, keeping its listeners", owner);
                return Ok(());
            }
            DeletionCheck::Gone => true,
            DeletionCheck::Present => false,
        };

        // listeners go back to the pool only once the service is gone
        delete_pod_service(client, pod).await?;
        for (slb_id, listeners) in cache.release_owner(&owner, force) {
            info!("Released listeners {:?} on SLB {} from pod {}", listeners, slb_id, owner);
        }
        Ok(())
    }

    async fn reconcile(&self, client: &dyn ClusterClientTrait) -> Result<(), PluginError> {
        self.rebuild(client).await
    }
}
