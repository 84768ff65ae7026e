//! Built-in network plugins and the helpers they share.
//!
//! - [`kubernetes`]: `Kubernetes-HostPort` and `Kubernetes-NodePort`
//! - [`alibabacloud`]: `AlibabaCloud-SLB`
//!
//! Plugins that expose a pod through a Service create one Service per pod,
//! named after the pod, selecting it through the StatefulSet pod-name label,
//! labelled with the plugin name and annotated with the owning pod UID.

pub mod alibabacloud;
pub mod kubernetes;

use crate::cache::Owner;
use crate::errors::PluginError;
use cluster_client::{ClusterClientTrait, ClusterError};
use k8s_openapi::api::core::v1::{Node, Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use network_api::{
    network_disabled, pod_key, NetworkAddress, NetworkPort, PortProtocol, Protocol,
    NETWORK_PLUGIN_LABEL, OWNER_POD_UID_ANNOTATION, POD_NAME_LABEL,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// `80/TCP,443` ports to expose
pub const PORT_PROTOCOLS_PARAM: &str = "PortProtocols";

/// Selector label used while a pod's network is disabled; no pod carries it
pub const DISABLED_SELECTOR_LABEL: &str = "game.kruise.io/network-disabled";

/// Namespace and name of a pod. Pods without a name cannot be handled.
pub(crate) fn pod_identity(pod: &Pod) -> Result<(String, String), PluginError> {
    let name = pod
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| PluginError::Parameter("pod has no name".to_string()))?;
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    Ok((namespace, name))
}

/// What the cluster says about a pod being deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeletionCheck {
    /// No pod with that name exists any more
    Gone,
    /// A different incarnation now holds the name
    Replaced,
    /// The same pod still exists (deletion in progress)
    Present,
}

/// Look the pod up by name to decide how its resources may be released.
pub(crate) async fn confirm_deletion(
    client: &dyn ClusterClientTrait,
    pod: &Pod,
) -> Result<DeletionCheck, PluginError> {
    let (namespace, name) = pod_identity(pod)?;
    match client.get_pod(&namespace, &name).await {
        Ok(live) => {
            let replaced = matches!(
                (&live.metadata.uid, &pod.metadata.uid),
                (Some(live_uid), Some(uid)) if live_uid != uid
            );
            Ok(if replaced {
                DeletionCheck::Replaced
            } else {
                DeletionCheck::Present
            })
        }
        Err(e) if e.is_not_found() => Ok(DeletionCheck::Gone),
        Err(e) => Err(e.into()),
    }
}

/// Player-facing address of a node: ExternalIP, falling back to InternalIP.
pub(crate) fn node_address(node: &Node) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    ["ExternalIP", "InternalIP"].iter().find_map(|wanted| {
        addresses
            .iter()
            .find(|a| a.type_ == *wanted && !a.address.is_empty())
            .map(|a| a.address.clone())
    })
}

/// Address of the named node, `None` when the node does not exist.
pub(crate) async fn lookup_node_address(
    client: &dyn ClusterClientTrait,
    node: &str,
) -> Result<Option<String>, PluginError> {
    match client.get_node(node).await {
        Ok(node) => Ok(node_address(&node)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Pod IP once the pod is running.
pub(crate) fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
}

/// Node the pod is (or will be) scheduled on.
pub(crate) fn pod_node(pod: &Pod) -> Option<String> {
    let spec = pod.spec.as_ref()?;
    spec.node_name
        .clone()
        .filter(|n| !n.is_empty())
        .or_else(|| {
            spec.node_selector
                .as_ref()
                .and_then(|s| s.get(network_api::HOSTNAME_LABEL))
                .cloned()
        })
}

/// In-cluster address list for a pod, empty until it has an IP.
pub(crate) fn internal_addresses(pod: &Pod, ports: &[PortProtocol]) -> Vec<NetworkAddress> {
    pod_ip(pod)
        .map(|ip| {
            vec![NetworkAddress {
                ip: ip.to_string(),
                ports: ports
                    .iter()
                    .map(|p| NetworkPort::new(p.port, p.protocol))
                    .collect(),
                end_point: None,
            }]
        })
        .unwrap_or_default()
}

/// Service port `port` forwarding to `target`.
pub(crate) fn service_port(port: u16, target: u16, protocol: Protocol) -> ServicePort {
    ServicePort {
        name: Some(NetworkPort::new(port, protocol).name),
        port: i32::from(port),
        target_port: Some(IntOrString::Int(i32::from(target))),
        protocol: Some(protocol.as_str().to_string()),
        ..Default::default()
    }
}

/// Protocol of a service port, TCP when unset or unknown.
pub(crate) fn service_port_protocol(port: &ServicePort) -> Protocol {
    port.protocol
        .as_deref()
        .and_then(|p| p.parse().ok())
        .unwrap_or_default()
}

/// Selector of the per-pod Service: the pod itself, or nothing at all while
/// the pod's network is disabled.
pub(crate) fn service_selector(pod: &Pod, name: &str) -> BTreeMap<String, String> {
    let mut selector = BTreeMap::new();
    if network_disabled(pod) {
        selector.insert(DISABLED_SELECTOR_LABEL.to_string(), "true".to_string());
    } else {
        selector.insert(POD_NAME_LABEL.to_string(), name.to_string());
    }
    selector
}

/// Per-pod Service owned by `plugin`.
pub(crate) fn build_service(
    pod: &Pod,
    plugin: &str,
    service_type: &str,
    ports: Vec<ServicePort>,
    mut annotations: BTreeMap<String, String>,
) -> Result<Service, PluginError> {
    let (namespace, name) = pod_identity(pod)?;

    let mut labels = BTreeMap::new();
    labels.insert(NETWORK_PLUGIN_LABEL.to_string(), plugin.to_string());

    let owner_references = pod.metadata.uid.as_ref().map(|uid| {
        annotations.insert(OWNER_POD_UID_ANNOTATION.to_string(), uid.clone());
        vec![OwnerReference {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            name: name.clone(),
            uid: uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]
    });

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references,
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            selector: Some(service_selector(pod, &name)),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    })
}

fn port_signature(svc: &Service) -> Vec<(i32, Option<IntOrString>, Protocol)> {
    let mut ports: Vec<_> = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| (p.port, p.target_port.clone(), service_port_protocol(p)))
                .collect()
        })
        .unwrap_or_default();
    ports.sort_by(|a, b| (a.0, a.2).cmp(&(b.0, b.2)));
    ports
}

/// Whether `existing` differs from `desired` in anything the plugin manages.
pub(crate) fn service_drifted(existing: &Service, desired: &Service) -> bool {
    let spec = |svc: &Service| svc.spec.clone().unwrap_or_default();
    let (have, want) = (spec(existing), spec(desired));

    let annotations_missing = desired
        .metadata
        .annotations
        .iter()
        .flatten()
        .any(|(k, v)| {
            existing
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(k))
                != Some(v)
        });

    have.type_ != want.type_
        || have.selector != want.selector
        || port_signature(existing) != port_signature(desired)
        || annotations_missing
}

/// Create the Service, or bring an existing one in line with `desired`.
///
/// Returns the live Service and whether it had to be created.
pub(crate) async fn apply_service(
    client: &dyn ClusterClientTrait,
    desired: Service,
) -> Result<(Service, bool), PluginError> {
    let namespace = desired.metadata.namespace.clone().unwrap_or_default();
    let name = desired.metadata.name.clone().unwrap_or_default();

    match client.get_service(&namespace, &name).await {
        Ok(existing) => {
            if !service_drifted(&existing, &desired) {
                return Ok((existing, false));
            }
            info!("Service {}/{} drifted, updating it", namespace, name);
            let updated = merge_service(existing, desired);
            Ok((client.replace_service(&namespace, &updated).await?, false))
        }
        Err(e) if e.is_not_found() => match client.create_service(&namespace, &desired).await {
            Ok(created) => {
                info!("Created service {}/{}", namespace, name);
                Ok((created, true))
            }
            Err(ClusterError::Conflict(_)) => {
                debug!("Service {}/{} created concurrently", namespace, name);
                Ok((client.get_service(&namespace, &name).await?, false))
            }
            Err(e) => Err(e.into()),
        },
        Err(e) => Err(e.into()),
    }
}

/// `desired` applied on top of `existing`, keeping server-assigned fields
/// and the node ports of ports that did not change.
fn merge_service(mut existing: Service, desired: Service) -> Service {
    let desired_spec = desired.spec.unwrap_or_default();
    let spec = existing.spec.get_or_insert_with(Default::default);

    let previous = spec.ports.take().unwrap_or_default();
    let ports = desired_spec
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|mut port| {
            port.node_port = previous
                .iter()
                .find(|p| p.port == port.port && service_port_protocol(p) == service_port_protocol(&port))
                .and_then(|p| p.node_port);
            port
        })
        .collect();

    spec.ports = Some(ports);
    spec.selector = desired_spec.selector;
    spec.type_ = desired_spec.type_;

    existing
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .extend(desired.metadata.labels.unwrap_or_default());
    existing
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .extend(desired.metadata.annotations.unwrap_or_default());
    if desired.metadata.owner_references.is_some() {
        existing.metadata.owner_references = desired.metadata.owner_references;
    }
    existing
}

/// Whether a plugin Service belongs to `owner`. Services without a recorded
/// owner UID, or owners without a known UID, match by name alone.
pub(crate) fn service_owned_by(svc: &Service, owner: &Owner) -> bool {
    let recorded = svc
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(OWNER_POD_UID_ANNOTATION))
        .cloned();
    owner.matches(&Owner::new(owner.pod.clone(), recorded))
}

/// Delete the per-pod Service unless a newer incarnation of the pod owns it.
/// A missing Service counts as deleted.
pub(crate) async fn delete_pod_service(
    client: &dyn ClusterClientTrait,
    pod: &Pod,
) -> Result<(), PluginError> {
    let (namespace, name) = pod_identity(pod)?;
    let owner = Owner::from_pod(pod);

    let svc = match client.get_service(&namespace, &name).await {
        Ok(svc) => svc,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if !service_owned_by(&svc, &owner) {
        info!(
            "Service {}/{} belongs to another incarnation of pod {}, keeping it",
            namespace,
            name,
            pod_key(pod)
        );
        return Ok(());
    }

    match client.delete_service(&namespace, &name).await {
        Ok(()) => {
            info!("Deleted service {}/{}", namespace, name);
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Ingress address of a LoadBalancer Service, once provisioned.
pub(crate) fn load_balancer_address(svc: &Service) -> Option<(String, Option<String>)> {
    let ingress = svc
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;
    match (&ingress.ip, &ingress.hostname) {
        (Some(ip), hostname) if !ip.is_empty() => Some((ip.clone(), hostname.clone())),
        (_, Some(hostname)) if !hostname.is_empty() => Some((hostname.clone(), Some(hostname.clone()))),
        _ => None,
    }
}
