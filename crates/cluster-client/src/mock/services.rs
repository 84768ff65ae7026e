//! Service operations for MockClusterClient
//!
//! Node ports are handed out from 31000 upwards for `NodePort` and
//! `LoadBalancer` services, mimicking the API server. Replacing a service keeps
//! node ports of ports that still exist (same port and protocol).

use super::{object_key, MockClusterClient};
use crate::error::ClusterError;
use crate::selector_matches;
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Service, ServicePort, ServiceStatus,
};

const NODE_PORT_BASE: i32 = 31000;

pub fn get_service(client: &MockClusterClient, namespace: &str, name: &str) -> Result<Service, ClusterError> {
    client.enter("get_service")?;
    client
        .services
        .lock()
        .unwrap()
        .get(&(namespace.to_string(), name.to_string()))
        .cloned()
        .ok_or_else(|| ClusterError::NotFound(format!("service {}/{}", namespace, name)))
}

pub fn create_service(client: &MockClusterClient, namespace: &str, service: &Service) -> Result<Service, ClusterError> {
    client.enter("create_service")?;
    let mut created = service.clone();
    created.metadata.namespace = Some(namespace.to_string());
    let key = object_key(&created.metadata);

    if client.services.lock().unwrap().contains_key(&key) {
        return Err(ClusterError::Conflict(format!("service {}/{}", key.0, key.1)));
    }

    created.metadata.uid = Some(format!("svc-uid-{}", client.next_id()));
    assign_node_ports(client, &mut created, &[]);
    created.status = Some(ServiceStatus::default());

    client.services.lock().unwrap().insert(key, created.clone());
    Ok(created)
}

pub fn replace_service(client: &MockClusterClient, namespace: &str, service: &Service) -> Result<Service, ClusterError> {
    client.enter("replace_service")?;
    let mut replaced = service.clone();
    replaced.metadata.namespace = Some(namespace.to_string());
    let key = object_key(&replaced.metadata);

    let existing = client
        .services
        .lock()
        .unwrap()
        .get(&key)
        .cloned()
        .ok_or_else(|| ClusterError::NotFound(format!("service {}/{}", key.0, key.1)))?;

    let previous_ports = existing
        .spec
        .as_ref()
        .and_then(|s| s.ports.clone())
        .unwrap_or_default();
    replaced.metadata.uid = existing.metadata.uid.clone();
    replaced.status = existing.status.clone();
    assign_node_ports(client, &mut replaced, &previous_ports);

    client.services.lock().unwrap().insert(key, replaced.clone());
    Ok(replaced)
}

pub fn delete_service(client: &MockClusterClient, namespace: &str, name: &str) -> Result<(), ClusterError> {
    client.enter("delete_service")?;
    client
        .services
        .lock()
        .unwrap()
        .remove(&(namespace.to_string(), name.to_string()))
        .map(|_| ())
        .ok_or_else(|| ClusterError::NotFound(format!("service {}/{}", namespace, name)))
}

pub fn list_services(client: &MockClusterClient, label_selector: &str) -> Result<Vec<Service>, ClusterError> {
    client.enter("list_services")?;
    let mut services: Vec<Service> = client
        .services
        .lock()
        .unwrap()
        .values()
        .filter(|s| selector_matches(s.metadata.labels.as_ref(), label_selector))
        .cloned()
        .collect();
    services.sort_by(|a, b| object_key(&a.metadata).cmp(&object_key(&b.metadata)));
    Ok(services)
}

pub fn set_ingress(client: &MockClusterClient, namespace: &str, name: &str, ip: &str) {
    if let Some(svc) = client
        .services
        .lock()
        .unwrap()
        .get_mut(&(namespace.to_string(), name.to_string()))
    {
        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some(ip.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
}

fn assign_node_ports(client: &MockClusterClient, service: &mut Service, previous: &[ServicePort]) {
    let Some(spec) = service.spec.as_mut() else {
        return;
    };
    let wants_node_ports = matches!(spec.type_.as_deref(), Some("NodePort" | "LoadBalancer"));
    if !wants_node_ports {
        return;
    }
    for port in spec.ports.iter_mut().flatten() {
        if port.node_port.is_some() {
            continue;
        }
        let kept = previous
            .iter()
            .find(|p| p.port == port.port && p.protocol == port.protocol)
            .and_then(|p| p.node_port);
        port.node_port = Some(kept.unwrap_or_else(|| {
            NODE_PORT_BASE + i32::try_from(client.next_id()).unwrap_or(i32::MAX - NODE_PORT_BASE)
        }));
    }
}
