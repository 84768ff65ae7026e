//! Network status written back onto pods.

use crate::annotations::{
    pod_annotation, set_pod_annotation, NETWORK_ALLOCATION_ANNOTATION, NETWORK_STATUS_ANNOTATION,
};
use crate::conf::Protocol;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Readiness of a pod's network
///
/// Serializes as PascalCase ("Ready", "NotReady", "Waiting").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum NetworkState {
    /// External resource is not confirmed yet
    #[default]
    Waiting,
    /// Addresses are known and traffic flows
    Ready,
    /// Network deliberately off or failed
    NotReady,
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkState::Waiting => "Waiting",
            NetworkState::Ready => "Ready",
            NetworkState::NotReady => "NotReady",
        };
        f.write_str(s)
    }
}

/// One exposed port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPort {
    /// Port name, usually `<port>-<protocol>`
    pub name: String,
    /// Transport protocol
    pub protocol: Protocol,
    /// Port number
    pub port: u16,
}

impl NetworkPort {
    /// Port named after its number and protocol.
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self {
            name: format!("{}-{}", port, protocol.as_str().to_ascii_lowercase()),
            protocol,
            port,
        }
    }
}

/// An address with the ports reachable on it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAddress {
    /// IP address
    pub ip: String,
    /// Reachable ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<NetworkPort>,
    /// Hostname endpoint, when the resource publishes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_point: Option<String>,
}

/// Content of the `network-status` annotation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Current readiness
    pub current_network_state: NetworkState,
    /// Addresses reachable inside the cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub internal_addresses: Vec<NetworkAddress>,
    /// Addresses reachable from players
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_addresses: Vec<NetworkAddress>,
    /// When the status was first written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
    /// Last time `current_network_state` changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl NetworkStatus {
    /// Fresh `Waiting` status stamped now.
    pub fn waiting() -> Self {
        let now = Utc::now();
        Self {
            current_network_state: NetworkState::Waiting,
            create_time: Some(now),
            last_transition_time: Some(now),
            ..Default::default()
        }
    }

    /// Read the status annotation from a pod.
    ///
    /// Malformed JSON is logged and treated as absent.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let raw = pod_annotation(pod, NETWORK_STATUS_ANNOTATION)?;
        match serde_json::from_str(raw) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(
                    "Ignoring malformed {} on pod {:?}: {}",
                    NETWORK_STATUS_ANNOTATION, pod.metadata.name, e
                );
                None
            }
        }
    }

    /// Write this status onto the pod.
    pub fn write_to(&self, pod: &mut Pod) {
        if let Ok(raw) = serde_json::to_string(self) {
            set_pod_annotation(pod, NETWORK_STATUS_ANNOTATION, raw);
        }
    }
}

/// Content of the `network-allocation` annotation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationAnnotation {
    /// Allocation key the ports belong to
    pub key: String,
    /// Allocated ports, in declaration order
    pub ports: Vec<u16>,
}

impl AllocationAnnotation {
    /// Read the allocation annotation. Malformed JSON is treated as absent.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let raw = pod_annotation(pod, NETWORK_ALLOCATION_ANNOTATION)?;
        match serde_json::from_str(raw) {
            Ok(allocation) => Some(allocation),
            Err(e) => {
                warn!(
                    "Ignoring malformed {} on pod {:?}: {}",
                    NETWORK_ALLOCATION_ANNOTATION, pod.metadata.name, e
                );
                None
            }
        }
    }

    /// Write the allocation onto the pod.
    pub fn write_to(&self, pod: &mut Pod) {
        if let Ok(raw) = serde_json::to_string(self) {
            set_pod_annotation(pod, NETWORK_ALLOCATION_ANNOTATION, raw);
        }
    }
}
