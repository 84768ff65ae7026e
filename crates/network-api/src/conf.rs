//! Plugin parameters carried in the `network-conf` annotation.
//!
//! The annotation is a JSON list of `{name, value}` pairs. Values use two
//! small text formats:
//!
//! - port lists: `80/TCP,443,7777/UDP` (protocol defaults to TCP)
//! - container port lists: `game:7777/UDP,7778;sidecar:9000`

use crate::annotations::{pod_annotation, NETWORK_CONF_ANNOTATION};
use crate::error::NetworkApiError;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single `{name, value}` parameter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfParam {
    /// Parameter name, e.g. `PortProtocols`
    pub name: String,
    /// Raw parameter value
    pub value: String,
}

/// Parsed `network-conf` annotation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkConf {
    params: Vec<NetworkConfParam>,
}

impl NetworkConf {
    /// Parse the JSON list form.
    pub fn parse(raw: &str) -> Result<Self, NetworkApiError> {
        let params = serde_json::from_str(raw).map_err(|source| NetworkApiError::InvalidJson {
            annotation: NETWORK_CONF_ANNOTATION.to_string(),
            source,
        })?;
        Ok(Self { params })
    }

    /// Read the annotation from a pod. A missing annotation is an empty conf.
    pub fn from_pod(pod: &Pod) -> Result<Self, NetworkApiError> {
        match pod_annotation(pod, NETWORK_CONF_ANNOTATION) {
            Some(raw) if !raw.trim().is_empty() => Self::parse(raw),
            _ => Ok(Self::default()),
        }
    }

    /// Build a conf from name/value pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            params: pairs
                .into_iter()
                .map(|(name, value)| NetworkConfParam {
                    name: name.to_string(),
                    value: value.to_string(),
                })
                .collect(),
        }
    }

    /// Last value set for `name`. Later entries override earlier ones.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .rev()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// Like [`NetworkConf::get`] but missing is an error.
    pub fn require(&self, name: &str) -> Result<&str, NetworkApiError> {
        self.get(name)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| NetworkApiError::MissingParameter(name.to_string()))
    }

    /// Serialize back to the annotation form.
    pub fn to_annotation(&self) -> String {
        serde_json::to_string(&self.params).unwrap_or_else(|_| "[]".to_string())
    }
}

/// Transport protocol of a port
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Protocol {
    /// TCP
    #[default]
    #[serde(rename = "TCP")]
    Tcp,
    /// UDP
    #[serde(rename = "UDP")]
    Udp,
    /// SCTP
    #[serde(rename = "SCTP")]
    Sctp,
}

impl Protocol {
    /// Kubernetes spelling
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Sctp => "SCTP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = NetworkApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "SCTP" => Ok(Protocol::Sctp),
            other => Err(NetworkApiError::InvalidProtocol(other.to_string())),
        }
    }
}

/// A `port/PROTOCOL` declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortProtocol {
    /// Port number
    pub port: u16,
    /// Protocol, TCP when omitted
    pub protocol: Protocol,
}

impl FromStr for PortProtocol {
    type Err = NetworkApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (port, protocol) = match s.split_once('/') {
            Some((port, proto)) => (port, proto.parse()?),
            None => (s, Protocol::Tcp),
        };
        let port = port
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| NetworkApiError::InvalidPort(s.to_string()))?;
        Ok(Self { port, protocol })
    }
}

/// Parse `80/TCP,443,7777/UDP`. Empty items are skipped; an empty list is an error.
pub fn parse_port_protocols(raw: &str) -> Result<Vec<PortProtocol>, NetworkApiError> {
    let ports = raw
        .split(',')
        .filter(|item| !item.trim().is_empty())
        .map(str::parse)
        .collect::<Result<Vec<PortProtocol>, _>>()?;
    if ports.is_empty() {
        return Err(NetworkApiError::InvalidPort(raw.to_string()));
    }
    Ok(ports)
}

/// Ports of one container that need exposing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPorts {
    /// Container name
    pub container: String,
    /// Ports to expose
    pub ports: Vec<PortProtocol>,
}

/// Parse `game:7777/UDP,7778;sidecar:9000`.
pub fn parse_container_ports(raw: &str) -> Result<Vec<ContainerPorts>, NetworkApiError> {
    let mut out = Vec::new();
    for group in raw.split(';').filter(|g| !g.trim().is_empty()) {
        let (container, ports) = group
            .split_once(':')
            .ok_or_else(|| NetworkApiError::InvalidPort(group.to_string()))?;
        let container = container.trim();
        if container.is_empty() {
            return Err(NetworkApiError::InvalidPort(group.to_string()));
        }
        out.push(ContainerPorts {
            container: container.to_string(),
            ports: parse_port_protocols(ports)?,
        });
    }
    if out.is_empty() {
        return Err(NetworkApiError::InvalidPort(raw.to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conf_last_value_wins() {
        let conf = NetworkConf::parse(
            r#"[{"name":"SlbIds","value":"lb-a"},{"name":"SlbIds","value":"lb-b"}]"#,
        )
        .unwrap();
        assert_eq!(conf.get("SlbIds"), Some("lb-b"));
        assert_eq!(conf.get("Missing"), None);
    }

    #[test]
    fn test_conf_invalid_json() {
        let err = NetworkConf::parse("{not json").unwrap_err();
        assert!(matches!(err, NetworkApiError::InvalidJson { .. }));
    }

    #[test]
    fn test_require_rejects_blank() {
        let conf = NetworkConf::from_pairs([("PortProtocols", "  ")]);
        assert!(matches!(
            conf.require("PortProtocols"),
            Err(NetworkApiError::MissingParameter(_))
        ));
    }

    #[test]
    fn test_parse_port_protocols() {
        let ports = parse_port_protocols("80/TCP, 7777/udp,443").unwrap();
        assert_eq!(
            ports,
            vec![
                PortProtocol { port: 80, protocol: Protocol::Tcp },
                PortProtocol { port: 7777, protocol: Protocol::Udp },
                PortProtocol { port: 443, protocol: Protocol::Tcp },
            ]
        );
    }

    #[test]
    fn test_parse_port_protocols_errors() {
        assert!(parse_port_protocols("").is_err());
        assert!(parse_port_protocols("0/TCP").is_err());
        assert!(parse_port_protocols("70000").is_err());
        assert!(matches!(
            parse_port_protocols("80/QUIC"),
            Err(NetworkApiError::InvalidProtocol(_))
        ));
    }

    #[test]
    fn test_parse_container_ports() {
        let parsed = parse_container_ports("game:7777/UDP,7778;sidecar:9000").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].container, "game");
        assert_eq!(parsed[0].ports.len(), 2);
        assert_eq!(parsed[1].ports[0].port, 9000);
        assert!(parse_container_ports("7777/UDP").is_err());
        assert!(parse_container_ports(":7777").is_err());
    }
}
