//! Provider configuration.
//!
//! Loaded once at startup from a YAML file:
//!
//! ```yaml
//! kubernetes:
//!   enable: true
//!   hostPort:
//!     minPort: 8000
//!     maxPort: 9000
//! alibabacloud:
//!   enable: true
//!   slb:
//!     minPort: 500
//!     maxPort: 550
//!     blockPorts: [503]
//! ```
//!
//! A provider block is only registered when it is both enabled and valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Errors loading the configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid YAML for the schema
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// A contiguous port range with holes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortPoolOptions {
    /// Lowest port handed out (inclusive)
    pub min_port: u16,
    /// Highest port handed out (inclusive)
    pub max_port: u16,
    /// Ports inside the range that are never handed out
    #[serde(default)]
    pub block_ports: Vec<u16>,
}

impl PortPoolOptions {
    /// Range is non-empty and has at least one usable port.
    pub fn valid(&self) -> bool {
        if self.min_port == 0 || self.min_port > self.max_port {
            return false;
        }
        let blocked_in_range = self
            .block_ports
            .iter()
            .filter(|p| (self.min_port..=self.max_port).contains(*p))
            .collect::<std::collections::BTreeSet<_>>()
            .len();
        blocked_in_range < self.capacity()
    }

    /// Number of ports in the range, holes included.
    pub fn capacity(&self) -> usize {
        if self.min_port > self.max_port {
            return 0;
        }
        usize::from(self.max_port - self.min_port) + 1
    }
}

fn default_true() -> bool {
    true
}

fn default_host_port_pool() -> PortPoolOptions {
    PortPoolOptions {
        min_port: 8000,
        max_port: 9000,
        block_ports: Vec::new(),
    }
}

fn default_slb_pool() -> PortPoolOptions {
    PortPoolOptions {
        min_port: 500,
        max_port: 550,
        block_ports: Vec::new(),
    }
}

/// Options of the built-in Kubernetes provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesOptions {
    /// Whether the provider is registered
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Host port pool per node
    #[serde(default = "default_host_port_pool")]
    pub host_port: PortPoolOptions,
}

impl Default for KubernetesOptions {
    fn default() -> Self {
        Self {
            enable: true,
            host_port: default_host_port_pool(),
        }
    }
}

/// Options of the Alibaba Cloud provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AlibabaCloudOptions {
    /// Whether the provider is registered
    #[serde(default)]
    pub enable: bool,
    /// Listener port pool per shared SLB
    #[serde(default = "default_slb_pool")]
    pub slb: PortPoolOptions,
}

impl Default for AlibabaCloudOptions {
    fn default() -> Self {
        Self {
            enable: false,
            slb: default_slb_pool(),
        }
    }
}

/// Provider-level options handed to every plugin of the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudProviderOptions {
    /// Kubernetes provider
    Kubernetes(KubernetesOptions),
    /// Alibaba Cloud provider
    AlibabaCloud(AlibabaCloudOptions),
}

impl CloudProviderOptions {
    /// Options are internally consistent.
    pub fn valid(&self) -> bool {
        match self {
            CloudProviderOptions::Kubernetes(o) => o.host_port.valid(),
            CloudProviderOptions::AlibabaCloud(o) => o.slb.valid(),
        }
    }

    /// Provider is switched on.
    pub fn enabled(&self) -> bool {
        match self {
            CloudProviderOptions::Kubernetes(o) => o.enable,
            CloudProviderOptions::AlibabaCloud(o) => o.enable,
        }
    }
}

/// Whole configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloudProviderConfig {
    /// Kubernetes provider block
    #[serde(default)]
    pub kubernetes: KubernetesOptions,
    /// Alibaba Cloud provider block
    #[serde(default)]
    pub alibabacloud: AlibabaCloudOptions,
}

impl CloudProviderConfig {
    /// Parse YAML text.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Load from a file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                info!("Loaded cloud provider config from {}", path.display());
                Self::parse(&raw)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }
}
