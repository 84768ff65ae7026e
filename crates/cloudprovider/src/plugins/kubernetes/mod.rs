//! Kubernetes provider: plugins that need nothing but the cluster itself.

mod hostport;
mod nodeport;

pub use hostport::{HostPortPlugin, CLUSTER_WIDE_KEY, CONTAINER_PORTS_PARAM, HOST_PORT_PLUGIN};
pub use nodeport::{NodePortPlugin, NODE_PORT_PLUGIN};

use crate::errors::PluginError;
use crate::plugin::{CloudProvider, Plugin};
use std::sync::Arc;

/// Provider name
pub const KUBERNETES_PROVIDER: &str = "Kubernetes";

/// Provider offering `Kubernetes-HostPort` and `Kubernetes-NodePort`
pub struct KubernetesProvider {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl KubernetesProvider {
    /// Provider with fresh, uninitialized plugins.
    pub fn new() -> Self {
        Self {
            plugins: vec![
                Arc::new(HostPortPlugin::new()) as Arc<dyn Plugin>,
                Arc::new(NodePortPlugin::new()) as Arc<dyn Plugin>,
            ],
        }
    }
}

impl Default for KubernetesProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudProvider for KubernetesProvider {
    fn name(&self) -> &str {
        KUBERNETES_PROVIDER
    }

    fn list_plugins(&self) -> Result<Vec<Arc<dyn Plugin>>, PluginError> {
        Ok(self.plugins.clone())
    }
}
