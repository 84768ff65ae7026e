//! Alibaba Cloud provider.
//!
//! Load balancers are provisioned by the Alibaba Cloud controller manager
//! from annotated `LoadBalancer` Services; this provider only decides which
//! SLB and which listener ports each pod gets.

mod slb;

pub use slb::{
    SlbPlugin, SLB_FORCE_OVERRIDE_ANNOTATION, SLB_ID_ANNOTATION, SLB_IDS_PARAM, SLB_PLUGIN,
};

use crate::errors::PluginError;
use crate::plugin::{CloudProvider, Plugin};
use std::sync::Arc;

/// Provider name
pub const ALIBABA_CLOUD_PROVIDER: &str = "AlibabaCloud";

/// Provider offering `AlibabaCloud-SLB`
pub struct AlibabaCloudProvider {
    slb: Arc<SlbPlugin>,
}

impl AlibabaCloudProvider {
    /// Provider with a fresh, uninitialized plugin.
    pub fn new() -> Self {
        Self {
            slb: Arc::new(SlbPlugin::new()),
        }
    }
}

impl Default for AlibabaCloudProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudProvider for AlibabaCloudProvider {
    fn name(&self) -> &str {
        ALIBABA_CLOUD_PROVIDER
    }

    fn list_plugins(&self) -> Result<Vec<Arc<dyn Plugin>>, PluginError> {
        Ok(vec![Arc::clone(&self.slb) as Arc<dyn Plugin>])
    }
}
