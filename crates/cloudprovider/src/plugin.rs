//! Plugin and cloud provider traits.
//!
//! A [`Plugin`] implements one network type for pods. A [`CloudProvider`]
//! groups the plugins that share configuration. Both are object safe and
//! held as `Arc<dyn ...>` by the [`ProviderManager`](crate::ProviderManager).
//!
//! Lifecycle methods are invoked at least once and possibly concurrently for
//! the same pod, and may keep running after the caller stopped waiting. They
//! must be idempotent and must not keep per-pod state outside the
//! allocation cache and the cluster itself.

use crate::config::CloudProviderOptions;
use crate::context::PluginContext;
use crate::errors::PluginError;
use async_trait::async_trait;
use cluster_client::ClusterClientTrait;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;

/// Network plugin for one network type
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Network type handled, matched against the pod's `network-type` annotation.
    fn name(&self) -> &str;

    /// Human-readable label.
    fn alias(&self) -> &str;

    /// Validate options and seed state from the cluster. Called once at startup.
    async fn init(
        &self,
        client: &dyn ClusterClientTrait,
        options: &CloudProviderOptions,
        ctx: &PluginContext,
    ) -> Result<(), PluginError>;

    /// Pod is being created. Returns the pod with network annotations (and
    /// any spec changes) applied.
    async fn on_pod_added(
        &self,
        client: &dyn ClusterClientTrait,
        pod: Pod,
        ctx: &PluginContext,
    ) -> Result<Pod, PluginError>;

    /// Pod changed. Returns the pod with refreshed network annotations.
    async fn on_pod_updated(
        &self,
        client: &dyn ClusterClientTrait,
        pod: Pod,
        ctx: &PluginContext,
    ) -> Result<Pod, PluginError>;

    /// Pod is going away. Resources already gone count as released.
    async fn on_pod_deleted(
        &self,
        client: &dyn ClusterClientTrait,
        pod: &Pod,
        ctx: &PluginContext,
    ) -> Result<(), PluginError>;

    /// Re-seed cached allocations from the cluster. Plugins without a cache
    /// keep the default no-op.
    async fn reconcile(&self, _client: &dyn ClusterClientTrait) -> Result<(), PluginError> {
        Ok(())
    }
}

/// A family of plugins sharing one options block
pub trait CloudProvider: Send + Sync {
    /// Provider name, never empty for a registrable provider.
    fn name(&self) -> &str;

    /// Plugins offered by this provider.
    fn list_plugins(&self) -> Result<Vec<Arc<dyn Plugin>>, PluginError>;
}
