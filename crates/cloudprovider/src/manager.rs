//! Provider Manager
//!
//! Registry of cloud providers and their plugins. Built once at startup,
//! initialized once against the cluster, then shared read-only (behind an
//! `Arc`) by the dispatcher and the resync loop.
//!
//! Plugin names are unique across every registered provider; a provider
//! bringing a name that is already taken is rejected at registration. A
//! plugin whose `init` failed stays registered but is never handed out, so
//! pods asking for it fail admission with an `InternalError` instead of
//! running against a half-initialized plugin.

use crate::config::{CloudProviderConfig, CloudProviderOptions};
use crate::context::PluginContext;
use crate::errors::PluginError;
use crate::plugin::{CloudProvider, Plugin};
use crate::plugins::alibabacloud::AlibabaCloudProvider;
use crate::plugins::kubernetes::KubernetesProvider;
use cluster_client::ClusterClientTrait;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use network_api::{network_type, pod_key};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors registering providers
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Provider returned an empty name
    #[error("Cloud provider name must not be empty")]
    EmptyProviderName,

    /// Provider could not list its plugins
    #[error("Failed to list plugins of provider {provider}: {source}")]
    ListPlugins {
        /// Provider name
        provider: String,
        /// Underlying error
        #[source]
        source: PluginError,
    },

    /// Plugin name already registered by another provider
    #[error("Plugin {plugin} of provider {provider} is already registered by provider {existing}")]
    DuplicatePlugin {
        /// Plugin name
        plugin: String,
        /// Provider being registered
        provider: String,
        /// Provider that registered the name first
        existing: String,
    },
}

struct RegisteredProvider {
    provider: Arc<dyn CloudProvider>,
    options: CloudProviderOptions,
    plugins: Vec<Arc<dyn Plugin>>,
}

/// Registry of cloud providers and their plugins
#[derive(Default)]
pub struct ProviderManager {
    providers: Vec<RegisteredProvider>,
    initialized: RwLock<HashSet<String>>,
}

impl std::fmt::Debug for ProviderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderManager")
            .field("providers", &self.provider_names())
            .field("plugins", &self.plugin_names())
            .finish()
    }
}

impl ProviderManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager with the built-in providers that are enabled and valid in `config`.
    pub fn from_config(config: &CloudProviderConfig) -> Result<Self, ManagerError> {
        let mut manager = Self::new();

        let candidates: Vec<(Arc<dyn CloudProvider>, CloudProviderOptions)> = vec![
            (
                Arc::new(KubernetesProvider::new()) as Arc<dyn CloudProvider>,
                CloudProviderOptions::Kubernetes(config.kubernetes.clone()),
            ),
            (
                Arc::new(AlibabaCloudProvider::new()) as Arc<dyn CloudProvider>,
                CloudProviderOptions::AlibabaCloud(config.alibabacloud.clone()),
            ),
        ];

        for (provider, options) in candidates {
            if !options.enabled() {
                info!("Cloud provider {} is disabled", provider.name());
                continue;
            }
            if !options.valid() {
                warn!("Cloud provider {} has invalid options, not registering it", provider.name());
                continue;
            }
            manager.register_cloud_provider(provider, options)?;
        }

        Ok(manager)
    }

    /// Register a provider with its options.
    ///
    /// Registering a name again replaces the earlier registration in place.
    pub fn register_cloud_provider(
        &mut self,
        provider: Arc<dyn CloudProvider>,
        options: CloudProviderOptions,
    ) -> Result<(), ManagerError> {
        let name = provider.name().to_string();
        if name.is_empty() {
            return Err(ManagerError::EmptyProviderName);
        }

        let plugins = provider
            .list_plugins()
            .map_err(|source| ManagerError::ListPlugins {
                provider: name.clone(),
                source,
            })?;

        for plugin in &plugins {
            let taken_by = self
                .providers
                .iter()
                .filter(|p| p.provider.name() != name)
                .find(|p| p.plugins.iter().any(|existing| existing.name() == plugin.name()));
            if let Some(existing) = taken_by {
                return Err(ManagerError::DuplicatePlugin {
                    plugin: plugin.name().to_string(),
                    provider: name,
                    existing: existing.provider.name().to_string(),
                });
            }
        }

        let registered = RegisteredProvider {
            provider,
            options,
            plugins,
        };
        match self.providers.iter_mut().find(|p| p.provider.name() == name) {
            Some(slot) => {
                warn!("Cloud provider {} registered again, replacing it", name);
                *slot = registered;
            }
            None => {
                info!(
                    "Registered cloud provider {} with plugins {:?}",
                    name,
                    registered.plugins.iter().map(|p| p.name()).collect::<Vec<_>>()
                );
                self.providers.push(registered);
            }
        }
        Ok(())
    }

    /// Registered provider names, in registration order.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| p.provider.name().to_string())
            .collect()
    }

    /// Registered plugin names, in registration order.
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins().map(|(_, p)| p.name().to_string()).collect()
    }

    fn plugins(&self) -> impl Iterator<Item = (&RegisteredProvider, &Arc<dyn Plugin>)> {
        self.providers
            .iter()
            .flat_map(|rp| rp.plugins.iter().map(move |p| (rp, p)))
    }

    /// Whether the plugin initialized successfully.
    pub fn is_initialized(&self, plugin: &str) -> bool {
        self.initialized
            .read()
            .map(|set| set.contains(plugin))
            .unwrap_or(false)
    }

    /// Initialize every plugin against the cluster.
    ///
    /// Failures are logged and skipped; the failing plugin stays unavailable.
    /// Returns the number of plugins that initialized.
    pub async fn init(&self, client: &dyn ClusterClientTrait) -> usize {
        let ctx = PluginContext::background();
        let mut ready = Vec::new();

        for (registered, plugin) in self.plugins() {
            info!(
                "Initializing plugin {} ({}) of provider {}",
                plugin.name(),
                plugin.alias(),
                registered.provider.name()
            );
            match plugin.init(client, &registered.options, &ctx).await {
                Ok(()) => {
                    info!("Plugin {} initialized", plugin.name());
                    ready.push(plugin.name().to_string());
                }
                Err(e) => {
                    error!("Plugin {} failed to initialize, it will reject pods: {}", plugin.name(), e);
                }
            }
        }

        let count = ready.len();
        match self.initialized.write() {
            Ok(mut set) => set.extend(ready),
            Err(poisoned) => poisoned.into_inner().extend(ready),
        }
        count
    }

    /// Plugin responsible for the pod.
    ///
    /// - No `network-type` annotation: `Ok(None)`, the pod is not ours.
    /// - Unknown network type: `ParameterError`.
    /// - Plugin registered but not initialized: `InternalError`.
    pub fn find_available_plugin(&self, pod: &Pod) -> Result<Option<Arc<dyn Plugin>>, PluginError> {
        let Some(wanted) = network_type(pod) else {
            return Ok(None);
        };

        let Some((_, plugin)) = self.plugins().find(|(_, p)| p.name() == wanted) else {
            return Err(PluginError::Parameter(format!(
                "pod {} asks for network type {} which no registered provider offers",
                pod_key(pod),
                wanted
            )));
        };

        if !self.is_initialized(plugin.name()) {
            return Err(PluginError::Internal(format!(
                "plugin {} did not initialize",
                plugin.name()
            )));
        }

        debug!("Pod {} handled by plugin {}", pod_key(pod), plugin.name());
        Ok(Some(Arc::clone(plugin)))
    }

    /// Run `reconcile` on every initialized plugin concurrently.
    ///
    /// Returns the plugins that failed, with their errors.
    pub async fn reconcile_all(&self, client: &dyn ClusterClientTrait) -> Vec<(String, PluginError)> {
        let runs = self
            .plugins()
            .filter(|(_, p)| self.is_initialized(p.name()))
            .map(|(_, plugin)| async move {
                let result = plugin.reconcile(client).await;
                (plugin.name().to_string(), result)
            });

        let mut failures = Vec::new();
        for (name, result) in join_all(runs).await {
            match result {
                Ok(()) => debug!("Plugin {} reconciled", name),
                Err(e) => {
                    warn!("Plugin {} failed to reconcile: {}", name, e);
                    failures.push((name, e));
                }
            }
        }
        failures
    }
}
