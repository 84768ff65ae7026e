//! Cloud Provider Plugin Framework
//!
//! Gives game-server pods network connectivity through pluggable network
//! types. The moving parts, leaves first:
//!
//! - [`cache::AllocationCache`]: per-key port allocation with owner tracking
//! - [`plugin::Plugin`]: one network type (host ports, node ports, shared SLB)
//! - [`plugin::CloudProvider`]: a family of plugins sharing options
//! - [`ProviderManager`]: registry resolving a pod's `network-type` to a plugin
//! - [`Dispatcher`]: runs a plugin lifecycle call under a timeout
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cloudprovider::{AdmissionOperation, CloudProviderConfig, Dispatcher, ProviderManager};
//! use cluster_client::KubeClusterClient;
//!
//! # async fn example(pod: k8s_openapi::api::core::v1::Pod) -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(KubeClusterClient::try_default(None).await?);
//! let manager = ProviderManager::from_config(&CloudProviderConfig::load("config.yaml")?)?;
//! manager.init(client.as_ref()).await;
//!
//! let dispatcher = Dispatcher::new(Arc::new(manager), client);
//! let admitted = dispatcher
//!     .dispatch(AdmissionOperation::Create, &pod)
//!     .await
//!     .into_pod(pod);
//! # let _ = admitted;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod manager;
pub mod plugin;
pub mod plugins;
pub mod status;

#[cfg(test)]
mod manager_test;
#[cfg(test)]
mod test_utils;

pub use cache::{AllocationCache, AllocationRecord, CacheError, Owner, PortRange, ReconcileSummary};
pub use config::{
    AlibabaCloudOptions, CloudProviderConfig, CloudProviderOptions, ConfigError, KubernetesOptions,
    PortPoolOptions,
};
pub use context::PluginContext;
pub use dispatcher::{AdmissionOperation, DispatchOutcome, Dispatcher, DEFAULT_PLUGIN_TIMEOUT};
pub use errors::{ErrorKind, PluginError};
pub use manager::{ManagerError, ProviderManager};
pub use plugin::{CloudProvider, Plugin};
pub use status::{converge, next_status, Observation};
