//! Unit tests for the provider manager

use crate::config::{
    AlibabaCloudOptions, CloudProviderConfig, CloudProviderOptions, KubernetesOptions,
    PortPoolOptions,
};
use crate::context::PluginContext;
use crate::errors::{ErrorKind, PluginError};
use crate::manager::{ManagerError, ProviderManager};
use crate::plugin::{CloudProvider, Plugin};
use crate::plugins::alibabacloud::SLB_PLUGIN;
use crate::plugins::kubernetes::{HOST_PORT_PLUGIN, NODE_PORT_PLUGIN};
use crate::test_utils::test_pod;
use async_trait::async_trait;
use cluster_client::{ClusterClientTrait, MockClusterClient};
use k8s_openapi::api::core::v1::Pod;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct FakePlugin {
    name: String,
    fail_init: bool,
    reconciled: AtomicUsize,
}

impl FakePlugin {
    fn new(name: &str, fail_init: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail_init,
            reconciled: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Plugin for FakePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn alias(&self) -> &str {
        "fake"
    }

    async fn init(
        &self,
        _client: &dyn ClusterClientTrait,
        _options: &CloudProviderOptions,
        _ctx: &PluginContext,
    ) -> Result<(), PluginError> {
        if self.fail_init {
            return Err(PluginError::ApiCall("cloud API unreachable".to_string()));
        }
        Ok(())
    }

    async fn on_pod_added(
        &self,
        _client: &dyn ClusterClientTrait,
        pod: Pod,
        _ctx: &PluginContext,
    ) -> Result<Pod, PluginError> {
        Ok(pod)
    }

    async fn on_pod_updated(
        &self,
        _client: &dyn ClusterClientTrait,
        pod: Pod,
        _ctx: &PluginContext,
    ) -> Result<Pod, PluginError> {
        Ok(pod)
    }

    async fn on_pod_deleted(
        &self,
        _client: &dyn ClusterClientTrait,
        _pod: &Pod,
        _ctx: &PluginContext,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    async fn reconcile(&self, _client: &dyn ClusterClientTrait) -> Result<(), PluginError> {
        self.reconciled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeProvider {
    name: String,
    plugins: Vec<Arc<FakePlugin>>,
}

impl FakeProvider {
    fn new(name: &str, plugins: Vec<Arc<FakePlugin>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            plugins,
        })
    }
}

impl CloudProvider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_plugins(&self) -> Result<Vec<Arc<dyn Plugin>>, PluginError> {
        Ok(self
            .plugins
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn Plugin>)
            .collect())
    }
}

fn options() -> CloudProviderOptions {
    CloudProviderOptions::Kubernetes(KubernetesOptions::default())
}

#[test]
fn test_empty_provider_name_is_rejected() {
    let mut manager = ProviderManager::new();
    let err = manager
        .register_cloud_provider(FakeProvider::new("", vec![]), options())
        .unwrap_err();
    assert!(matches!(err, ManagerError::EmptyProviderName));
}

#[test]
fn test_reregistration_replaces_in_place() {
    let mut manager = ProviderManager::new();
    manager
        .register_cloud_provider(FakeProvider::new("A", vec![FakePlugin::new("A-1", false)]), options())
        .unwrap();
    manager
        .register_cloud_provider(FakeProvider::new("B", vec![FakePlugin::new("B-1", false)]), options())
        .unwrap();
    manager
        .register_cloud_provider(FakeProvider::new("A", vec![FakePlugin::new("A-2", false)]), options())
        .unwrap();

    assert_eq!(manager.provider_names(), vec!["A", "B"]);
    assert_eq!(manager.plugin_names(), vec!["A-2", "B-1"]);
}

#[test]
fn test_duplicate_plugin_names_are_rejected() {
    let mut manager = ProviderManager::new();
    manager
        .register_cloud_provider(FakeProvider::new("A", vec![FakePlugin::new("Shared", false)]), options())
        .unwrap();
    let err = manager
        .register_cloud_provider(FakeProvider::new("B", vec![FakePlugin::new("Shared", false)]), options())
        .unwrap_err();
    match err {
        ManagerError::DuplicatePlugin { plugin, existing, .. } => {
            assert_eq!(plugin, "Shared");
            assert_eq!(existing, "A");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(manager.provider_names(), vec!["A"]);
}

#[tokio::test]
async fn test_find_available_plugin() {
    let client = MockClusterClient::new();
    let mut manager = ProviderManager::new();
    manager
        .register_cloud_provider(
            FakeProvider::new(
                "A",
                vec![FakePlugin::new("Good", false), FakePlugin::new("Broken", true)],
            ),
            options(),
        )
        .unwrap();
    assert_eq!(manager.init(&client).await, 1);

    let mut plain = test_pod("plain", "", &[]);
    plain.metadata.annotations = None;
    assert!(manager.find_available_plugin(&plain).unwrap().is_none());

    let found = manager.find_available_plugin(&test_pod("gs-0", "Good", &[])).unwrap();
    assert_eq!(found.unwrap().name(), "Good");

    let err = manager
        .find_available_plugin(&test_pod("gs-0", "Broken", &[]))
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::InternalError);

    let err = manager
        .find_available_plugin(&test_pod("gs-0", "Missing", &[]))
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::ParameterError);
}

#[tokio::test]
async fn test_reconcile_all_skips_uninitialized_plugins() {
    let client = MockClusterClient::new();
    let good = FakePlugin::new("Good", false);
    let broken = FakePlugin::new("Broken", true);
    let mut manager = ProviderManager::new();
    manager
        .register_cloud_provider(FakeProvider::new("A", vec![good.clone(), broken.clone()]), options())
        .unwrap();
    manager.init(&client).await;

    assert!(manager.reconcile_all(&client).await.is_empty());
    assert_eq!(good.reconciled.load(Ordering::SeqCst), 1);
    assert_eq!(broken.reconciled.load(Ordering::SeqCst), 0);
}

#[test]
fn test_from_default_config() {
    let manager = ProviderManager::from_config(&CloudProviderConfig::default()).unwrap();
    assert_eq!(manager.provider_names(), vec!["Kubernetes"]);
    assert_eq!(manager.plugin_names(), vec![HOST_PORT_PLUGIN, NODE_PORT_PLUGIN]);
}

#[test]
fn test_from_config_skips_invalid_provider() {
    let config = CloudProviderConfig {
        kubernetes: KubernetesOptions {
            enable: false,
            ..Default::default()
        },
        alibabacloud: AlibabaCloudOptions {
            enable: true,
            slb: PortPoolOptions {
                min_port: 600,
                max_port: 500,
                block_ports: vec![],
            },
        },
    };
    let manager = ProviderManager::from_config(&config).unwrap();
    assert!(manager.provider_names().is_empty());

    let config = CloudProviderConfig {
        alibabacloud: AlibabaCloudOptions {
            enable: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let manager = ProviderManager::from_config(&config).unwrap();
    assert_eq!(manager.plugin_names(), vec![HOST_PORT_PLUGIN, NODE_PORT_PLUGIN, SLB_PLUGIN]);
}

#[tokio::test]
async fn test_built_in_plugins_initialize_against_empty_cluster() {
    let client = MockClusterClient::new();
    let config = CloudProviderConfig {
        alibabacloud: AlibabaCloudOptions {
            enable: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let manager = ProviderManager::from_config(&config).unwrap();
    assert_eq!(manager.init(&client).await, 3);
}
