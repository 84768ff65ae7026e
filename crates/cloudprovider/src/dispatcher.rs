//! Plugin Dispatcher
//!
//! Resolves the plugin for a pod, runs the lifecycle method matching the
//! admission operation on its own task and stops waiting after a timeout.
//!
//! A timed-out task is detached, not aborted: its cache and cluster side
//! effects still land after the caller has moved on with the original pod.
//! The dispatcher never retries; the next admission or watch event does.

use crate::context::PluginContext;
use crate::errors::PluginError;
use crate::manager::ProviderManager;
use cluster_client::{ClusterClientTrait, EventType};
use k8s_openapi::api::core::v1::Pod;
use network_api::pod_key;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default bound on one lifecycle call
pub const DEFAULT_PLUGIN_TIMEOUT: Duration = Duration::from_secs(8);

/// Admission operation being handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOperation {
    /// Pod create
    Create,
    /// Pod update
    Update,
    /// Pod delete
    Delete,
}

impl fmt::Display for AdmissionOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionOperation::Create => f.write_str("create"),
            AdmissionOperation::Update => f.write_str("update"),
            AdmissionOperation::Delete => f.write_str("delete"),
        }
    }
}

/// Result of dispatching one admission operation
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Pod does not ask for network management
    NoPlugin,
    /// Plugin succeeded and changed the pod
    Mutated(Box<Pod>),
    /// Plugin succeeded (or does not implement the operation) without changes
    Unchanged,
    /// Plugin failed, the pod must be used as it was
    Failed(PluginError),
    /// Plugin did not answer in time, it keeps running in the background
    TimedOut,
}

impl DispatchOutcome {
    /// The pod to admit: the mutated one, or `original` for every other outcome.
    pub fn into_pod(self, original: Pod) -> Pod {
        match self {
            DispatchOutcome::Mutated(pod) => *pod,
            _ => original,
        }
    }
}

/// Runs plugin lifecycle calls for admission operations
#[derive(Clone)]
pub struct Dispatcher {
    manager: Arc<ProviderManager>,
    client: Arc<dyn ClusterClientTrait>,
    timeout: Duration,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("manager", &self.manager)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Dispatcher with the default timeout.
    pub fn new(manager: Arc<ProviderManager>, client: Arc<dyn ClusterClientTrait>) -> Self {
        Self {
            manager,
            client,
            timeout: DEFAULT_PLUGIN_TIMEOUT,
        }
    }

    /// Override the per-call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Per-call timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Handle one admission operation for `pod`.
    pub async fn dispatch(&self, operation: AdmissionOperation, pod: &Pod) -> DispatchOutcome {
        let key = pod_key(pod);
        let plugin = match self.manager.find_available_plugin(pod) {
            Ok(Some(plugin)) => plugin,
            Ok(None) => return DispatchOutcome::NoPlugin,
            Err(e) => {
                warn!("No usable plugin for pod {}: {}", key, e);
                self.record(pod, EventType::Warning, &e).await;
                return DispatchOutcome::Failed(e);
            }
        };

        debug!("Dispatching {} of pod {} to plugin {}", operation, key, plugin.name());

        let ctx = PluginContext::with_timeout(self.timeout);
        let client = Arc::clone(&self.client);
        let task_pod = pod.clone();
        let task = tokio::spawn(async move {
            let client = client.as_ref();
            match operation {
                AdmissionOperation::Create => plugin.on_pod_added(client, task_pod, &ctx).await.map(Some),
                AdmissionOperation::Update => plugin.on_pod_updated(client, task_pod, &ctx).await.map(Some),
                AdmissionOperation::Delete => plugin.on_pod_deleted(client, &task_pod, &ctx).await.map(|_| None),
            }
        });

        let result = match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                warn!(
                    "Plugin call for {} of pod {} timed out after {:?}, letting the pod through unchanged",
                    operation, key, self.timeout
                );
                return DispatchOutcome::TimedOut;
            }
            Ok(Err(join_error)) => Err(PluginError::Internal(format!(
                "plugin task for pod {} failed: {}",
                key, join_error
            ))),
            Ok(Ok(result)) => result,
        };

        match result {
            Ok(Some(mutated)) if mutated != *pod => {
                info!("Plugin handled {} of pod {}", operation, key);
                DispatchOutcome::Mutated(Box::new(mutated))
            }
            Ok(_) => {
                debug!("Plugin handled {} of pod {} without changes", operation, key);
                DispatchOutcome::Unchanged
            }
            Err(e @ PluginError::NotImplemented(_)) => {
                info!("Plugin does not implement {} for pod {}: {}", operation, key, e);
                self.record(pod, EventType::Normal, &e).await;
                DispatchOutcome::Unchanged
            }
            Err(e) => {
                error!("Plugin failed {} of pod {}: {}", operation, key, e);
                self.record(pod, EventType::Warning, &e).await;
                DispatchOutcome::Failed(e)
            }
        }
    }

    async fn record(&self, pod: &Pod, event_type: EventType, err: &PluginError) {
        let reason = err.kind().to_string();
        if let Err(e) = self
            .client
            .record_pod_event(pod, event_type, &reason, &err.to_string())
            .await
        {
            warn!("Failed to record event for pod {}: {}", pod_key(pod), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CloudProviderOptions, KubernetesOptions};
    use crate::plugin::{CloudProvider, Plugin};
    use async_trait::async_trait;
    use cluster_client::MockClusterClient;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use network_api::{pod_annotation, set_pod_annotation, NETWORK_TYPE_ANNOTATION};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plugin whose behavior is picked by the pod name
    #[derive(Default)]
    struct ScriptedPlugin {
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for ScriptedPlugin {
        fn name(&self) -> &str {
            "Scripted"
        }

        fn alias(&self) -> &str {
            "scripted"
        }

        async fn init(
            &self,
            _client: &dyn ClusterClientTrait,
            _options: &CloudProviderOptions,
            _ctx: &PluginContext,
        ) -> Result<(), PluginError> {
            Ok(())
        }

        async fn on_pod_added(
            &self,
            _client: &dyn ClusterClientTrait,
            mut pod: Pod,
            _ctx: &PluginContext,
        ) -> Result<Pod, PluginError> {
            match pod.metadata.name.as_deref() {
                Some("slow") => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    self.finished.fetch_add(1, Ordering::SeqCst);
                    Ok(pod)
                }
                Some("exhausted") => Err(PluginError::PortExhausted("node-A".to_string())),
                _ => {
                    set_pod_annotation(&mut pod, "touched", "yes".to_string());
                    Ok(pod)
                }
            }
        }

        async fn on_pod_updated(
            &self,
            _client: &dyn ClusterClientTrait,
            _pod: Pod,
            _ctx: &PluginContext,
        ) -> Result<Pod, PluginError> {
            Err(PluginError::NotImplemented("update".to_string()))
        }

        async fn on_pod_deleted(
            &self,
            _client: &dyn ClusterClientTrait,
            _pod: &Pod,
            _ctx: &PluginContext,
        ) -> Result<(), PluginError> {
            Ok(())
        }
    }

    struct ScriptedProvider(Arc<ScriptedPlugin>);

    impl CloudProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "Scripted"
        }

        fn list_plugins(&self) -> Result<Vec<Arc<dyn Plugin>>, PluginError> {
            Ok(vec![self.0.clone() as Arc<dyn Plugin>])
        }
    }

    fn pod(name: &str, network_type: Option<&str>) -> Pod {
        let mut pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        if let Some(t) = network_type {
            set_pod_annotation(&mut pod, NETWORK_TYPE_ANNOTATION, t.to_string());
        }
        pod
    }

    async fn setup() -> (Dispatcher, MockClusterClient, Arc<ScriptedPlugin>) {
        let plugin = Arc::new(ScriptedPlugin::default());
        let mut manager = ProviderManager::new();
        manager
            .register_cloud_provider(
                Arc::new(ScriptedProvider(plugin.clone())),
                CloudProviderOptions::Kubernetes(KubernetesOptions::default()),
            )
            .unwrap();
        let client = MockClusterClient::new();
        manager.init(&client).await;
        let dispatcher = Dispatcher::new(Arc::new(manager), Arc::new(client.clone()));
        (dispatcher, client, plugin)
    }

    #[tokio::test]
    async fn test_pod_without_network_type_is_skipped() {
        let (dispatcher, _, _) = setup().await;
        let outcome = dispatcher.dispatch(AdmissionOperation::Create, &pod("plain", None)).await;
        assert!(matches!(outcome, DispatchOutcome::NoPlugin));
    }

    #[tokio::test]
    async fn test_mutated_pod_is_returned() {
        let (dispatcher, _, _) = setup().await;
        let original = pod("gs-0", Some("Scripted"));
        let admitted = dispatcher
            .dispatch(AdmissionOperation::Create, &original)
            .await
            .into_pod(original);
        assert_eq!(pod_annotation(&admitted, "touched"), Some("yes"));
    }

    #[tokio::test]
    async fn test_failure_keeps_original_and_records_warning() {
        let (dispatcher, client, _) = setup().await;
        let original = pod("exhausted", Some("Scripted"));
        let outcome = dispatcher.dispatch(AdmissionOperation::Create, &original).await;
        assert!(matches!(outcome, DispatchOutcome::Failed(PluginError::PortExhausted(_))));
        assert_eq!(outcome.into_pod(original.clone()), original);

        let events = client.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Warning);
        assert_eq!(events[0].reason, "PortExhausted");
    }

    #[tokio::test]
    async fn test_unknown_network_type_fails() {
        let (dispatcher, client, _) = setup().await;
        let outcome = dispatcher
            .dispatch(AdmissionOperation::Create, &pod("gs-0", Some("Nope")))
            .await;
        assert!(matches!(outcome, DispatchOutcome::Failed(PluginError::Parameter(_))));
        assert_eq!(client.events()[0].reason, "ParameterError");
    }

    #[tokio::test]
    async fn test_not_implemented_is_success_with_event() {
        let (dispatcher, client, _) = setup().await;
        let outcome = dispatcher
            .dispatch(AdmissionOperation::Update, &pod("gs-0", Some("Scripted")))
            .await;
        assert!(matches!(outcome, DispatchOutcome::Unchanged));
        assert_eq!(client.events()[0].event_type, EventType::Normal);
        assert_eq!(client.events()[0].reason, "NotImplementedError");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_call_keeps_running() {
        let (dispatcher, _, plugin) = setup().await;
        let outcome = dispatcher
            .dispatch(AdmissionOperation::Create, &pod("slow", Some("Scripted")))
            .await;
        assert!(matches!(outcome, DispatchOutcome::TimedOut));
        assert_eq!(plugin.finished.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(plugin.finished.load(Ordering::SeqCst), 1);
    }
}
