//! Main controller implementation.
//!
//! Builds the provider manager from the config file, initializes its
//! plugins, then runs two background tasks: the pod watcher and a periodic
//! resync rebuilding each plugin's cache from the cluster.

use crate::error::ControllerError;
use crate::handler::PodHandler;
use crate::settings::Settings;
use crate::watcher::Watcher;
use cloudprovider::{CloudProviderConfig, Dispatcher, ProviderManager};
use cluster_client::{ClusterClientTrait, KubeClusterClient};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Main controller for game-server networking.
#[derive(Debug)]
pub struct Controller {
    pod_watcher: JoinHandle<Result<(), ControllerError>>,
    resync: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(settings: Settings) -> Result<Self, ControllerError> {
        info!("Initializing network manager");

        let config = CloudProviderConfig::load(&settings.config_path)?;
        let manager = ProviderManager::from_config(&config)?;

        let kube_client = Client::try_default().await?;
        let client: Arc<dyn ClusterClientTrait> = Arc::new(KubeClusterClient::new(
            kube_client.clone(),
            settings.namespace.clone(),
        ));

        let ready = manager.init(client.as_ref()).await;
        info!(
            "{} of {} plugins ready: {:?}",
            ready,
            manager.plugin_names().len(),
            manager.plugin_names()
        );
        let manager = Arc::new(manager);

        let pod_api: Api<Pod> = match &settings.namespace {
            Some(ns) => Api::namespaced(kube_client, ns),
            None => Api::all(kube_client),
        };
        let dispatcher = Dispatcher::new(Arc::clone(&manager), Arc::clone(&client))
            .with_timeout(settings.plugin_timeout);
        let handler = PodHandler::new(dispatcher, Arc::clone(&client));

        let watcher = Watcher::new(handler, pod_api);
        let pod_watcher = tokio::spawn(async move { watcher.watch_pods().await });

        let resync_interval = settings.resync_interval;
        let resync = tokio::spawn(async move { resync_loop(manager, client, resync_interval).await });

        Ok(Self { pod_watcher, resync })
    }

    /// Runs the controller until a task stops.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("Network manager running");

        tokio::select! {
            result = self.pod_watcher => {
                result.map_err(|e| ControllerError::TaskStopped(format!("pod watcher: {}", e)))?
            }
            result = self.resync => {
                result.map_err(|e| ControllerError::TaskStopped(format!("resync: {}", e)))?
            }
        }
    }
}

/// Rebuild plugin caches from the cluster every `interval`.
async fn resync_loop(
    manager: Arc<ProviderManager>,
    client: Arc<dyn ClusterClientTrait>,
    interval: Duration,
) -> Result<(), ControllerError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // init already rebuilt the caches
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let failures = manager.reconcile_all(client.as_ref()).await;
        if failures.is_empty() {
            debug!("Resynced plugin caches");
        }
        for (plugin, e) in failures {
            warn!("Resync of plugin {} failed: {}", plugin, e);
        }
    }
}
