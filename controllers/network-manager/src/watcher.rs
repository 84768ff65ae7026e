//! Pod watcher.
//!
//! Feeds every pod event into the [`PodHandler`]. The watch stream survives
//! API errors: each error pauses the stream for a Fibonacci backoff, and the
//! next successful event resets it.

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;
use crate::handler::PodHandler;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube_runtime::watcher;
use network_api::pod_key;
use tracing::{debug, error, info, warn};

/// Watches pods and hands their events to a handler.
pub struct Watcher {
    handler: PodHandler,
    pod_api: Api<Pod>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(handler: PodHandler, pod_api: Api<Pod>) -> Self {
        Self { handler, pod_api }
    }

    /// Watch pods until the stream ends.
    pub async fn watch_pods(&self) -> Result<(), ControllerError> {
        info!("Starting pod watcher");

        let mut backoff = FibonacciBackoff::default();
        let mut stream = Box::pin(watcher(self.pod_api.clone(), watcher::Config::default()));

        while let Some(result) = stream.next().await {
            let event = match result {
                Ok(event) => {
                    backoff.reset();
                    event
                }
                Err(e) => {
                    let delay = backoff.next_backoff();
                    warn!("Pod watch error, resuming in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            match event {
                watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                    self.applied(&pod).await;
                }
                watcher::Event::Delete(pod) => {
                    debug!("Pod deleted: {}", pod_key(&pod));
                    self.handler.on_deleted(&pod).await;
                }
                watcher::Event::Init => {
                    info!("Pod watcher initialized");
                }
                watcher::Event::InitDone => {
                    info!("Pod watcher initialization complete");
                }
            }
        }

        Err(ControllerError::TaskStopped("pod watch stream ended".to_string()))
    }

    async fn applied(&self, pod: &Pod) {
        if let Err(e) = self.handler.on_applied(pod).await {
            error!("Failed to update pod {}: {}", pod_key(pod), e);
        }
    }
}
