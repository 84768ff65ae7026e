//! Cluster client for game-server network plugins
//!
//! A narrow view of the Kubernetes API: the pods, nodes, services and events
//! a network plugin reads or writes. Plugins depend on
//! [`ClusterClientTrait`] only, so the same code runs against a live cluster
//! ([`KubeClusterClient`]) or an in-memory one ([`MockClusterClient`], behind
//! the `test-util` feature).
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{ClusterClientTrait, KubeClusterClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubeClusterClient::try_default(None).await?;
//! let services = client.list_services("game.kruise.io/network-plugin=AlibabaCloud-SLB").await?;
//! println!("{} plugin services", services.len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubeClusterClient;
pub use cluster_trait::{ClusterClientTrait, EventType};
pub use error::ClusterError;
#[cfg(feature = "test-util")]
pub use mock::{MockClusterClient, RecordedEvent};

/// Whether `labels` satisfies an equality selector `k=v,k2=v2`.
///
/// An empty selector matches everything.
pub fn selector_matches(
    labels: Option<&std::collections::BTreeMap<String, String>>,
    selector: &str,
) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k.trim())).is_some_and(|lv| lv == v.trim()),
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}
