//! Game-Server Network API
//!
//! The annotation contract shared by the network plugins, the dispatcher and
//! anything that reads pod readiness:
//!
//! - `game.kruise.io/network-type` selects the plugin
//! - `game.kruise.io/network-conf` carries plugin parameters
//! - `game.kruise.io/network-status` is written back by the plugin
//!
//! # Example
//!
//! ```
//! use network_api::{NetworkConf, NetworkStatus, NetworkState};
//!
//! let conf = NetworkConf::parse(r#"[{"name":"PortProtocols","value":"80/TCP,7777/UDP"}]"#).unwrap();
//! assert_eq!(conf.get("PortProtocols"), Some("80/TCP,7777/UDP"));
//!
//! let status = NetworkStatus::waiting();
//! assert_eq!(status.current_network_state, NetworkState::Waiting);
//! ```

pub mod annotations;
pub mod conf;
pub mod error;
pub mod status;

pub use annotations::*;
pub use conf::*;
pub use error::NetworkApiError;
pub use status::*;
