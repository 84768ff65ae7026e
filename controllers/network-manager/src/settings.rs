//! Environment configuration.

use crate::error::ControllerError;
use cloudprovider::DEFAULT_PLUGIN_TIMEOUT;
use std::path::PathBuf;
use std::time::Duration;

/// Default location of the cloud provider config file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/network-manager/config.yaml";

/// Default cache resync period
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Settings read from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// `CLOUD_PROVIDER_CONFIG`
    pub config_path: PathBuf,
    /// `WATCH_NAMESPACE`, all namespaces when unset
    pub namespace: Option<String>,
    /// `PLUGIN_TIMEOUT_SECONDS`
    pub plugin_timeout: Duration,
    /// `RESYNC_INTERVAL_SECONDS`
    pub resync_interval: Duration,
}

impl Settings {
    /// Read the settings from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the settings through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let config_path = lookup("CLOUD_PROVIDER_CONFIG")
            .filter(|p| !p.is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
        let namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty());
        let plugin_timeout = seconds(&lookup, "PLUGIN_TIMEOUT_SECONDS", DEFAULT_PLUGIN_TIMEOUT)?;
        let resync_interval = seconds(&lookup, "RESYNC_INTERVAL_SECONDS", DEFAULT_RESYNC_INTERVAL)?;

        Ok(Self {
            config_path,
            namespace,
            plugin_timeout,
            resync_interval,
        })
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ControllerError> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(ControllerError::InvalidConfig(format!(
            "{} must be a positive number of seconds, got {:?}",
            key, raw
        ))),
        Ok(secs) => Ok(Duration::from_secs(secs)),
    }
}
