//! Per-call context handed to plugin lifecycle methods.

use crate::errors::PluginError;
use std::time::Duration;
use tokio::time::Instant;

/// Deadline of one lifecycle call
///
/// The dispatcher stops waiting at the deadline but does not abort the
/// plugin. Plugins call [`PluginContext::ensure_active`] before each external
/// API call so abandoned work winds down instead of piling up.
#[derive(Debug, Clone, Copy)]
pub struct PluginContext {
    deadline: Option<Instant>,
}

impl PluginContext {
    /// Context without a deadline (init, resync).
    pub fn background() -> Self {
        Self { deadline: None }
    }

    /// Context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Time left, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    /// Fails with an `ApiCall` error once the deadline has passed.
    pub fn ensure_active(&self, step: &str) -> Result<(), PluginError> {
        if self.is_expired() {
            return Err(PluginError::ApiCall(format!(
                "deadline exceeded before {}",
                step
            )));
        }
        Ok(())
    }
}

impl Default for PluginContext {
    fn default() -> Self {
        Self::background()
    }
}
