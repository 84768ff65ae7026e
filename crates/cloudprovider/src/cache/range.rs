//! Port ranges handed to the allocation cache.

use crate::config::PortPoolOptions;
use std::collections::BTreeSet;

/// Inclusive port range minus blocked ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRange {
    min: u16,
    max: u16,
    blocked: BTreeSet<u16>,
}

impl PortRange {
    /// Range `[min, max]` with `blocked` ports removed.
    pub fn new(min: u16, max: u16, blocked: impl IntoIterator<Item = u16>) -> Self {
        Self {
            min,
            max,
            blocked: blocked.into_iter().collect(),
        }
    }

    /// Whether `port` may be handed out.
    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port) && !self.blocked.contains(&port)
    }

    /// Usable ports, lowest first.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (self.min..=self.max).filter(|p| !self.blocked.contains(p))
    }

    /// Number of usable ports.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// No usable port at all.
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl From<&PortPoolOptions> for PortRange {
    fn from(o: &PortPoolOptions) -> Self {
        PortRange::new(o.min_port, o.max_port, o.block_ports.iter().copied())
    }
}
