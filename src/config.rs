//! Connection configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Heartbeat settings for a [`Connection`](crate::Connection).
///
/// The owning process refreshes its heartbeat every `heartbeat_interval`;
/// other processes consider the connection dead once `heartbeat_ttl` has
/// passed without a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// How often the heartbeat task refreshes the liveness marker
    pub heartbeat_interval: Duration,
    /// Expiry of the liveness marker
    pub heartbeat_ttl: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_ttl: Duration::from_secs(60),
        }
    }
}

impl ConnectionConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    /// A refresh interval at or beyond the TTL lets a healthy connection look
    /// dead between two refreshes.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Configuration(
                "heartbeat_interval must be > 0".into(),
            ));
        }
        if self.heartbeat_interval >= self.heartbeat_ttl {
            return Err(Error::Configuration(format!(
                "heartbeat_interval ({:?}) must be shorter than heartbeat_ttl ({:?})",
                self.heartbeat_interval, self.heartbeat_ttl
            )));
        }
        Ok(())
    }
}
