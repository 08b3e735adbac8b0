//! Configuration for the Burrow tunnel runtime
//!
//! Hosts construct a [`TunnelConfig`] once and hand it to the registry; every
//! virtual socket reads its limits from there.

use core::time::Duration;

use crate::errors::{BurrowError, BurrowResult};

// ----------------------------------------------------------------------------
// Tunnel Configuration
// ----------------------------------------------------------------------------

/// Configuration for tunneled socket handling
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// The two destination ports tunneled connections may dial
    pub allowed_ports: [u16; 2],
    /// Maximum time to wait for an outbound TCP connection to establish
    pub connect_timeout: Duration,
    /// Idle time on an established connection before a Timeout message is
    /// relayed to the remote peer
    pub idle_timeout: Duration,
    /// Depth of the per-socket inbound write queue; a full queue suspends
    /// the dispatcher rather than dropping bytes
    pub write_queue_depth: usize,
    /// Read buffer size for draining the OS socket
    pub read_chunk_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            allowed_ports: [4001, 4002],
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            write_queue_depth: 32,
            read_chunk_size: 16 * 1024,
        }
    }
}

impl TunnelConfig {
    /// Validate the configuration
    pub fn validate(&self) -> BurrowResult<()> {
        if self.allowed_ports.contains(&0) {
            return Err(BurrowError::config_error("allowed port must be non-zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(BurrowError::config_error(
                "connect_timeout must be non-zero",
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(BurrowError::config_error("idle_timeout must be non-zero"));
        }
        if self.write_queue_depth == 0 {
            return Err(BurrowError::config_error(
                "write_queue_depth must be at least 1",
            ));
        }
        if self.read_chunk_size == 0 {
            return Err(BurrowError::config_error(
                "read_chunk_size must be at least 1",
            ));
        }
        Ok(())
    }

    /// Whether a destination port is on the allow-list
    pub fn is_port_allowed(&self, port: u16) -> bool {
        self.allowed_ports.contains(&port)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TunnelConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.is_port_allowed(4001));
        assert!(config.is_port_allowed(4002));
        assert!(!config.is_port_allowed(22));
    }

    #[test]
    fn test_zero_port_rejected() {
        let config = TunnelConfig {
            allowed_ports: [0, 4002],
            ..TunnelConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        let config = TunnelConfig {
            write_queue_depth: 0,
            ..TunnelConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
