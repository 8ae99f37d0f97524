//! Configuration for the slave transport.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::config::{in_range, millis, normalize};
use crate::error::{MbapError, Result};
use crate::transceiver::TransceiverConfig;

/// Default listening address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Default listening port.
pub const DEFAULT_BIND_PORT: u16 = 502;

/// Default number of transactions in flight across all connections.
pub const DEFAULT_PARALLEL: usize = 1024;

/// Default idle timeout of an accepted connection.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(30000);

/// Configuration for a [`SlaveTransport`](super::SlaveTransport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveConfig {
    /// Local address to listen on.
    pub address: String,
    /// Local port; 0 picks an ephemeral port.
    pub port: u16,
    /// Refuse to share the port (no `SO_REUSEADDR`).
    pub exclusive: bool,
    /// Listen on both IPv6 and IPv4 when bound to the wildcard address.
    pub dualstack: bool,
    /// Maximum number of simultaneous connections.
    pub max_connections: Option<usize>,
    /// Maximum number of transactions in flight across all connections.
    pub parallel: usize,
    /// Idle timeout applied to each connection.
    pub idle_timeout: Duration,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_BIND_PORT,
            exclusive: false,
            dualstack: true,
            max_connections: None,
            parallel: DEFAULT_PARALLEL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl SlaveConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_dualstack(mut self, dualstack: bool) -> Self {
        self.dualstack = dualstack;
        self
    }

    pub fn with_max_connections(mut self, max: Option<usize>) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Build a configuration from a JSON dictionary.
    ///
    /// Recognized keys: `bind.address`, `bind.port`, `exclusive`,
    /// `dualstack`, `max-connections`, `parallel` and `timeout.idle`
    /// (milliseconds). Every key is optional.
    pub fn from_json(value: &Value) -> Result<Self> {
        let raw: RawSlaveConfig = serde_json::from_value(normalize(value)?)?;
        let mut config = Self::default();

        if let Some(address) = raw.bind.address {
            config.address = address;
        }
        if let Some(port) = raw.bind.port {
            config.port = in_range("bind.port", port, 0, u16::MAX as u64)? as u16;
        }
        if let Some(exclusive) = raw.exclusive {
            config.exclusive = exclusive;
        }
        if let Some(dualstack) = raw.dualstack {
            config.dualstack = dualstack;
        }
        if let Some(max) = raw.max_connections {
            config.max_connections = Some(in_range("max-connections", max, 1, u32::MAX as u64)? as usize);
        }
        if let Some(parallel) = raw.parallel {
            config.parallel = in_range("parallel", parallel, 1, u32::MAX as u64)? as usize;
        }
        if let Some(ms) = raw.timeout.idle {
            config.idle_timeout = millis("timeout.idle", ms)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(MbapError::Configuration(
                "bind.address must not be empty".to_string(),
            ));
        }
        if self.max_connections == Some(0) {
            return Err(MbapError::Configuration(
                "max-connections must be positive".to_string(),
            ));
        }
        if self.parallel == 0 {
            return Err(MbapError::Configuration("parallel must be positive".to_string()));
        }
        if self.idle_timeout.is_zero() {
            return Err(MbapError::Configuration(
                "timeout.idle must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-connection transceiver settings: one frame of read-ahead.
    pub(crate) fn transceiver_config(&self) -> TransceiverConfig {
        TransceiverConfig::default()
            .with_rx_capacity(1)
            .with_idle_timeout(Some(self.idle_timeout))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawSlaveConfig {
    bind: RawBind,
    exclusive: Option<bool>,
    dualstack: Option<bool>,
    #[serde(rename = "max-connections")]
    max_connections: Option<u64>,
    parallel: Option<u64>,
    timeout: RawTimeouts,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawBind {
    address: Option<String>,
    port: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawTimeouts {
    idle: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = SlaveConfig::default();
        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.port, 502);
        assert!(!config.exclusive);
        assert!(config.dualstack);
        assert_eq!(config.max_connections, None);
        assert_eq!(config.parallel, 1024);
        assert_eq!(config.idle_timeout, Duration::from_millis(30000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_empty_is_default() {
        assert_eq!(SlaveConfig::from_json(&json!({})).unwrap(), SlaveConfig::default());
    }

    #[test]
    fn test_from_json_all_keys() {
        let config = SlaveConfig::from_json(&json!({
            "bind": {"address": "127.0.0.1", "port": 0},
            "exclusive": true,
            "dualstack": false,
            "max-connections": 3,
            "parallel": 2,
            "timeout.idle": 750
        }))
        .unwrap();
        assert_eq!(config.address, "127.0.0.1");
        assert_eq!(config.port, 0);
        assert!(config.exclusive);
        assert!(!config.dualstack);
        assert_eq!(config.max_connections, Some(3));
        assert_eq!(config.parallel, 2);
        assert_eq!(config.idle_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_from_json_rejects() {
        let cases = [
            json!({"bind.port": 65536}),
            json!({"max-connections": 0}),
            json!({"parallel": 0}),
            json!({"timeout": {"idle": 0}}),
            json!({"exclusive": "yes"}),
            json!({"bind": {"interface": "eth0"}}),
        ];
        for case in cases {
            let err = SlaveConfig::from_json(&case).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{}", case);
        }
    }

    #[test]
    fn test_transceiver_depth_is_one() {
        let config = SlaveConfig::default().with_idle_timeout(Duration::from_millis(10));
        let transceiver = config.transceiver_config();
        assert_eq!(transceiver.rx_capacity, 1);
        assert_eq!(transceiver.idle_timeout, Some(Duration::from_millis(10)));
    }
}
