//! Configuration for the master transport.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::allocator::ID_SPACE;
use crate::config::{in_range, millis, normalize};
use crate::error::{MbapError, Result};
use crate::transceiver::TransceiverConfig;

/// Default slave TCP port.
pub const DEFAULT_PORT: u16 = 502;

/// Default connect timeout.
pub const DEFAULT_ESTABLISH_TIMEOUT: Duration = Duration::from_millis(6000);

/// Default idle timeout of a connection.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(30000);

/// Default delay between a failed connect and the next attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Configuration for a [`MasterTransport`](super::MasterTransport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterConfig {
    /// Slave host name or address.
    pub host: String,
    /// Slave TCP port.
    pub port: u16,
    /// Connect timeout.
    pub establish_timeout: Duration,
    /// Idle timeout applied to each connection.
    pub idle_timeout: Duration,
    /// Delay before reconnecting after a failed attempt.
    pub retry_delay: Duration,
    /// Maximum number of in-flight queries per connection.
    pub parallel: usize,
}

impl MasterConfig {
    /// Create a configuration for the slave at `host` with default settings.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            establish_timeout: DEFAULT_ESTABLISH_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            parallel: ID_SPACE,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_establish_timeout(mut self, timeout: Duration) -> Self {
        self.establish_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    /// Build a configuration from a JSON dictionary.
    ///
    /// Recognized keys: `slave.host` (required), `slave.port`,
    /// `timeout.establish`, `timeout.idle`, `timeout.retry` (milliseconds)
    /// and `parallel`. Nested objects and dotted keys are both accepted.
    pub fn from_json(value: &Value) -> Result<Self> {
        let raw: RawMasterConfig = serde_json::from_value(normalize(value)?)?;

        let host = raw
            .slave
            .host
            .ok_or_else(|| MbapError::Configuration("slave.host is required".to_string()))?;
        let mut config = Self::new(host);

        if let Some(port) = raw.slave.port {
            config.port = in_range("slave.port", port, 1, u16::MAX as u64)? as u16;
        }
        if let Some(ms) = raw.timeout.establish {
            config.establish_timeout = millis("timeout.establish", ms)?;
        }
        if let Some(ms) = raw.timeout.idle {
            config.idle_timeout = millis("timeout.idle", ms)?;
        }
        if let Some(ms) = raw.timeout.retry {
            config.retry_delay = millis("timeout.retry", ms)?;
        }
        if let Some(parallel) = raw.parallel {
            config.parallel = in_range("parallel", parallel, 1, ID_SPACE as u64)? as usize;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(MbapError::Configuration(
                "slave.host must not be empty".to_string(),
            ));
        }
        in_range("slave.port", self.port as u64, 1, u16::MAX as u64)?;
        for (key, duration) in [
            ("timeout.establish", self.establish_timeout),
            ("timeout.idle", self.idle_timeout),
            ("timeout.retry", self.retry_delay),
        ] {
            if duration.is_zero() {
                return Err(MbapError::Configuration(format!("{} must be positive", key)));
            }
        }
        in_range("parallel", self.parallel as u64, 1, ID_SPACE as u64)?;
        Ok(())
    }

    pub(crate) fn transceiver_config(&self) -> TransceiverConfig {
        TransceiverConfig::default().with_idle_timeout(Some(self.idle_timeout))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawMasterConfig {
    slave: RawEndpoint,
    timeout: RawTimeouts,
    parallel: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawEndpoint {
    host: Option<String>,
    port: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawTimeouts {
    establish: Option<u64>,
    idle: Option<u64>,
    retry: Option<u64>,
}
