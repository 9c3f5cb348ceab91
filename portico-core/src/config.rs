//! Protocol handler configuration
//!
//! ```rust
//! use portico_core::config::ProtocolConfig;
//! use std::time::Duration;
//!
//! let config = ProtocolConfig::new()
//!     .processor_cache(Some(500))
//!     .async_timeout(Duration::from_secs(10))
//!     .max_keep_alive_requests(Some(50));
//!
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a protocol handler and the processors it creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    // Processor pooling
    /// Idle processors kept for reuse (`None` = unlimited, `Some(0)` = none)
    pub processor_cache: Option<usize>,

    // Async processing
    /// Default suspend timeout for async requests (zero disables)
    pub async_timeout: Duration,
    /// How often the async timeout sweep runs
    pub timeout_sweep_interval: Duration,

    // HTTP/1.1
    /// Requests served on one connection before closing (`None` = unlimited)
    pub max_keep_alive_requests: Option<u32>,
    /// Idle time allowed between requests on a persistent connection
    pub keep_alive_timeout: Duration,
    /// Time allowed for reading a request body
    pub connection_upload_timeout: Duration,
    /// Largest request head accepted
    pub max_http_header_size: usize,
    /// Honour `Upgrade:` requests
    pub allow_upgrade: bool,

    // AJP
    /// AJP packet size in bytes
    pub ajp_packet_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            processor_cache: Some(200),

            async_timeout: Duration::from_secs(30),
            timeout_sweep_interval: Duration::from_secs(1),

            max_keep_alive_requests: Some(100),
            keep_alive_timeout: Duration::from_secs(60),
            connection_upload_timeout: Duration::from_secs(300),
            max_http_header_size: 8 * 1024,
            allow_upgrade: true,

            ajp_packet_size: 8192,
        }
    }
}

impl ProtocolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config optimized for high throughput.
    pub fn high_throughput() -> Self {
        Self {
            processor_cache: Some(1000),
            max_keep_alive_requests: None,
            keep_alive_timeout: Duration::from_secs(120),
            max_http_header_size: 16 * 1024,
            ..Default::default()
        }
    }

    /// Create config optimized for low memory.
    pub fn low_memory() -> Self {
        Self {
            processor_cache: Some(20),
            max_keep_alive_requests: Some(20),
            keep_alive_timeout: Duration::from_secs(15),
            max_http_header_size: 4 * 1024,
            ..Default::default()
        }
    }

    pub fn processor_cache(mut self, cache: Option<usize>) -> Self {
        self.processor_cache = cache;
        self
    }

    pub fn async_timeout(mut self, timeout: Duration) -> Self {
        self.async_timeout = timeout;
        self
    }

    pub fn timeout_sweep_interval(mut self, interval: Duration) -> Self {
        self.timeout_sweep_interval = interval;
        self
    }

    pub fn max_keep_alive_requests(mut self, max: Option<u32>) -> Self {
        self.max_keep_alive_requests = max;
        self
    }

    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    pub fn connection_upload_timeout(mut self, timeout: Duration) -> Self {
        self.connection_upload_timeout = timeout;
        self
    }

    pub fn max_http_header_size(mut self, size: usize) -> Self {
        self.max_http_header_size = size;
        self
    }

    pub fn allow_upgrade(mut self, allow: bool) -> Self {
        self.allow_upgrade = allow;
        self
    }

    pub fn ajp_packet_size(mut self, size: usize) -> Self {
        self.ajp_packet_size = size;
        self
    }

    /// Async timeout in milliseconds as stored on processors (`-1` disabled).
    pub fn async_timeout_millis(&self) -> i64 {
        if self.async_timeout.is_zero() {
            -1
        } else {
            self.async_timeout.as_millis() as i64
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_sweep_interval.is_zero() {
            return Err(Error::Config(
                "timeout_sweep_interval must be greater than zero".to_string(),
            ));
        }
        if self.max_http_header_size == 0 {
            return Err(Error::Config(
                "max_http_header_size must be greater than zero".to_string(),
            ));
        }
        if !(8192..=65536).contains(&self.ajp_packet_size) {
            return Err(Error::Config(format!(
                "ajp_packet_size {} outside 8192..=65536",
                self.ajp_packet_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProtocolConfig::default();
        assert_eq!(config.processor_cache, Some(200));
        assert_eq!(config.async_timeout, Duration::from_secs(30));
        assert_eq!(config.timeout_sweep_interval, Duration::from_secs(1));
        assert_eq!(config.max_keep_alive_requests, Some(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ProtocolConfig::new()
            .processor_cache(None)
            .async_timeout(Duration::ZERO)
            .allow_upgrade(false);

        assert_eq!(config.processor_cache, None);
        assert_eq!(config.async_timeout_millis(), -1);
        assert!(!config.allow_upgrade);
    }

    #[test]
    fn test_presets() {
        assert!(ProtocolConfig::high_throughput().validate().is_ok());
        assert!(ProtocolConfig::low_memory().validate().is_ok());
        assert_eq!(
            ProtocolConfig::high_throughput().max_keep_alive_requests,
            None
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ProtocolConfig::new().timeout_sweep_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ProtocolConfig::new().ajp_packet_size(1024);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ProtocolConfig =
            serde_json::from_str(r#"{"processor_cache": null, "allow_upgrade": false}"#).unwrap();
        assert_eq!(config.processor_cache, None);
        assert!(!config.allow_upgrade);
        assert_eq!(config.ajp_packet_size, 8192);
    }
}
