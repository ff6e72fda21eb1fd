//! Session configuration.
//!
//! Provides a type-safe interface for the broker endpoint and the bounds of
//! the connect handshake.
//!
//! # Example
//!
//! ```ignore
//! use bridge_session::SessionConfig;
//!
//! let config = SessionConfig::new()
//!     .with_endpoint("192.168.1.20", 9090)
//!     .with_connect_attempts(20)
//!     .with_connect_backoff_ms(50);
//!
//! config.validate()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default broker host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default rosbridge port.
pub const DEFAULT_PORT: u16 = 9090;

/// Default number of liveness polls after the handshake starts.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;

/// Default pause between liveness polls.
pub const DEFAULT_CONNECT_BACKOFF_MS: u64 = 100;

/// Default timeout for the WebSocket handshake itself.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Default timeout for service calls.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// Endpoint
// ============================================================================

/// Broker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port (1-65535).
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    #[inline]
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Validates the endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the host is blank or the port is zero.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::config("Host must not be empty"));
        }
        if self.port == 0 {
            return Err(Error::config("Port must be between 1 and 65535"));
        }
        Ok(())
    }

    /// Returns the WebSocket URL for this endpoint.
    ///
    /// Format: `ws://{host}:{port}`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`] if the host is not a valid URL host.
    pub fn ws_url(&self) -> Result<Url> {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        Ok(Url::parse(&format!("ws://{host}:{}", self.port))?)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ============================================================================
// RetryPolicy
// ============================================================================

/// Bounds of the post-handshake liveness poll.
///
/// The session sleeps between polls but not after the last one, so
/// `connect` waits at most `(max_attempts - 1) * backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of liveness polls.
    pub max_attempts: u32,
    /// Pause between polls.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Returns the worst-case wait.
    #[inline]
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.backoff
            .saturating_mul(self.max_attempts.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_CONNECT_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_CONNECT_BACKOFF_MS),
        }
    }
}

// ============================================================================
// SessionConfig
// ============================================================================

/// Session configuration.
///
/// Deserializable so a host application can load it from its own settings
/// file; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Initial endpoint.
    pub endpoint: Endpoint,

    /// Number of liveness polls after the handshake starts.
    pub connect_attempts: u32,

    /// Milliseconds between liveness polls.
    pub connect_backoff_ms: u64,

    /// Milliseconds allowed for the WebSocket handshake.
    pub handshake_timeout_ms: u64,

    /// Milliseconds allowed for a service call.
    pub request_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_backoff_ms: DEFAULT_CONNECT_BACKOFF_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

// ============================================================================
// SessionConfig - Builder Methods
// ============================================================================

impl SessionConfig {
    /// Creates a configuration with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial endpoint.
    #[inline]
    #[must_use]
    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.endpoint = Endpoint::new(host, port);
        self
    }

    /// Sets the number of liveness polls.
    #[inline]
    #[must_use]
    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    /// Sets the pause between liveness polls.
    #[inline]
    #[must_use]
    pub fn with_connect_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.connect_backoff_ms = backoff_ms;
        self
    }

    /// Sets the WebSocket handshake timeout.
    #[inline]
    #[must_use]
    pub fn with_handshake_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.handshake_timeout_ms = timeout_ms;
        self
    }

    /// Sets the service call timeout.
    #[inline]
    #[must_use]
    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }
}

// ============================================================================
// SessionConfig - Accessors
// ============================================================================

impl SessionConfig {
    /// Returns the liveness poll policy.
    #[inline]
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connect_attempts,
            backoff: Duration::from_millis(self.connect_backoff_ms),
        }
    }

    /// Returns the handshake timeout.
    #[inline]
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Returns the service call timeout.
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the endpoint is invalid, the poll
    /// budget is zero, or a timeout is zero.
    pub fn validate(&self) -> Result<()> {
        self.endpoint.validate()?;
        if self.connect_attempts == 0 {
            return Err(Error::config("connect_attempts must be at least 1"));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(Error::config("handshake_timeout_ms must be greater than zero"));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::config("request_timeout_ms must be greater than zero"));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::new();
        assert_eq!(config.endpoint, Endpoint::new("localhost", 9090));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.retry_policy().budget(), Duration::from_millis(900));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = SessionConfig::new()
            .with_endpoint("10.0.0.2", 9091)
            .with_connect_attempts(3)
            .with_connect_backoff_ms(5);

        assert_eq!(config.endpoint.to_string(), "10.0.0.2:9091");
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.retry_policy().budget(), Duration::from_millis(10));
    }

    #[test]
    fn test_endpoint_validation() {
        assert!(Endpoint::new("", 9090).validate().is_err());
        assert!(Endpoint::new("   ", 9090).validate().is_err());
        assert!(Endpoint::new("robot", 0).validate().is_err());
        assert!(Endpoint::new("robot", 65535).validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = SessionConfig::new().with_connect_attempts(0);
        let err = config.validate().unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let err = SessionConfig::new()
            .with_handshake_timeout_ms(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("handshake_timeout_ms"));

        let err = SessionConfig::new()
            .with_request_timeout_ms(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("request_timeout_ms"));

        let single = SessionConfig::new().with_connect_attempts(1);
        assert_eq!(single.retry_policy().budget(), Duration::ZERO);
    }

    #[test]
    fn test_ws_url() {
        let url = Endpoint::new("localhost", 9090).ws_url().expect("url");
        assert_eq!(url.as_str(), "ws://localhost:9090/");

        let url = Endpoint::new("::1", 9090).ws_url().expect("url");
        assert_eq!(url.host_str(), Some("[::1]"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"endpoint":{"host":"robot","port":9090},"connect_attempts":4}"#)
                .expect("parse");
        assert_eq!(config.connect_attempts, 4);
        assert_eq!(config.connect_backoff_ms, DEFAULT_CONNECT_BACKOFF_MS);
    }
}
