//! Error types for the bridge session.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use bridge_session::{BridgeSession, Result};
//!
//! async fn example(session: &BridgeSession) -> Result<()> {
//!     session.connect("localhost", 9090).await?;
//!     session.registry().add_topic("/chatter", "std_msgs/String")?;
//!     session.registry().subscribe("/chatter").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`], [`Error::NotConnected`] |
//! | Configuration | [`Error::Config`], [`Error::TopicExists`], [`Error::TopicNotFound`] |
//! | Subscription | [`Error::Subscription`], [`Error::NotSubscribed`], [`Error::RequestTimeout`] |
//! | Service | [`Error::Service`] |
//! | Decode | [`Error::Decode`] |
//! | External | [`Error::Json`], [`Error::WebSocket`], [`Error::Url`] |

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::RequestId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Errors never escape the session or registry as panics; every failure is
/// returned as one of these variants.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when session configuration or an endpoint is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Topic is already configured.
    #[error("Topic already exists: {name}")]
    TopicExists {
        /// The duplicate topic name.
        name: String,
    },

    /// Topic is not configured.
    #[error("Topic not found: {name}")]
    TopicNotFound {
        /// The missing topic name.
        name: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection to the broker failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Broker did not report liveness within the polling budget.
    #[error("Connection timeout after {attempts} attempts ({waited_ms}ms)")]
    ConnectionTimeout {
        /// Number of liveness polls performed.
        attempts: u32,
        /// Total milliseconds spent polling.
        waited_ms: u64,
    },

    /// Connection closed while an operation was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation requires a live session.
    #[error("Not connected to broker")]
    NotConnected,

    // ========================================================================
    // Subscription Errors
    // ========================================================================
    /// Wire-level subscription open or close failed.
    #[error("Subscription error on {topic}: {message}")]
    Subscription {
        /// Topic the operation targeted.
        topic: String,
        /// Description of the failure.
        message: String,
    },

    /// Topic has no live subscription.
    ///
    /// Non-fatal: reported when unsubscribing a topic that is not bound.
    #[error("Topic not subscribed: {name}")]
    NotSubscribed {
        /// The topic name.
        name: String,
    },

    /// Service call did not complete in time.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Service Errors
    // ========================================================================
    /// Broker reported a failed or unknown service call.
    #[error("Service {service} failed: {message}")]
    Service {
        /// Service the call targeted.
        service: String,
        /// Failure reported by the broker.
        message: String,
    },

    // ========================================================================
    // Decode Errors
    // ========================================================================
    /// Frame payload could not be decoded.
    #[error("Decode error: {message}")]
    Decode {
        /// Description of the decode failure.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected response.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Endpoint URL error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a topic exists error.
    #[inline]
    pub fn topic_exists(name: impl Into<String>) -> Self {
        Self::TopicExists { name: name.into() }
    }

    /// Creates a topic not found error.
    #[inline]
    pub fn topic_not_found(name: impl Into<String>) -> Self {
        Self::TopicNotFound { name: name.into() }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(attempts: u32, waited_ms: u64) -> Self {
        Self::ConnectionTimeout {
            attempts,
            waited_ms,
        }
    }

    /// Creates a subscription error.
    #[inline]
    pub fn subscription(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Subscription {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Creates a not subscribed error.
    #[inline]
    pub fn not_subscribed(name: impl Into<String>) -> Self {
        Self::NotSubscribed { name: name.into() }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a service error.
    #[inline]
    pub fn service(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Creates a decode error.
    #[inline]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::NotConnected
                | Self::WebSocket(_)
                | Self::Url(_)
        )
    }

    /// Returns `true` if this is a configuration error.
    #[inline]
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::TopicExists { .. } | Self::TopicNotFound { .. }
        )
    }

    /// Returns `true` if this is a subscription error.
    #[inline]
    #[must_use]
    pub fn is_subscription_error(&self) -> bool {
        matches!(
            self,
            Self::Subscription { .. } | Self::NotSubscribed { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` if the broker rejected a service call.
    #[inline]
    #[must_use]
    pub fn is_service_error(&self) -> bool {
        matches!(self, Self::Service { .. })
    }

    /// Returns `true` if this is a decode error.
    #[inline]
    #[must_use]
    pub fn is_decode_error(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }

    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::RequestTimeout { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
