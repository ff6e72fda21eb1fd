//! Bridge Session - one broker connection, many latest-wins topic streams.
//!
//! This library keeps a single connection to a remote publish/subscribe
//! broker (a rosbridge server) and multiplexes named topic subscriptions
//! over it. Each subscription holds only the newest frame; nothing queues.
//!
//! # Architecture
//!
//! - **Session**: owns the one transport, serializes connect and
//!   disconnect, reports liveness
//! - **Registry**: topic name to configuration, subscribe and unsubscribe,
//!   latest frame per topic
//! - **Transport**: the wire contract; rosbridge over WebSocket by
//!   default, an in-process broker for tests
//!
//! Key design principles:
//!
//! - At most one live transport per session, checked at runtime
//! - Buffer depth 1 everywhere: a new frame replaces the unread one
//! - Frames from a previous binding are dropped by generation
//! - Consumers and notification sinks cannot stall or crash delivery
//!
//! # Quick Start
//!
//! ```no_run
//! use bridge_session::{BridgeSession, Result, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let session = BridgeSession::with_defaults(SessionConfig::new())?;
//!     session.connect("localhost", 9090).await?;
//!
//!     let registry = session.registry();
//!     registry.add_topic("/chatter", "std_msgs/String")?;
//!     registry.subscribe("/chatter").await?;
//!
//!     if let Some(frame) = registry.latest("/chatter") {
//!         println!("latest: {}", frame.payload);
//!     }
//!
//!     session.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`session`] | [`BridgeSession`] lifecycle |
//! | [`registry`] | [`SubscriptionRegistry`], [`Frame`], [`TopicStatus`] |
//! | [`decode`] | Frame classification and image decoding |
//! | [`notify`] | [`NotificationSink`] and shipped sinks |
//! | [`config`] | [`SessionConfig`] and [`Endpoint`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | rosbridge message types (internal) |
//! | [`transport`] | Transport contract and implementations |

// ============================================================================
// Modules
// ============================================================================

/// Session configuration.
pub mod config;

/// Frame classification and decoding.
///
/// Pure functions; safe to call from any thread.
pub mod decode;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Status notifications.
pub mod notify;

/// rosbridge protocol message types.
///
/// Internal module defining the JSON operations on the wire.
pub mod protocol;

/// Topic registry and per-topic state.
pub mod registry;

/// The broker session.
pub mod session;

/// Broker transports.
///
/// The [`Transport`](transport::Transport) contract plus the rosbridge and
/// in-memory implementations.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Session types
pub use session::{BridgeSession, SessionStatus};

// Registry types
pub use registry::{Frame, FrameConsumer, SubscriptionRegistry, TopicStatus};

// Decode types
pub use decode::{DecodedFrame, DecodedImage, MessageClass, classify, decode};

// Notification types
pub use notify::{ChannelSink, Notification, NotificationSink, Severity, TracingSink};

// Configuration types
pub use config::{Endpoint, RetryPolicy, SessionConfig};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{Generation, RequestId, SubscriptionId};

// Transport types
pub use transport::{
    MemoryBroker, RemoteTopic, RosbridgeFactory, SubscriptionHandle, Transport,
    TransportFactory,
};
