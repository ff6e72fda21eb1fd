//! Broker transport layer.
//!
//! The session depends only on the [`Transport`] contract. Two
//! implementations ship with the crate:
//!
//! | Module | Description |
//! |--------|-------------|
//! | `rosbridge` | rosbridge v2 JSON protocol over WebSocket |
//! | `memory` | In-process broker for tests and offline use |
//! | `connection` | WebSocket connection and event loop used by `rosbridge` |
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                         ┌──────────────────┐
//! │  BridgeSession   │                         │  rosbridge       │
//! │                  │        WebSocket        │  server          │
//! │  Transport  ─────┼────────────────────────►│                  │
//! │  (one per proc)  │◄────────────────────────┼── publish ops    │
//! └──────────────────┘                         └──────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `TransportFactory::create` - construct a transport for an endpoint
//! 2. `Transport::connect` - start the handshake (returns before it completes)
//! 3. `Transport::is_alive` - polled by the session until live
//! 4. `open_subscription` / `close_subscription` - wire bindings
//! 5. `call_service` - request/response calls, correlated by id
//! 6. `Transport::disconnect` - tear down

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket connection and event loop.
pub mod connection;

/// In-process broker.
pub mod memory;

/// rosbridge v2 transport.
pub mod rosbridge;

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::config::Endpoint;
use crate::error::{Error, Result};
use crate::identifiers::SubscriptionId;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::Connection;
pub use memory::{MemoryBroker, MemoryTransport, MemoryTransportFactory};
pub use rosbridge::{RosbridgeFactory, RosbridgeTransport};

// ============================================================================
// Constants
// ============================================================================

/// Buffer depth requested for every wire subscription.
///
/// A new frame replaces any unread one; nothing is queued.
pub const BUFFER_DEPTH: usize = 1;

// ============================================================================
// Types
// ============================================================================

/// Frame delivery callback.
///
/// Invoked from the transport's delivery path with the raw message body.
/// Must return quickly.
pub type FrameHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Handle of an open wire-level subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    /// Wire id.
    pub id: SubscriptionId,
    /// Topic name.
    pub topic: String,
}

/// A topic advertised by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTopic {
    /// Topic name.
    pub name: String,
    /// Message type descriptor, `"unknown"` if the broker did not say.
    pub message_type: String,
}

// ============================================================================
// Transport
// ============================================================================

/// One physical connection to a broker.
///
/// Implementations are owned by the session; the registry only borrows
/// them to open and close wire subscriptions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns the endpoint this transport was created for.
    fn endpoint(&self) -> &Endpoint;

    /// Starts the connect handshake.
    ///
    /// May return before the connection is live; the session polls
    /// [`is_alive`](Self::is_alive) afterwards.
    async fn connect(&self) -> Result<()>;

    /// Returns `true` while the connection is live. Must not block.
    fn is_alive(&self) -> bool;

    /// Tears the connection down. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Opens a wire-level subscription.
    ///
    /// `on_frame` is called for every frame delivered on `topic` until the
    /// returned handle is closed.
    async fn open_subscription(
        &self,
        topic: &str,
        message_type: &str,
        buffer_depth: usize,
        on_frame: FrameHandler,
    ) -> Result<SubscriptionHandle>;

    /// Closes a wire-level subscription.
    async fn close_subscription(&self, handle: &SubscriptionHandle) -> Result<()>;

    /// Calls a broker service and returns its response values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Service`] if the broker rejects the call.
    async fn call_service(&self, service: &str, args: Value) -> Result<Value>;

    /// Lists topics advertised by the broker.
    async fn remote_topics(&self) -> Result<Vec<RemoteTopic>>;
}

/// Constructs transports.
pub trait TransportFactory: Send + Sync {
    /// Creates an unconnected transport for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the transport cannot be constructed.
    fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>>;
}

// ============================================================================
// Panic Isolation
// ============================================================================

/// Runs a transport future, converting a panic into an error.
pub(crate) async fn shielded<T, F>(operation: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Error::connection(format!(
            "{operation} panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

/// Polls [`Transport::is_alive`], treating a panic as dead.
pub(crate) fn probe_alive(transport: &dyn Transport) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| transport.is_alive())) {
        Ok(alive) => alive,
        Err(panic) => {
            error!(
                endpoint = %transport.endpoint(),
                panic = %panic_message(panic.as_ref()),
                "Liveness probe panicked"
            );
            false
        }
    }
}

/// Extracts the message of a caught panic.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shielded_passes_results_through() {
        let ok = shielded("op", async { Ok::<_, Error>(7) }).await;
        assert_eq!(ok.expect("ok"), 7);

        let err = shielded("op", async { Err::<u8, _>(Error::NotConnected) }).await;
        assert!(matches!(err, Err(Error::NotConnected)));
    }

    async fn exploding_connect() -> Result<()> {
        panic!("socket exploded")
    }

    #[tokio::test]
    async fn test_shielded_converts_panic() {
        let result = shielded("connect", exploding_connect()).await;
        let err = result.unwrap_err();
        assert!(err.is_connection_error());
        assert!(err.to_string().contains("connect panicked: socket exploded"));
    }

    #[test]
    fn test_buffer_depth_is_one() {
        assert_eq!(BUFFER_DEPTH, 1);
    }
}
