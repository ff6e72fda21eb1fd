//! rosbridge v2 transport over WebSocket.
//!
//! Maps the [`Transport`] contract onto rosbridge operations:
//!
//! | Contract | rosbridge |
//! |----------|-----------|
//! | `open_subscription` | `subscribe` with `queue_length` = buffer depth |
//! | `close_subscription` | `unsubscribe` |
//! | `call_service` | `call_service`, answered by `service_response` |
//! | `remote_topics` | `call_service /rosapi/topics` |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::{Endpoint, SessionConfig};
use crate::error::{Error, Result};
use crate::identifiers::{RequestId, SubscriptionId};
use crate::protocol::Operation;

use super::connection::Connection;
use super::{FrameHandler, RemoteTopic, SubscriptionHandle, Transport, TransportFactory};

// ============================================================================
// Constants
// ============================================================================

/// rosapi service listing advertised topics and their types.
const TOPICS_SERVICE: &str = "/rosapi/topics";

// ============================================================================
// RosbridgeTransport
// ============================================================================

/// Transport speaking rosbridge v2 over one WebSocket.
pub struct RosbridgeTransport {
    endpoint: Endpoint,
    handshake_timeout: Duration,
    request_timeout: Duration,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl RosbridgeTransport {
    /// Creates an unconnected transport.
    #[must_use]
    pub fn new(endpoint: Endpoint, handshake_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            endpoint,
            handshake_timeout,
            request_timeout,
            connection: Mutex::new(None),
        }
    }

    /// Returns the live connection.
    fn connection(&self) -> Result<Arc<Connection>> {
        self.connection
            .lock()
            .as_ref()
            .filter(|connection| connection.is_alive())
            .cloned()
            .ok_or(Error::NotConnected)
    }
}

#[async_trait]
impl Transport for RosbridgeTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect(&self) -> Result<()> {
        let url = self.endpoint.ws_url()?;
        let mut slot = self.connection.lock();

        if slot.as_ref().is_some_and(|c| c.is_alive()) {
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            stale.shutdown();
        }

        debug!(%url, "Starting rosbridge handshake");
        *slot = Some(Arc::new(Connection::spawn(url, self.handshake_timeout)));
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|connection| connection.is_alive())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(connection) = self.connection.lock().take() {
            connection.shutdown();
            info!(endpoint = %self.endpoint, "rosbridge connection closed");
        }
        Ok(())
    }

    async fn open_subscription(
        &self,
        topic: &str,
        message_type: &str,
        buffer_depth: usize,
        on_frame: FrameHandler,
    ) -> Result<SubscriptionHandle> {
        let connection = self.connection()?;
        let id = SubscriptionId::generate(topic);

        // Route first so the first frame after subscribe is not lost
        connection.add_route(topic, id.clone(), on_frame);

        let operation = Operation::subscribe(id.clone(), topic, message_type, buffer_depth);
        if let Err(e) = connection.send(operation).await {
            connection.remove_route(topic, &id);
            return Err(Error::subscription(topic, e.to_string()));
        }

        debug!(topic, %id, buffer_depth, "Wire subscription opened");
        Ok(SubscriptionHandle {
            id,
            topic: topic.to_string(),
        })
    }

    async fn close_subscription(&self, handle: &SubscriptionHandle) -> Result<()> {
        let connection = self.connection()?;

        // Unroute first so no frame is delivered once close starts
        connection.remove_route(&handle.topic, &handle.id);

        connection
            .send(Operation::unsubscribe(handle.id.clone(), &handle.topic))
            .await
            .map_err(|e| Error::subscription(&handle.topic, e.to_string()))?;

        debug!(topic = %handle.topic, id = %handle.id, "Wire subscription closed");
        Ok(())
    }

    async fn call_service(&self, service: &str, args: Value) -> Result<Value> {
        let connection = self.connection()?;
        let id = RequestId::generate(service);
        let operation = Operation::call_service(id.clone(), service, args);

        debug!(service, %id, "Calling service");
        connection.call(id, operation, self.request_timeout).await
    }

    async fn remote_topics(&self) -> Result<Vec<RemoteTopic>> {
        let values = self.call_service(TOPICS_SERVICE, json!({})).await?;
        parse_topic_listing(&values)
    }
}

/// Pairs the parallel `topics` and `types` arrays of a rosapi response.
fn parse_topic_listing(values: &Value) -> Result<Vec<RemoteTopic>> {
    let names = values
        .get("topics")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::protocol("topic listing has no topics array"))?;
    let types = values
        .get("types")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    Ok(names
        .iter()
        .filter_map(Value::as_str)
        .enumerate()
        .map(|(i, name)| RemoteTopic {
            name: name.to_string(),
            message_type: types
                .get(i)
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .unwrap_or("unknown")
                .to_string(),
        })
        .collect())
}

// ============================================================================
// RosbridgeFactory
// ============================================================================

/// Factory producing [`RosbridgeTransport`]s.
#[derive(Debug, Clone, Copy)]
pub struct RosbridgeFactory {
    handshake_timeout: Duration,
    request_timeout: Duration,
}

impl RosbridgeFactory {
    /// Creates a factory using the timeouts from `config`.
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            request_timeout: config.request_timeout(),
        }
    }
}

impl Default for RosbridgeFactory {
    fn default() -> Self {
        Self::new(&SessionConfig::default())
    }
}

impl TransportFactory for RosbridgeFactory {
    fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>> {
        // Reject hosts that cannot form a URL before anything is spawned
        endpoint
            .ws_url()
            .map_err(|e| Error::connection(format!("invalid endpoint {endpoint}: {e}")))?;

        Ok(Arc::new(RosbridgeTransport::new(
            endpoint.clone(),
            self.handshake_timeout,
            self.request_timeout,
        )))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topic_listing() {
        let values = json!({
            "topics": ["/chatter", "/camera/image", "/odd"],
            "types": ["std_msgs/String", "sensor_msgs/Image", ""]
        });

        let topics = parse_topic_listing(&values).expect("parse");
        assert_eq!(topics.len(), 3);
        assert_eq!(topics[0].name, "/chatter");
        assert_eq!(topics[1].message_type, "sensor_msgs/Image");
        assert_eq!(topics[2].message_type, "unknown");
    }

    #[test]
    fn test_parse_topic_listing_without_types() {
        let topics = parse_topic_listing(&json!({"topics": ["/a"]})).expect("parse");
        assert_eq!(topics[0].message_type, "unknown");
    }

    #[test]
    fn test_parse_topic_listing_rejects_garbage() {
        assert!(parse_topic_listing(&json!({"nope": 1})).is_err());
    }

    #[test]
    fn test_factory_rejects_invalid_host() {
        let factory = RosbridgeFactory::default();
        let result = factory.create(&Endpoint::new("bad host name", 9090));
        assert!(matches!(result, Err(Error::Connection { .. })));
    }

    #[tokio::test]
    async fn test_operations_require_live_connection() {
        let transport = RosbridgeTransport::new(
            Endpoint::new("127.0.0.1", 9),
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        assert!(!transport.is_alive());

        let handler: FrameHandler = Arc::new(|_frame: Value| {});
        let err = transport
            .open_subscription("/chatter", "std_msgs/String", 1, handler)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));

        assert!(transport.remote_topics().await.is_err());
        assert!(matches!(
            transport.call_service("/add_two_ints", json!({"a": 1, "b": 2})).await,
            Err(Error::NotConnected)
        ));
        transport.disconnect().await.expect("idempotent");
    }
}
