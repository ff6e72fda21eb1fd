//! Outgoing rosbridge operations.
//!
//! Operations are serialized with an `op` tag, following the rosbridge v2
//! protocol.
//!
//! | Operation | Purpose |
//! |-----------|---------|
//! | `subscribe` | Open a wire-level subscription |
//! | `unsubscribe` | Close a wire-level subscription |
//! | `call_service` | Invoke a service (topic discovery) |

// ============================================================================
// Imports
// ============================================================================

use serde::Serialize;
use serde_json::Value;

use crate::identifiers::{RequestId, SubscriptionId};

// ============================================================================
// Operation
// ============================================================================

/// An operation sent from the session to the broker.
///
/// # Format
///
/// ```json
/// {
///   "op": "subscribe",
///   "id": "subscribe:/chatter:uuid",
///   "topic": "/chatter",
///   "type": "std_msgs/String",
///   "queue_length": 1
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Open a subscription.
    Subscribe {
        /// Wire id, echoed by unsubscribe.
        id: SubscriptionId,
        /// Topic name.
        topic: String,
        /// Message type descriptor.
        #[serde(rename = "type")]
        message_type: String,
        /// Broker-side buffer depth.
        queue_length: usize,
    },

    /// Close a subscription.
    Unsubscribe {
        /// Wire id used when subscribing.
        id: SubscriptionId,
        /// Topic name.
        topic: String,
    },

    /// Call a service.
    CallService {
        /// Correlation id for the response.
        id: RequestId,
        /// Service name.
        service: String,
        /// Service arguments.
        args: Value,
    },
}

impl Operation {
    /// Creates a subscribe operation.
    #[inline]
    #[must_use]
    pub fn subscribe(
        id: SubscriptionId,
        topic: impl Into<String>,
        message_type: impl Into<String>,
        queue_length: usize,
    ) -> Self {
        Self::Subscribe {
            id,
            topic: topic.into(),
            message_type: message_type.into(),
            queue_length,
        }
    }

    /// Creates an unsubscribe operation.
    #[inline]
    #[must_use]
    pub fn unsubscribe(id: SubscriptionId, topic: impl Into<String>) -> Self {
        Self::Unsubscribe {
            id,
            topic: topic.into(),
        }
    }

    /// Creates a service call.
    #[inline]
    #[must_use]
    pub fn call_service(id: RequestId, service: impl Into<String>, args: Value) -> Self {
        Self::CallService {
            id,
            service: service.into(),
            args,
        }
    }

    /// Returns the `op` name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::CallService { .. } => "call_service",
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_serialization() {
        let op = Operation::subscribe(
            SubscriptionId::new("subscribe:/chatter:1"),
            "/chatter",
            "std_msgs/String",
            1,
        );
        let value = serde_json::to_value(&op).expect("serialize");

        assert_eq!(
            value,
            json!({
                "op": "subscribe",
                "id": "subscribe:/chatter:1",
                "topic": "/chatter",
                "type": "std_msgs/String",
                "queue_length": 1
            })
        );
        assert_eq!(op.name(), "subscribe");
    }

    #[test]
    fn test_unsubscribe_serialization() {
        let op = Operation::unsubscribe(SubscriptionId::new("subscribe:/a:1"), "/a");
        let value = serde_json::to_value(&op).expect("serialize");
        assert_eq!(value["op"], "unsubscribe");
        assert_eq!(value["id"], "subscribe:/a:1");
    }

    #[test]
    fn test_call_service_serialization() {
        let op = Operation::call_service(RequestId::new("call:1"), "/rosapi/topics", json!({}));
        let json = serde_json::to_string(&op).expect("serialize");
        assert!(json.contains("\"op\":\"call_service\""));
        assert!(json.contains("/rosapi/topics"));
    }
}
