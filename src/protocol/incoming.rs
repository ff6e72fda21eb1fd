//! Incoming rosbridge messages.
//!
//! The broker pushes three kinds of messages to the session:
//!
//! | `op` | Purpose |
//! |------|---------|
//! | `publish` | A frame on a subscribed topic |
//! | `service_response` | Result of a `call_service` |
//! | `status` | Broker-side diagnostics |
//!
//! Anything else is parsed as [`Incoming::Unknown`] and ignored.

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// Incoming
// ============================================================================

/// A message from the broker to the session.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Incoming {
    /// A frame published on a topic.
    Publish {
        /// Topic name.
        topic: String,
        /// Message body.
        msg: Value,
    },

    /// Response to a service call.
    ServiceResponse(ServiceResponse),

    /// Broker status report.
    Status {
        /// Severity reported by the broker.
        #[serde(default)]
        level: Option<String>,
        /// Human-readable message.
        #[serde(default)]
        msg: String,
    },

    /// Any other operation.
    #[serde(other)]
    Unknown,
}

// ============================================================================
// ServiceResponse
// ============================================================================

/// Response to a `call_service` operation.
///
/// # Format
///
/// ```json
/// {
///   "op": "service_response",
///   "id": "call_service:/rosapi/topics:uuid",
///   "service": "/rosapi/topics",
///   "values": { "topics": [...], "types": [...] },
///   "result": true
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceResponse {
    /// Matches the call id.
    #[serde(default)]
    pub id: Option<RequestId>,

    /// Service name.
    #[serde(default)]
    pub service: String,

    /// Response values.
    #[serde(default)]
    pub values: Value,

    /// Whether the service call succeeded.
    #[serde(default = "default_true")]
    pub result: bool,
}

fn default_true() -> bool {
    true
}

impl ServiceResponse {
    /// Extracts the values, returning error if the call failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Service`] if the broker reported a failure.
    pub fn into_result(self) -> Result<Value> {
        if self.result {
            Ok(self.values)
        } else {
            let message = self
                .values
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| "call rejected".to_string());
            Err(Error::service(self.service, message))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_parse() {
        let text = r#"{"op":"publish","topic":"/chatter","msg":{"data":"hi"}}"#;
        let incoming: Incoming = serde_json::from_str(text).expect("parse");
        match incoming {
            Incoming::Publish { topic, msg } => {
                assert_eq!(topic, "/chatter");
                assert_eq!(msg["data"], "hi");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_service_response_parse() {
        let text = r#"{
            "op": "service_response",
            "id": "call:1",
            "service": "/rosapi/topics",
            "values": {"topics": ["/a"], "types": ["std_msgs/String"]},
            "result": true
        }"#;
        let incoming: Incoming = serde_json::from_str(text).expect("parse");
        let Incoming::ServiceResponse(response) = incoming else {
            panic!("expected service response");
        };
        assert_eq!(response.id, Some(RequestId::new("call:1")));
        let values = response.into_result().expect("success");
        assert_eq!(values["topics"][0], "/a");
    }

    #[test]
    fn test_failed_service_response() {
        let text = r#"{"op":"service_response","service":"/x","values":"boom","result":false}"#;
        let Incoming::ServiceResponse(response) = serde_json::from_str(text).expect("parse") else {
            panic!("expected service response");
        };
        let err = response.into_result().unwrap_err();
        assert!(err.is_service_error());
        assert_eq!(err.to_string(), "Service /x failed: boom");
    }

    #[test]
    fn test_status_and_unknown() {
        let status: Incoming =
            serde_json::from_str(r#"{"op":"status","level":"warning","msg":"slow"}"#)
                .expect("parse");
        assert!(matches!(status, Incoming::Status { .. }));

        let unknown: Incoming =
            serde_json::from_str(r#"{"op":"png","data":"..."}"#).expect("parse");
        assert!(matches!(unknown, Incoming::Unknown));
    }
}
