//! Type-safe identifiers for bridge entities.
//!
//! Newtype wrappers prevent mixing wire ids, request ids and binding
//! generations at compile time.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// RequestId
// ============================================================================

/// Identifier correlating a service call with its response.
///
/// Rosbridge ids are free-form strings; generated ids look like
/// `call_service:/rosapi/topics:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Wraps an existing id.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh id for a service call.
    #[must_use]
    pub fn generate(service: &str) -> Self {
        Self(format!("call_service:{service}:{}", Uuid::new_v4()))
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// SubscriptionId
// ============================================================================

/// Identifier of one wire-level subscription.
///
/// Two bindings of the same topic always get distinct ids, so closing an
/// old binding never removes a newer one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Wraps an existing id.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh id for a topic.
    #[must_use]
    pub fn generate(topic: &str) -> Self {
        Self(format!("subscribe:{topic}:{}", Uuid::new_v4()))
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Generation
// ============================================================================

/// Binding generation of a topic.
///
/// Bumped on every subscribe. Frames tagged with an older generation are
/// dropped by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(u64);

impl Generation {
    /// Returns the following generation.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw counter value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = SubscriptionId::generate("/chatter");
        let b = SubscriptionId::generate("/chatter");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("subscribe:/chatter:"));
    }

    #[test]
    fn test_request_id_prefix() {
        let id = RequestId::generate("/rosapi/topics");
        assert!(id.to_string().starts_with("call_service:/rosapi/topics:"));
    }

    #[test]
    fn test_generation_ordering() {
        let g0 = Generation::default();
        let g1 = g0.next();
        assert!(g1 > g0);
        assert_eq!(g1.as_u64(), 1);
        assert_eq!(g1.to_string(), "gen-1");
    }

    #[test]
    fn test_serde_transparent() {
        let id = SubscriptionId::new("subscribe:/a:1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"subscribe:/a:1\"");
    }
}
