//! Topic subscriptions.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`SubscriptionRegistry`] | Topic name to configuration and live binding |
//! | [`Frame`] | Latest message held for a topic |
//! | [`TopicStatus`] | Point-in-time topic view |
//! | [`FrameConsumer`] | Per-topic receiver of decoded frames |
//!
//! # Delivery
//!
//! ```text
//! transport ──► handler(generation) ──► latest + frame_count   (topic lock)
//!                                   └──► watch channel (depth 1)
//!                                             │
//!                                             ▼
//!                                    forwarder task ──► decode ──► consumer
//! ```
//!
//! The transport's delivery path never runs consumer code, so a slow or
//! failing consumer cannot stall it.

// ============================================================================
// Submodules
// ============================================================================

/// Registry and subscription lifecycle.
pub mod core;

/// Per-topic state.
pub mod topic;

// ============================================================================
// Re-exports
// ============================================================================

pub use self::core::SubscriptionRegistry;
pub use topic::{Frame, FrameConsumer, TopicStatus};
