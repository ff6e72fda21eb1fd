//! Broker session.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`BridgeSession`] | Owns the one transport and the registry |
//! | [`SessionStatus`] | Point-in-time session view |
//!
//! # Reconnect Rules
//!
//! | Current transport | Requested endpoint | Action |
//! |-------------------|--------------------|--------|
//! | none | any | connect |
//! | live | same | nothing |
//! | dead | same | tear down, connect |
//! | any | different | tear down, connect |
//!
//! Tearing down unsubscribes every topic; configured topics are kept.

// ============================================================================
// Submodules
// ============================================================================

/// Session implementation.
pub mod core;

/// Transport holder shared with the registry.
pub(crate) mod slot;

// ============================================================================
// Re-exports
// ============================================================================

pub use self::core::{BridgeSession, SessionStatus};
