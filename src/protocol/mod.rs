//! Rosbridge protocol message types.
//!
//! This module defines the JSON messages exchanged with a rosbridge v2
//! server over WebSocket.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `Operation` | Session → Broker | subscribe, unsubscribe, call_service |
//! | `Incoming` | Broker → Session | publish, service_response, status |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `operation` | Outgoing operations |
//! | `incoming` | Incoming messages |

// ============================================================================
// Submodules
// ============================================================================

/// Outgoing operations.
pub mod operation;

/// Incoming messages.
pub mod incoming;

// ============================================================================
// Re-exports
// ============================================================================

pub use incoming::{Incoming, ServiceResponse};
pub use operation::Operation;
