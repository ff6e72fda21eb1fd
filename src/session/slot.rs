//! Holder of the session's one transport.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::transport::{Transport, probe_alive};

/// The session's transport, shared read-only with the registry.
///
/// Only the session installs or takes; the registry borrows.
#[derive(Default)]
pub(crate) struct TransportSlot {
    current: RwLock<Option<Arc<dyn Transport>>>,
}

impl TransportSlot {
    /// Returns the installed transport, live or not.
    pub(crate) fn get(&self) -> Option<Arc<dyn Transport>> {
        self.current.read().clone()
    }

    /// Returns the installed transport if it is live.
    pub(crate) fn live(&self) -> Option<Arc<dyn Transport>> {
        self.get().filter(|t| probe_alive(t.as_ref()))
    }

    /// Installs a transport, returning the one it replaced.
    pub(crate) fn install(&self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        self.current.write().replace(transport)
    }

    /// Removes the installed transport.
    pub(crate) fn take(&self) -> Option<Arc<dyn Transport>> {
        self.current.write().take()
    }
}
