//! Status notifications for display layers.
//!
//! The session reports every connection transition and every registry
//! change as a human-readable [`Notification`]. Sinks are fire-and-forget:
//! the core calls them synchronously, never awaits them, and catches any
//! panic they raise.
//!
//! # Example
//!
//! ```ignore
//! use bridge_session::notify::{ChannelSink, Severity};
//!
//! let (sink, mut rx) = ChannelSink::new();
//! // pass `sink` to BridgeSession::new, then in the UI task:
//! while let Some(note) = rx.recv().await {
//!     println!("[{}] {}", note.severity, note.message);
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

// ============================================================================
// Severity
// ============================================================================

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Neutral information.
    Info,
    /// Successful transition.
    Positive,
    /// Rejected request that left state unchanged.
    Warning,
    /// Failure.
    Negative,
}

impl Severity {
    /// Returns the lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Positive => "positive",
            Self::Warning => "warning",
            Self::Negative => "negative",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Notification
// ============================================================================

/// A status event for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Human-readable message.
    pub message: String,
    /// Severity.
    pub severity: Severity,
}

// ============================================================================
// NotificationSink
// ============================================================================

/// Receiver of status notifications.
///
/// Implementations must not block: the core calls `notify` inline from
/// connect, disconnect and registry operations.
pub trait NotificationSink: Send + Sync {
    /// Handles one notification.
    fn notify(&self, message: &str, severity: Severity);
}

impl<F> NotificationSink for F
where
    F: Fn(&str, Severity) + Send + Sync,
{
    fn notify(&self, message: &str, severity: Severity) {
        self(message, severity);
    }
}

// ============================================================================
// TracingSink
// ============================================================================

/// Sink that writes notifications to the `tracing` log.
///
/// Used when no display layer is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info | Severity::Positive => info!(%severity, "{message}"),
            Severity::Warning => warn!(%severity, "{message}"),
            Severity::Negative => error!(%severity, "{message}"),
        }
    }
}

// ============================================================================
// ChannelSink
// ============================================================================

/// Sink that forwards notifications over an unbounded channel.
///
/// Sending never blocks; a dropped receiver silently discards events.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    /// Creates a sink and the receiver a display task should drain.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, message: &str, severity: Severity) {
        let _ = self.tx.send(Notification {
            message: message.to_string(),
            severity,
        });
    }
}

// ============================================================================
// Notifier
// ============================================================================

/// Panic-isolating wrapper the session and registry notify through.
#[derive(Clone)]
pub(crate) struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub(crate) fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub(crate) fn emit(&self, message: impl AsRef<str>, severity: Severity) {
        let message = message.as_ref();
        let sink = &self.sink;
        if catch_unwind(AssertUnwindSafe(|| sink.notify(message, severity))).is_err() {
            error!(%severity, message, "Notification sink panicked");
        }
    }

    #[inline]
    pub(crate) fn info(&self, message: impl AsRef<str>) {
        self.emit(message, Severity::Info);
    }

    #[inline]
    pub(crate) fn positive(&self, message: impl AsRef<str>) {
        self.emit(message, Severity::Positive);
    }

    #[inline]
    pub(crate) fn warning(&self, message: impl AsRef<str>) {
        self.emit(message, Severity::Warning);
    }

    #[inline]
    pub(crate) fn negative(&self, message: impl AsRef<str>) {
        self.emit(message, Severity::Negative);
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;

    #[test]
    fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new();
        sink.notify("connected", Severity::Positive);

        let note = rx.try_recv().expect("notification");
        assert_eq!(note.message, "connected");
        assert_eq!(note.severity, Severity::Positive);
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.notify("nobody listening", Severity::Info);
    }

    #[test]
    fn test_closure_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let notifier = Notifier::new(Arc::new(move |msg: &str, sev: Severity| {
            seen_clone.lock().push((msg.to_string(), sev));
        }));

        notifier.warning("duplicate");
        notifier.negative("failed");

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("duplicate".to_string(), Severity::Warning));
        assert_eq!(seen[1].1, Severity::Negative);
    }

    struct PanickingSink;

    impl NotificationSink for PanickingSink {
        fn notify(&self, _message: &str, _severity: Severity) {
            panic!("ui gone");
        }
    }

    #[test]
    fn test_panicking_sink_is_contained() {
        let notifier = Notifier::new(Arc::new(PanickingSink));
        notifier.info("still fine");
    }

    #[test]
    fn test_severity_serde() {
        let json = serde_json::to_string(&Severity::Negative).expect("serialize");
        assert_eq!(json, "\"negative\"");
        assert_eq!(Severity::Positive.to_string(), "positive");
    }
}
