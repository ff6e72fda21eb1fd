//! Per-topic state.
//!
//! A [`TopicEntry`] is created by `add_topic` and lives until
//! `remove_topic`. While subscribed it owns one [`Subscription`]: the wire
//! handle, the binding generation, the latest frame and the depth-1 update
//! channel feeding the consumer.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, trace};

use crate::decode::{DecodedFrame, decode};
use crate::identifiers::Generation;
use crate::transport::{FrameHandler, SubscriptionHandle, panic_message};

// ============================================================================
// Frame
// ============================================================================

/// One message received on a topic.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Message body as delivered by the broker.
    pub payload: Arc<Value>,
    /// Position in the topic's stream since the last subscribe, starting at 1.
    pub sequence: u64,
    /// Local receive time.
    pub received_at: SystemTime,
}

// ============================================================================
// FrameConsumer
// ============================================================================

/// Receives decoded frames for one topic.
///
/// Called from a forwarder task, never from the transport's delivery path.
/// Frames may be skipped when the consumer is slower than the topic; only
/// the newest pending frame is handed over.
pub trait FrameConsumer: Send + Sync {
    /// Handles one decoded frame.
    fn on_decoded(&self, topic: &str, frame: &DecodedFrame);
}

impl<F> FrameConsumer for F
where
    F: Fn(&str, &DecodedFrame) + Send + Sync,
{
    fn on_decoded(&self, topic: &str, frame: &DecodedFrame) {
        self(topic, frame);
    }
}

// ============================================================================
// TopicStatus
// ============================================================================

/// Point-in-time view of a configured topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicStatus {
    /// Topic name.
    pub name: String,
    /// Message type descriptor.
    pub message_type: String,
    /// Whether a live subscription exists.
    pub subscribed: bool,
    /// Frames accepted since the last subscribe.
    pub frame_count: u64,
    /// Receive time of the newest accepted frame.
    pub last_update: Option<SystemTime>,
    /// Whether a latest frame is held.
    pub has_message: bool,
}

// ============================================================================
// Subscription
// ============================================================================

/// Live binding of a topic to a wire subscription.
pub(crate) struct Subscription {
    handle: SubscriptionHandle,
    generation: Generation,
    latest: Option<Frame>,
    updates: watch::Sender<Option<Frame>>,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Never joined: a stuck consumer must not hold up teardown
        self.forwarder.abort();
    }
}

// ============================================================================
// TopicEntry
// ============================================================================

#[derive(Default)]
struct TopicState {
    generation: Generation,
    subscription: Option<Subscription>,
    frame_count: u64,
    last_update: Option<SystemTime>,
}

/// A configured topic.
pub(crate) struct TopicEntry {
    name: String,
    message_type: String,
    /// Guards everything the delivery path touches. Never held across `.await`.
    state: Mutex<TopicState>,
    /// Serializes subscribe, unsubscribe and remove for this topic.
    op_lock: tokio::sync::Mutex<()>,
    consumer: RwLock<Option<Arc<dyn FrameConsumer>>>,
}

impl TopicEntry {
    pub(crate) fn new(name: String, message_type: String) -> Self {
        Self {
            name,
            message_type,
            state: Mutex::new(TopicState::default()),
            op_lock: tokio::sync::Mutex::new(()),
            consumer: RwLock::new(None),
        }
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn message_type(&self) -> &str {
        &self.message_type
    }

    #[inline]
    pub(crate) fn op_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.op_lock
    }
}

// ============================================================================
// TopicEntry - Binding
// ============================================================================

impl TopicEntry {
    /// Starts a new binding and returns the handler the transport should call.
    ///
    /// Frames from any earlier binding are rejected from here on.
    pub(crate) fn begin_binding(self: &Arc<Self>) -> (Generation, FrameHandler) {
        let generation = {
            let mut state = self.state.lock();
            state.generation = state.generation.next();
            state.generation
        };

        let entry = Arc::downgrade(self);
        let handler: FrameHandler = Arc::new(move |payload: Value| {
            if let Some(entry) = entry.upgrade() {
                entry.accept(generation, payload);
            }
        });
        (generation, handler)
    }

    /// Installs the subscription for `generation`.
    ///
    /// Returns `false` if a newer binding started in the meantime.
    pub(crate) fn install(self: &Arc<Self>, handle: SubscriptionHandle, generation: Generation) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }

        let (updates, receiver) = watch::channel(None);
        let forwarder = tokio::spawn(forward(Arc::downgrade(self), receiver));

        state.subscription = Some(Subscription {
            handle,
            generation,
            latest: None,
            updates,
            forwarder,
        });
        state.frame_count = 0;
        state.last_update = None;
        true
    }

    /// Detaches the subscription. Frames are rejected from here on.
    pub(crate) fn detach(&self) -> Option<Subscription> {
        self.state.lock().subscription.take()
    }

    /// Returns the wire handle of the live subscription.
    pub(crate) fn handle(&self) -> Option<SubscriptionHandle> {
        self.state
            .lock()
            .subscription
            .as_ref()
            .map(|s| s.handle().clone())
    }

    /// Returns the generation of the live subscription.
    pub(crate) fn generation(&self) -> Option<Generation> {
        self.state.lock().subscription.as_ref().map(|s| s.generation)
    }

    #[inline]
    pub(crate) fn is_subscribed(&self) -> bool {
        self.state.lock().subscription.is_some()
    }
}

// ============================================================================
// TopicEntry - Delivery
// ============================================================================

impl TopicEntry {
    /// Records a frame delivered for `generation`.
    ///
    /// Payload, timestamp and counter are updated in one critical section.
    pub(crate) fn accept(&self, generation: Generation, payload: Value) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(subscription) = state
            .subscription
            .as_mut()
            .filter(|s| s.generation == generation)
        else {
            trace!(topic = %self.name, %generation, "Dropping stale frame");
            return false;
        };

        state.frame_count += 1;
        let frame = Frame {
            payload: Arc::new(payload),
            sequence: state.frame_count,
            received_at: SystemTime::now(),
        };
        state.last_update = Some(frame.received_at);
        subscription.latest = Some(frame.clone());
        subscription.updates.send_replace(Some(frame));
        true
    }

    /// Hands a frame to the consumer, if one is registered.
    fn dispatch(&self, frame: &Frame) {
        let Some(consumer) = self.consumer.read().clone() else {
            return;
        };

        let decoded = decode(&self.message_type, &frame.payload);
        let topic = self.name.as_str();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| consumer.on_decoded(topic, &decoded))) {
            error!(
                topic,
                sequence = frame.sequence,
                panic = %panic_message(panic.as_ref()),
                "Frame consumer panicked"
            );
        }
    }

    pub(crate) fn set_consumer(&self, consumer: Arc<dyn FrameConsumer>) {
        *self.consumer.write() = Some(consumer);
    }

    pub(crate) fn clear_consumer(&self) -> bool {
        self.consumer.write().take().is_some()
    }
}

// ============================================================================
// TopicEntry - Reads
// ============================================================================

impl TopicEntry {
    pub(crate) fn latest(&self) -> Option<Frame> {
        self.state
            .lock()
            .subscription
            .as_ref()
            .and_then(|s| s.latest.clone())
    }

    pub(crate) fn watch(&self) -> Option<watch::Receiver<Option<Frame>>> {
        self.state
            .lock()
            .subscription
            .as_ref()
            .map(|s| s.updates.subscribe())
    }

    /// Drops the latest frame. Returns `true` if one was held.
    pub(crate) fn clear_latest(&self) -> bool {
        let mut state = self.state.lock();
        let Some(subscription) = state.subscription.as_mut() else {
            return false;
        };
        let had = subscription.latest.take().is_some();
        subscription.updates.send_replace(None);
        had
    }

    pub(crate) fn status(&self) -> TopicStatus {
        let state = self.state.lock();
        TopicStatus {
            name: self.name.clone(),
            message_type: self.message_type.clone(),
            subscribed: state.subscription.is_some(),
            frame_count: state.frame_count,
            last_update: state.last_update,
            has_message: state
                .subscription
                .as_ref()
                .is_some_and(|s| s.latest.is_some()),
        }
    }
}

impl fmt::Debug for TopicEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicEntry")
            .field("name", &self.name)
            .field("message_type", &self.message_type)
            .field("subscribed", &self.is_subscribed())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Forwarder
// ============================================================================

/// Drains the depth-1 channel into the topic's consumer.
///
/// Ends when the subscription drops its sender or the topic is removed.
async fn forward(entry: Weak<TopicEntry>, mut updates: watch::Receiver<Option<Frame>>) {
    while updates.changed().await.is_ok() {
        let Some(frame) = updates.borrow_and_update().clone() else {
            continue;
        };
        let Some(entry) = entry.upgrade() else {
            break;
        };
        entry.dispatch(&frame);
    }
    trace!("Frame forwarder stopped");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::SubscriptionId;
    use serde_json::json;

    fn handle(topic: &str) -> SubscriptionHandle {
        SubscriptionHandle {
            id: SubscriptionId::generate(topic),
            topic: topic.to_string(),
        }
    }

    fn bound_entry(topic: &str) -> (Arc<TopicEntry>, Generation, FrameHandler) {
        let entry = Arc::new(TopicEntry::new(topic.into(), "std_msgs/String".into()));
        let (generation, handler) = entry.begin_binding();
        assert!(entry.install(handle(topic), generation));
        (entry, generation, handler)
    }

    #[tokio::test]
    async fn test_latest_wins() {
        let (entry, _, handler) = bound_entry("/chatter");
        for text in ["a", "b", "c"] {
            handler(json!({ "data": text }));
        }

        let latest = entry.latest().expect("latest");
        assert_eq!(latest.payload["data"], "c");
        assert_eq!(latest.sequence, 3);

        let status = entry.status();
        assert_eq!(status.frame_count, 3);
        assert!(status.has_message);
        assert!(status.last_update.is_some());
    }

    #[tokio::test]
    async fn test_stale_generation_rejected() {
        let (entry, old, old_handler) = bound_entry("/chatter");
        drop(entry.detach());

        let (new, _handler) = entry.begin_binding();
        assert!(new > old);
        assert!(entry.install(handle("/chatter"), new));

        old_handler(json!({"data": "late"}));
        assert!(!entry.accept(old, json!({"data": "late"})));
        assert!(entry.latest().is_none());
        assert_eq!(entry.status().frame_count, 0);
    }

    #[tokio::test]
    async fn test_install_loses_to_newer_binding() {
        let entry = Arc::new(TopicEntry::new("/a".into(), "x/Y".into()));
        let (first, _) = entry.begin_binding();
        let (_second, _) = entry.begin_binding();
        assert!(!entry.install(handle("/a"), first));
        assert!(!entry.is_subscribed());
    }

    #[tokio::test]
    async fn test_detach_drops_latest_keeps_count() {
        let (entry, generation, _) = bound_entry("/a");
        assert!(entry.accept(generation, json!({"data": 1})));

        drop(entry.detach());
        let status = entry.status();
        assert!(!status.subscribed);
        assert!(!status.has_message);
        assert_eq!(status.frame_count, 1);
        assert!(!entry.accept(generation, json!({"data": 2})));
    }

    #[tokio::test]
    async fn test_clear_latest() {
        let (entry, generation, _) = bound_entry("/a");
        assert!(!entry.clear_latest());
        entry.accept(generation, json!({"data": 1}));
        assert!(entry.clear_latest());
        assert!(entry.latest().is_none());
        assert_eq!(entry.status().frame_count, 1);
    }

    #[tokio::test]
    async fn test_watch_sees_newest() {
        let (entry, generation, _) = bound_entry("/a");
        let mut rx = entry.watch().expect("subscribed");

        entry.accept(generation, json!({"data": 1}));
        entry.accept(generation, json!({"data": 2}));

        rx.changed().await.expect("changed");
        let frame = rx.borrow_and_update().clone().expect("frame");
        assert_eq!(frame.payload["data"], 2);
    }

    #[tokio::test]
    async fn test_handler_outliving_entry_is_inert() {
        let (entry, _, handler) = bound_entry("/a");
        drop(entry);
        handler(json!({"data": "orphan"}));
    }
}
