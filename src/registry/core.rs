//! Topic registry and subscription lifecycle.
//!
//! Each topic moves through:
//!
//! ```text
//! add_topic        subscribe           remove_topic
//!     │    ┌──────────────────────┐         │
//!     ▼    │                      ▼         ▼
//! Configured(unsubscribed)   Configured(subscribed) ──► removed
//!          ▲                      │
//!          └──────────────────────┘
//!        unsubscribe / disconnect
//! ```
//!
//! Reads never touch the network. Wire calls for one topic are serialized
//! by that topic's operation lock; different topics proceed independently.
//!
//! A remote drop ends every subscription with it. Reads notice the dead
//! transport and report those topics as unsubscribed.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::Generation;
use crate::notify::Notifier;
use crate::session::slot::TransportSlot;
use crate::transport::{BUFFER_DEPTH, Transport, probe_alive, shielded};

use super::topic::{Frame, FrameConsumer, TopicEntry, TopicStatus};

// ============================================================================
// Types
// ============================================================================

/// Configured topics, in insertion order.
#[derive(Default)]
struct TopicTable {
    by_name: FxHashMap<String, Arc<TopicEntry>>,
    order: Vec<String>,
}

impl TopicTable {
    fn get(&self, name: &str) -> Option<Arc<TopicEntry>> {
        self.by_name.get(name).cloned()
    }

    fn ordered(&self) -> Vec<Arc<TopicEntry>> {
        self.order
            .iter()
            .filter_map(|name| self.by_name.get(name).cloned())
            .collect()
    }
}

/// Internal shared state for the registry.
struct RegistryInner {
    topics: RwLock<TopicTable>,
    slot: Arc<TransportSlot>,
    notifier: Notifier,
}

// ============================================================================
// SubscriptionRegistry
// ============================================================================

/// Named topic subscriptions multiplexed over the session's transport.
///
/// Obtained from [`BridgeSession::registry`](crate::BridgeSession::registry).
/// Cheap to clone; clones share state.
///
/// # Example
///
/// ```ignore
/// let registry = session.registry();
/// registry.add_topic("/chatter", "std_msgs/String")?;
/// registry.subscribe("/chatter").await?;
///
/// if let Some(frame) = registry.latest("/chatter") {
///     println!("{}", frame.payload);
/// }
/// ```
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.list_topics())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SubscriptionRegistry - Constructor
// ============================================================================

impl SubscriptionRegistry {
    pub(crate) fn new(slot: Arc<TransportSlot>, notifier: Notifier) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                topics: RwLock::new(TopicTable::default()),
                slot,
                notifier,
            }),
        }
    }

    fn entry(&self, name: &str) -> Result<Arc<TopicEntry>> {
        self.inner
            .topics
            .read()
            .get(name)
            .ok_or_else(|| Error::topic_not_found(name))
    }

    fn still_registered(&self, entry: &Arc<TopicEntry>) -> bool {
        self.inner
            .topics
            .read()
            .get(entry.name())
            .is_some_and(|current| Arc::ptr_eq(&current, entry))
    }

    /// Looks up a topic for a read, dropping a subscription that died
    /// with its transport.
    fn observed(&self, name: &str) -> Result<Arc<TopicEntry>> {
        let entry = self.entry(name)?;
        self.reap(std::slice::from_ref(&entry));
        Ok(entry)
    }

    /// Detaches every subscription in `entries` if the session has no live
    /// transport.
    ///
    /// A remote drop takes the broker side of each subscription with it, so
    /// there is nothing left to close on the wire.
    fn reap(&self, entries: &[Arc<TopicEntry>]) {
        if self.inner.slot.live().is_some() {
            return;
        }
        for entry in entries {
            if entry.detach().is_some() {
                warn!(topic = entry.name(), "Subscription lost with transport");
            }
        }
    }
}

// ============================================================================
// SubscriptionRegistry - Configuration
// ============================================================================

impl SubscriptionRegistry {
    /// Adds a topic in the unsubscribed state.
    ///
    /// # Errors
    ///
    /// - [`Error::TopicExists`] if `name` is already configured; the existing
    ///   entry is left untouched
    /// - [`Error::Config`] if `name` or `message_type` is blank
    pub fn add_topic(&self, name: impl Into<String>, message_type: impl Into<String>) -> Result<()> {
        let name = name.into();
        let message_type = message_type.into();

        if name.trim().is_empty() {
            return Err(Error::config("Topic name must not be empty"));
        }
        if message_type.trim().is_empty() {
            return Err(Error::config(format!("Topic {name} needs a message type")));
        }

        {
            let mut topics = self.inner.topics.write();
            if topics.by_name.contains_key(&name) {
                drop(topics);
                self.inner
                    .notifier
                    .warning(format!("Topic {name} already exists"));
                return Err(Error::topic_exists(name));
            }
            let entry = Arc::new(TopicEntry::new(name.clone(), message_type.clone()));
            topics.by_name.insert(name.clone(), entry);
            topics.order.push(name.clone());
        }

        debug!(topic = %name, %message_type, "Topic added");
        self.inner.notifier.info(format!("Added topic {name}"));
        Ok(())
    }

    /// Removes a topic, unsubscribing it first.
    ///
    /// A failed wire close is logged and does not stop the removal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TopicNotFound`] if `name` is not configured.
    pub async fn remove_topic(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        let _op = entry.op_lock().lock().await;

        if !self.still_registered(&entry) {
            return Err(Error::topic_not_found(name));
        }

        let transport = self.inner.slot.get();
        release(&entry, transport.as_deref()).await;
        entry.clear_consumer();

        {
            let mut topics = self.inner.topics.write();
            topics.by_name.remove(name);
            topics.order.retain(|n| n != name);
        }

        info!(topic = name, "Topic removed");
        self.inner.notifier.info(format!("Removed topic {name}"));
        Ok(())
    }

    /// Registers the consumer of decoded frames for a topic.
    ///
    /// Replaces any previous consumer. The consumer survives unsubscribe and
    /// reconnect and is dropped with the topic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TopicNotFound`] if `name` is not configured.
    pub fn set_consumer<C>(&self, name: &str, consumer: C) -> Result<()>
    where
        C: FrameConsumer + 'static,
    {
        self.entry(name)?.set_consumer(Arc::new(consumer));
        Ok(())
    }

    /// Unregisters the consumer of a topic. Returns `true` if one was set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TopicNotFound`] if `name` is not configured.
    pub fn clear_consumer(&self, name: &str) -> Result<bool> {
        Ok(self.entry(name)?.clear_consumer())
    }
}

// ============================================================================
// SubscriptionRegistry - Subscriptions
// ============================================================================

impl SubscriptionRegistry {
    /// Opens the wire subscription of a topic with buffer depth 1.
    ///
    /// Succeeds without a second wire call if the topic is already
    /// subscribed. On failure the topic stays unsubscribed.
    ///
    /// # Errors
    ///
    /// - [`Error::TopicNotFound`] if `name` is not configured
    /// - [`Error::NotConnected`] if the session has no live transport
    /// - [`Error::Subscription`] if the broker rejects the subscription
    pub async fn subscribe(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        let _op = entry.op_lock().lock().await;

        if !self.still_registered(&entry) {
            return Err(Error::topic_not_found(name));
        }

        let Some(transport) = self.inner.slot.live() else {
            self.reap(std::slice::from_ref(&entry));
            self.inner
                .notifier
                .warning(format!("Cannot subscribe to {name}: not connected"));
            return Err(Error::NotConnected);
        };

        if entry.is_subscribed() {
            debug!(topic = name, "Already subscribed");
            return Ok(());
        }

        let (generation, handler) = entry.begin_binding();
        let opened = shielded(
            "open_subscription",
            transport.open_subscription(name, entry.message_type(), BUFFER_DEPTH, handler),
        )
        .await;

        let handle = match opened {
            Ok(handle) => handle,
            Err(e) => {
                warn!(topic = name, error = %e, "Subscribe failed");
                self.inner
                    .notifier
                    .negative(format!("Failed to subscribe to {name}: {e}"));
                return Err(match e {
                    Error::Subscription { .. } | Error::NotConnected => e,
                    other => Error::subscription(name, other.to_string()),
                });
            }
        };

        let installed = entry.install(handle, generation);
        debug_assert!(installed, "binding raced under the op lock");

        info!(topic = name, %generation, "Subscribed");
        self.inner.notifier.positive(format!("Subscribed to {name}"));
        Ok(())
    }

    /// Closes the wire subscription of a topic.
    ///
    /// If the transport has already died the subscription is discarded
    /// locally. On a failed close the topic stays subscribed.
    ///
    /// # Errors
    ///
    /// - [`Error::TopicNotFound`] if `name` is not configured
    /// - [`Error::NotSubscribed`] if the topic has no live subscription
    /// - [`Error::Subscription`] if the broker rejects the close
    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        let _op = entry.op_lock().lock().await;

        if !self.still_registered(&entry) {
            return Err(Error::topic_not_found(name));
        }

        let Some(handle) = entry.handle() else {
            debug!(topic = name, "Unsubscribe ignored, not subscribed");
            return Err(Error::not_subscribed(name));
        };

        if let Some(transport) = self.inner.slot.live() {
            let closed = shielded("close_subscription", transport.close_subscription(&handle)).await;
            if let Err(e) = closed {
                warn!(topic = name, error = %e, "Unsubscribe failed, subscription kept");
                self.inner
                    .notifier
                    .negative(format!("Failed to unsubscribe from {name}: {e}"));
                return Err(match e {
                    Error::Subscription { .. } => e,
                    other => Error::subscription(name, other.to_string()),
                });
            }
        } else {
            debug!(topic = name, "Transport gone, discarding subscription locally");
        }

        drop(entry.detach());

        info!(topic = name, "Unsubscribed");
        self.inner.notifier.info(format!("Unsubscribed from {name}"));
        Ok(())
    }

    /// Releases every subscription ahead of a transport teardown.
    ///
    /// Close failures are logged; every topic ends up unsubscribed. Returns
    /// the number of subscriptions released.
    pub(crate) async fn release_all(&self, transport: Option<&dyn Transport>) -> usize {
        let entries = self.inner.topics.read().ordered();
        let mut released = 0;
        for entry in entries {
            let _op = entry.op_lock().lock().await;
            if release(&entry, transport).await {
                released += 1;
            }
        }
        released
    }
}

/// Detaches a topic's subscription, then closes it on the wire.
///
/// The caller holds the topic's op lock.
async fn release(entry: &TopicEntry, transport: Option<&dyn Transport>) -> bool {
    let Some(subscription) = entry.detach() else {
        return false;
    };

    if let Some(transport) = transport.filter(|t| probe_alive(*t)) {
        let handle = subscription.handle();
        if let Err(e) = shielded("close_subscription", transport.close_subscription(handle)).await {
            warn!(topic = entry.name(), error = %e, "Close failed during teardown");
        }
    }

    debug!(topic = entry.name(), "Subscription released");
    true
}

// ============================================================================
// SubscriptionRegistry - Delivery
// ============================================================================

impl SubscriptionRegistry {
    /// Records a frame for `name`.
    ///
    /// This is the entry point transports reach through the handler passed
    /// to `open_subscription`. Returns `false` if the topic is unknown, not
    /// subscribed, or bound under a different `generation`.
    pub fn on_frame(&self, name: &str, generation: Generation, payload: Value) -> bool {
        self.entry(name)
            .is_ok_and(|entry| entry.accept(generation, payload))
    }

    /// Drops the latest frame of a topic, keeping its counters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TopicNotFound`] if `name` is not configured.
    pub fn clear_latest(&self, name: &str) -> Result<bool> {
        Ok(self.entry(name)?.clear_latest())
    }
}

// ============================================================================
// SubscriptionRegistry - Reads
// ============================================================================

impl SubscriptionRegistry {
    /// Returns the configured topic names in insertion order.
    #[must_use]
    pub fn list_topics(&self) -> Vec<String> {
        self.inner.topics.read().order.clone()
    }

    /// Returns `true` if `name` is configured.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.topics.read().by_name.contains_key(name)
    }

    /// Returns the number of configured topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.topics.read().order.len()
    }

    /// Returns `true` if no topic is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the message type configured for `name`.
    #[must_use]
    pub fn message_type(&self, name: &str) -> Option<String> {
        self.entry(name).ok().map(|e| e.message_type().to_string())
    }

    /// Returns `true` if `name` has a live subscription.
    #[must_use]
    pub fn is_subscribed(&self, name: &str) -> bool {
        self.observed(name).is_ok_and(|e| e.is_subscribed())
    }

    /// Returns the current binding generation of `name`, if subscribed.
    #[must_use]
    pub fn generation(&self, name: &str) -> Option<Generation> {
        self.observed(name).ok().and_then(|e| e.generation())
    }

    /// Returns the latest frame of `name`, if any.
    #[must_use]
    pub fn latest(&self, name: &str) -> Option<Frame> {
        self.observed(name).ok().and_then(|e| e.latest())
    }

    /// Returns a receiver that always holds the newest frame of `name`.
    ///
    /// The receiver closes when the subscription ends.
    ///
    /// # Errors
    ///
    /// - [`Error::TopicNotFound`] if `name` is not configured
    /// - [`Error::NotSubscribed`] if the topic has no live subscription
    pub fn watch(&self, name: &str) -> Result<watch::Receiver<Option<Frame>>> {
        self.observed(name)?
            .watch()
            .ok_or_else(|| Error::not_subscribed(name))
    }

    /// Returns a status snapshot of `name`.
    #[must_use]
    pub fn topic(&self, name: &str) -> Option<TopicStatus> {
        self.observed(name).ok().map(|e| e.status())
    }

    /// Returns status snapshots of every topic in insertion order.
    #[must_use]
    pub fn topics(&self) -> Vec<TopicStatus> {
        let entries = self.inner.topics.read().ordered();
        self.reap(&entries);
        entries.iter().map(|e| e.status()).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
