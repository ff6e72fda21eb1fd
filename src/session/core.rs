//! Bridge session: the process's one broker connection.
//!
//! The [`BridgeSession`] owns the transport and the
//! [`SubscriptionRegistry`] multiplexed over it. Connect and disconnect
//! are serialized by a lifecycle lock, so at most one transport is ever
//! live and readers never see a half torn-down session.
//!
//! # Example
//!
//! ```ignore
//! use bridge_session::{BridgeSession, SessionConfig};
//!
//! let session = BridgeSession::with_defaults(SessionConfig::new())?;
//! session.connect("localhost", 9090).await?;
//!
//! let registry = session.registry();
//! registry.add_topic("/chatter", "std_msgs/String")?;
//! registry.subscribe("/chatter").await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::{Endpoint, RetryPolicy, SessionConfig};
use crate::error::{Error, Result};
use crate::notify::{NotificationSink, Notifier, TracingSink};
use crate::registry::{SubscriptionRegistry, TopicStatus};
use crate::transport::{
    RemoteTopic, RosbridgeFactory, Transport, TransportFactory, panic_message, probe_alive,
    shielded,
};

use super::slot::TransportSlot;

// ============================================================================
// SessionStatus
// ============================================================================

/// Point-in-time view of the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    /// Endpoint of the last connect.
    pub endpoint: Endpoint,
    /// Whether the transport is live.
    pub connected: bool,
    /// Every configured topic in insertion order.
    pub topics: Vec<TopicStatus>,
}

// ============================================================================
// Types
// ============================================================================

/// Internal shared state for the session.
struct SessionInner {
    config: SessionConfig,
    retry: RetryPolicy,
    factory: Arc<dyn TransportFactory>,
    /// Endpoint of the last connect (or the configured one before that).
    endpoint: RwLock<Endpoint>,
    slot: Arc<TransportSlot>,
    /// Serializes connect and disconnect.
    lifecycle: tokio::sync::Mutex<()>,
    registry: SubscriptionRegistry,
    notifier: Notifier,
}

// ============================================================================
// BridgeSession
// ============================================================================

/// Owner of the single broker connection.
///
/// Constructed once and passed to whatever needs it; clones share the same
/// connection and registry.
#[derive(Clone)]
pub struct BridgeSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeSession")
            .field("endpoint", &*self.inner.endpoint.read())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// BridgeSession - Constructors
// ============================================================================

impl BridgeSession {
    /// Creates a disconnected session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` does not validate.
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        config.validate()?;

        let slot = Arc::new(TransportSlot::default());
        let notifier = Notifier::new(sink);
        let registry = SubscriptionRegistry::new(Arc::clone(&slot), notifier.clone());

        debug!(endpoint = %config.endpoint, "Bridge session created");

        Ok(Self {
            inner: Arc::new(SessionInner {
                retry: config.retry_policy(),
                endpoint: RwLock::new(config.endpoint.clone()),
                config,
                factory,
                slot,
                lifecycle: tokio::sync::Mutex::new(()),
                registry,
                notifier,
            }),
        })
    }

    /// Creates a session speaking rosbridge and notifying through `tracing`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` does not validate.
    pub fn with_defaults(config: SessionConfig) -> Result<Self> {
        let factory = Arc::new(RosbridgeFactory::new(&config));
        Self::new(config, factory, Arc::new(TracingSink))
    }
}

// ============================================================================
// BridgeSession - Accessors
// ============================================================================

impl BridgeSession {
    /// Returns the topic registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    /// Returns the endpoint of the last connect.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint.read().clone()
    }

    /// Returns the session configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Returns `true` if a transport exists and reports live.
    ///
    /// Never blocks.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.slot.live().is_some()
    }

    /// Returns a snapshot of the session and all topics.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            endpoint: self.endpoint(),
            connected: self.is_connected(),
            topics: self.inner.registry.topics(),
        }
    }
}

// ============================================================================
// BridgeSession - Lifecycle
// ============================================================================

impl BridgeSession {
    /// Connects to the broker at `host:port`.
    ///
    /// - Already live on the same endpoint: returns `Ok` without touching
    ///   the connection.
    /// - Existing transport on another endpoint, or a dead one: every
    ///   topic is unsubscribed and the transport torn down first. Topics
    ///   stay configured and must be subscribed again.
    ///
    /// After the handshake starts, liveness is polled up to
    /// `connect_attempts` times, `connect_backoff_ms` apart.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the endpoint is invalid
    /// - [`Error::ConnectionTimeout`] if the transport never became live
    /// - [`Error::Connection`] if the transport could not be created or
    ///   the handshake failed
    pub async fn connect(&self, host: impl Into<String>, port: u16) -> Result<()> {
        let endpoint = Endpoint::new(host, port);
        if let Err(e) = endpoint.validate() {
            self.inner
                .notifier
                .negative(format!("Invalid endpoint {endpoint}: {e}"));
            return Err(e);
        }

        let _lifecycle = self.inner.lifecycle.lock().await;

        let previous = match self.inner.slot.get() {
            Some(current) if current.endpoint() == &endpoint && probe_alive(current.as_ref()) => {
                debug!(%endpoint, "Already connected");
                return Ok(());
            }
            Some(current) => {
                let previous = current.endpoint().clone();
                drop(current);
                self.teardown().await;
                Some(previous)
            }
            None => None,
        };

        *self.inner.endpoint.write() = endpoint.clone();

        match self.establish(&endpoint).await {
            Ok(()) => {
                match previous {
                    Some(previous) if previous != endpoint => {
                        info!(%endpoint, %previous, "Reconnected to new endpoint");
                        self.inner
                            .notifier
                            .positive(format!("Connected to {endpoint} (was {previous})"));
                    }
                    _ => {
                        info!(%endpoint, "Connected");
                        self.inner.notifier.positive(format!("Connected to {endpoint}"));
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!(%endpoint, error = %e, "Connect failed");
                self.inner
                    .notifier
                    .negative(format!("Failed to connect to {endpoint}: {e}"));
                Err(e)
            }
        }
    }

    /// Unsubscribes every topic and tears the transport down.
    ///
    /// Close failures are ignored. Calling this while disconnected does
    /// nothing.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if !self.teardown().await {
            debug!("Disconnect ignored, no transport");
            return;
        }

        let endpoint = self.endpoint();
        info!(%endpoint, "Disconnected");
        self.inner
            .notifier
            .info(format!("Disconnected from {endpoint}"));
    }

    /// Creates a transport, starts the handshake and polls until live.
    ///
    /// The caller holds the lifecycle lock and the slot is empty. A
    /// transport that fails is disconnected before returning.
    async fn establish(&self, endpoint: &Endpoint) -> Result<()> {
        let factory = &self.inner.factory;
        let transport = match catch_unwind(AssertUnwindSafe(|| factory.create(endpoint))) {
            Ok(created) => created?,
            Err(panic) => {
                return Err(Error::connection(format!(
                    "transport construction panicked: {}",
                    panic_message(panic.as_ref())
                )));
            }
        };

        if let Err(e) = shielded("connect", transport.connect()).await {
            discard(transport).await;
            return Err(e);
        }

        let RetryPolicy {
            max_attempts,
            backoff,
        } = self.inner.retry;

        for attempt in 1..=max_attempts {
            if probe_alive(transport.as_ref()) {
                debug!(%endpoint, attempt, "Transport live");
                let replaced = self.inner.slot.install(transport);
                debug_assert!(replaced.is_none(), "second transport installed");
                return Ok(());
            }
            if attempt < max_attempts {
                tokio::time::sleep(backoff).await;
            }
        }

        discard(transport).await;
        Err(Error::connection_timeout(
            max_attempts,
            millis(self.inner.retry.budget()),
        ))
    }

    /// Releases every subscription and disconnects the transport.
    ///
    /// Returns `false` if there was no transport. The caller holds the
    /// lifecycle lock.
    async fn teardown(&self) -> bool {
        let Some(transport) = self.inner.slot.take() else {
            return false;
        };

        let released = self.inner.registry.release_all(Some(transport.as_ref())).await;
        debug!(endpoint = %transport.endpoint(), released, "Subscriptions released");

        discard(transport).await;
        true
    }
}

/// Disconnects a transport, logging failures.
async fn discard(transport: Arc<dyn Transport>) {
    if let Err(e) = shielded("disconnect", transport.disconnect()).await {
        warn!(endpoint = %transport.endpoint(), error = %e, "Transport disconnect failed");
    }
}

#[inline]
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// BridgeSession - Discovery
// ============================================================================

impl BridgeSession {
    /// Lists the topics the broker advertises.
    ///
    /// Returns an empty list while disconnected.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker's listing call fails.
    pub async fn available_topics(&self) -> Result<Vec<RemoteTopic>> {
        let Some(transport) = self.inner.slot.live() else {
            return Ok(Vec::new());
        };
        shielded("remote_topics", transport.remote_topics()).await
    }

    /// Returns the message type of `name`.
    ///
    /// Configured topics answer from the registry; otherwise the broker's
    /// listing is consulted. `None` if neither knows the topic.
    pub async fn topic_type(&self, name: &str) -> Option<String> {
        if let Some(message_type) = self.inner.registry.message_type(name) {
            return Some(message_type);
        }

        match self.available_topics().await {
            Ok(topics) => topics
                .into_iter()
                .find(|t| t.name == name)
                .map(|t| t.message_type),
            Err(e) => {
                debug!(topic = name, error = %e, "Topic type lookup failed");
                None
            }
        }
    }
}

// ============================================================================
// BridgeSession - Services
// ============================================================================

/// rosapi service listing the services the broker offers.
const SERVICES_SERVICE: &str = "/rosapi/services";

impl BridgeSession {
    /// Calls a broker service and returns its response values.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `service` is blank
    /// - [`Error::NotConnected`] if the session has no live transport
    /// - [`Error::Service`] if the broker rejects the call
    /// - [`Error::RequestTimeout`] if no response arrives in time
    pub async fn call_service(&self, service: &str, args: Value) -> Result<Value> {
        if service.trim().is_empty() {
            return Err(Error::config("Service name must not be empty"));
        }
        let Some(transport) = self.inner.slot.live() else {
            return Err(Error::NotConnected);
        };

        match shielded("call_service", transport.call_service(service, args)).await {
            Ok(values) => {
                debug!(service, "Service call succeeded");
                Ok(values)
            }
            Err(e) => {
                warn!(service, error = %e, "Service call failed");
                Err(e)
            }
        }
    }

    /// Lists the services the broker offers.
    ///
    /// Returns an empty list while disconnected.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker's listing call fails.
    pub async fn available_services(&self) -> Result<Vec<String>> {
        if !self.is_connected() {
            return Ok(Vec::new());
        }
        let values = self.call_service(SERVICES_SERVICE, json!({})).await?;
        parse_service_listing(&values)
    }
}

fn parse_service_listing(values: &Value) -> Result<Vec<String>> {
    let services = values
        .get("services")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::protocol("service listing has no services array"))?;
    Ok(services
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ChannelSink, Notification, Severity};
    use crate::transport::MemoryBroker;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        broker: MemoryBroker,
        session: BridgeSession,
        notifications: mpsc::UnboundedReceiver<Notification>,
    }

    fn fast_config() -> SessionConfig {
        SessionConfig::new()
            .with_connect_attempts(3)
            .with_connect_backoff_ms(5)
    }

    fn fixture() -> Fixture {
        let broker = MemoryBroker::new();
        let (sink, notifications) = ChannelSink::new();
        let session = BridgeSession::new(
            fast_config(),
            Arc::new(broker.factory()),
            Arc::new(sink),
        )
        .expect("session");
        Fixture {
            broker,
            session,
            notifications,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[test]
    fn test_invalid_config_rejected() {
        let broker = MemoryBroker::new();
        let result = BridgeSession::new(
            SessionConfig::new().with_connect_attempts(0),
            Arc::new(broker.factory()),
            Arc::new(TracingSink),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let mut f = fixture();
        assert!(!f.session.is_connected());

        assert_ok!(f.session.connect("localhost", 9090).await);
        assert!(f.session.is_connected());
        assert_eq!(f.session.endpoint(), Endpoint::new("localhost", 9090));

        f.session.disconnect().await;
        assert!(!f.session.is_connected());
        assert_eq!(f.broker.live_count(), 0);

        let notes = drain(&mut f.notifications);
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].severity, Severity::Positive);
        assert_eq!(notes[1].severity, Severity::Info);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut f = fixture();
        f.session.disconnect().await;
        f.session.connect("localhost", 9090).await.expect("connect");
        f.session.disconnect().await;
        f.session.disconnect().await;

        let notes = drain(&mut f.notifications);
        assert_eq!(notes.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_endpoint() {
        let mut f = fixture();
        let err = assert_err!(f.session.connect("", 9090).await);
        assert!(err.is_configuration_error());
        assert!(f.session.connect("robot", 0).await.is_err());
        assert_eq!(f.broker.created_count(), 0);
        assert_eq!(drain(&mut f.notifications).len(), 2);
    }

    #[tokio::test]
    async fn test_same_endpoint_is_noop() {
        let mut f = fixture();
        f.session.connect("localhost", 9090).await.expect("connect");
        drain(&mut f.notifications);

        assert_ok!(f.session.connect("localhost", 9090).await);
        assert_eq!(f.broker.created_count(), 1);
        assert!(drain(&mut f.notifications).is_empty());
    }

    #[tokio::test]
    async fn test_same_endpoint_reconnects_when_dead() {
        let f = fixture();
        f.session.connect("localhost", 9090).await.expect("connect");
        f.broker.kill_connections();
        assert!(!f.session.is_connected());

        assert_ok!(f.session.connect("localhost", 9090).await);
        assert!(f.session.is_connected());
        assert_eq!(f.broker.created_count(), 2);
        assert_eq!(f.broker.max_live_count(), 1);
    }

    #[tokio::test]
    async fn test_at_most_one_live_transport() {
        let f = fixture();
        let endpoints = [
            ("alpha", 9090),
            ("beta", 9090),
            ("beta", 9090),
            ("alpha", 9091),
            ("gamma", 9090),
            ("alpha", 9090),
        ];
        for (host, port) in endpoints {
            f.session.connect(host, port).await.expect("connect");
            assert!(f.broker.live_count() <= 1);
        }

        assert_eq!(f.broker.max_live_count(), 1);
        assert_eq!(f.broker.live_count(), 1);
        assert_eq!(f.broker.created_count(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_connects_keep_one_transport() {
        let f = fixture();
        let mut tasks = Vec::new();
        for i in 0..8u16 {
            let session = f.session.clone();
            tasks.push(tokio::spawn(async move {
                let host = if i % 2 == 0 { "alpha" } else { "beta" };
                session.connect(host, 9090).await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("connect");
        }

        assert_eq!(f.broker.max_live_count(), 1);
        assert_eq!(f.broker.live_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_host_exhausts_polls() {
        let mut f = fixture();
        f.broker.make_unreachable("ghost");

        let err = assert_err!(f.session.connect("ghost", 9090).await);
        assert!(matches!(
            err,
            Error::ConnectionTimeout {
                attempts: 3,
                waited_ms: 10
            }
        ));
        assert_eq!(f.broker.liveness_polls(), 3);
        assert_eq!(f.broker.live_count(), 0);
        assert!(!f.session.is_connected());

        let notes = drain(&mut f.notifications);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].severity, Severity::Negative);
    }

    #[tokio::test]
    async fn test_slow_handshake_within_budget() {
        let f = fixture();
        f.broker.delay_host("slow", 1);
        assert_ok!(f.session.connect("slow", 9090).await);
        assert!(f.session.is_connected());
    }

    #[tokio::test]
    async fn test_refused_and_panicking_connects() {
        let f = fixture();
        f.broker.refuse_host("closed");
        f.broker.panic_on_connect("boom");

        assert!(f.session.connect("closed", 9090).await.unwrap_err().is_connection_error());
        assert!(f.session.connect("boom", 9090).await.unwrap_err().is_connection_error());
        assert!(!f.session.is_connected());

        assert_ok!(f.session.connect("fine", 9090).await);
        assert_eq!(f.broker.max_live_count(), 1);
    }

    #[tokio::test]
    async fn test_factory_failure() {
        let f = fixture();
        f.broker.fail_create(true);
        assert!(f.session.connect("localhost", 9090).await.is_err());
        assert!(!f.session.is_connected());
    }

    #[tokio::test]
    async fn test_failed_reconnect_leaves_disconnected() {
        let f = fixture();
        f.session.connect("alpha", 9090).await.expect("connect");
        f.broker.make_unreachable("ghost");

        assert!(f.session.connect("ghost", 9090).await.is_err());
        assert!(!f.session.is_connected());
        assert_eq!(f.broker.live_count(), 0);
        assert_eq!(f.session.endpoint(), Endpoint::new("ghost", 9090));
    }

    #[tokio::test]
    async fn test_chatter_scenario() {
        let f = fixture();
        let registry = f.session.registry();

        assert_ok!(registry.add_topic("/chatter", "std_msgs/String"));
        assert!(registry.subscribe("/chatter").await.is_err());
        assert!(!registry.is_subscribed("/chatter"));

        f.session.connect("localhost", 9090).await.expect("connect");
        assert_ok!(registry.subscribe("/chatter").await);
        for text in ["a", "b", "c"] {
            f.broker.publish("/chatter", json!({ "data": text }));
        }

        let status = registry.topic("/chatter").expect("status");
        assert_eq!(status.frame_count, 3);
        assert_eq!(registry.latest("/chatter").expect("latest").payload["data"], "c");

        assert_ok!(registry.remove_topic("/chatter").await);
        assert!(!registry.list_topics().contains(&"/chatter".to_string()));
        assert_eq!(f.broker.route_count("/chatter"), 0);
    }

    #[tokio::test]
    async fn test_reconnect_elsewhere_unsubscribes() {
        let f = fixture();
        let registry = f.session.registry();
        registry.add_topic("/img", "sensor_msgs/Image").expect("add");
        f.session.connect("alpha", 9090).await.expect("connect");
        registry.subscribe("/img").await.expect("subscribe");

        f.session.connect("beta", 9090).await.expect("reconnect");
        let status = registry.topic("/img").expect("status");
        assert!(!status.subscribed);
        assert_eq!(f.broker.route_count("/img"), 0);
        assert_eq!(f.broker.publish("/img", json!({})), 0);

        assert_ok!(registry.subscribe("/img").await);
        assert_eq!(f.broker.route_count("/img"), 1);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_no_orphans() {
        let f = fixture();
        let registry = f.session.registry();
        for name in ["/a", "/b", "/c"] {
            registry.add_topic(name, "std_msgs/String").expect("add");
        }
        f.session.connect("localhost", 9090).await.expect("connect");
        registry.subscribe("/a").await.expect("subscribe");
        registry.subscribe("/b").await.expect("subscribe");
        f.broker.publish("/a", json!({"data": "x"}));
        let generation = registry.generation("/a").expect("generation");

        f.session.disconnect().await;

        assert!(registry.topics().iter().all(|t| !t.subscribed));
        assert_eq!(registry.list_topics().len(), 3);
        assert_eq!(f.broker.publish("/a", json!({"data": "y"})), 0);
        assert!(!registry.on_frame("/a", generation, json!({"data": "z"})));
        assert_eq!(registry.topic("/a").expect("status").frame_count, 1);
    }

    #[tokio::test]
    async fn test_disconnect_with_close_failures() {
        let f = fixture();
        f.broker.fail_close("/a");
        let registry = f.session.registry();
        registry.add_topic("/a", "std_msgs/String").expect("add");
        f.session.connect("localhost", 9090).await.expect("connect");
        registry.subscribe("/a").await.expect("subscribe");

        f.session.disconnect().await;
        assert!(!registry.is_subscribed("/a"));
        assert_eq!(f.broker.live_count(), 0);
    }

    fn exploding_sink(_message: &str, _severity: Severity) {
        panic!("toast layer exploded")
    }

    #[tokio::test]
    async fn test_panicking_sink_does_not_break_session() {
        let broker = MemoryBroker::new();
        let session = BridgeSession::new(
            fast_config(),
            Arc::new(broker.factory()),
            Arc::new(exploding_sink),
        )
        .expect("session");

        assert_ok!(session.connect("localhost", 9090).await);
        session.registry().add_topic("/a", "std_msgs/String").expect("add");
        assert_ok!(session.registry().subscribe("/a").await);
        session.disconnect().await;
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_available_topics_and_type_lookup() {
        let f = fixture();
        f.broker.advertise("/camera/image", "sensor_msgs/Image");
        f.broker.advertise("/chatter", "std_msgs/String");

        assert!(f.session.available_topics().await.expect("empty").is_empty());
        assert_eq!(f.session.topic_type("/chatter").await, None);

        f.session.connect("localhost", 9090).await.expect("connect");
        let topics = f.session.available_topics().await.expect("topics");
        assert_eq!(topics.len(), 2);

        f.session
            .registry()
            .add_topic("/chatter", "custom_msgs/Chat")
            .expect("add");
        assert_eq!(
            f.session.topic_type("/chatter").await.as_deref(),
            Some("custom_msgs/Chat")
        );
        assert_eq!(
            f.session.topic_type("/camera/image").await.as_deref(),
            Some("sensor_msgs/Image")
        );
        assert_eq!(f.session.topic_type("/missing").await, None);
    }

    #[tokio::test]
    async fn test_remote_drop_ends_subscriptions() {
        let f = fixture();
        let registry = f.session.registry();
        registry.add_topic("/a", "std_msgs/String").expect("add");
        f.session.connect("localhost", 9090).await.expect("connect");
        registry.subscribe("/a").await.expect("subscribe");

        f.broker.kill_connections();

        let status = f.session.status();
        assert!(!status.connected);
        assert!(!status.topics[0].subscribed);
        assert!(matches!(
            registry.subscribe("/a").await,
            Err(Error::NotConnected)
        ));

        f.session.connect("localhost", 9090).await.expect("reconnect");
        assert_ok!(registry.subscribe("/a").await);
        assert_eq!(f.broker.publish("/a", json!({"data": "back"})), 1);
        assert!(registry.topic("/a").expect("status").subscribed);
    }

    #[tokio::test]
    async fn test_call_service() {
        let f = fixture();
        f.broker.serve("/add_two_ints", json!({"sum": 5}));
        f.broker.fail_service("/reset", "not allowed");

        let err = assert_err!(f.session.call_service("/add_two_ints", json!({})).await);
        assert!(matches!(err, Error::NotConnected));
        assert!(f.session.available_services().await.expect("empty").is_empty());

        f.session.connect("localhost", 9090).await.expect("connect");
        let values = assert_ok!(
            f.session
                .call_service("/add_two_ints", json!({"a": 2, "b": 3}))
                .await
        );
        assert_eq!(values["sum"], 5);
        assert_eq!(
            f.broker.service_calls("/add_two_ints"),
            vec![json!({"a": 2, "b": 3})]
        );

        let err = assert_err!(f.session.call_service("/reset", json!({})).await);
        assert!(err.is_service_error());
        assert!(f.session.is_connected());

        let err = assert_err!(f.session.call_service(" ", json!({})).await);
        assert!(err.is_configuration_error());

        assert_eq!(
            assert_ok!(f.session.available_services().await),
            vec!["/add_two_ints".to_string(), "/reset".to_string()]
        );
    }

    #[test]
    fn test_parse_service_listing() {
        let services = parse_service_listing(&json!({"services": ["/a", 3, "/b"]}));
        assert_eq!(services.expect("parse"), vec!["/a", "/b"]);
        assert!(parse_service_listing(&json!({})).is_err());
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let f = fixture();
        f.session.registry().add_topic("/a", "std_msgs/String").expect("add");
        f.session.connect("localhost", 9090).await.expect("connect");

        let status = f.session.status();
        assert!(status.connected);
        assert_eq!(status.endpoint.to_string(), "localhost:9090");
        assert_eq!(status.topics.len(), 1);
        assert!(!status.topics[0].subscribed);

        let json = serde_json::to_value(&status).expect("serialize");
        assert_eq!(json["topics"][0]["name"], "/a");
    }

    #[test]
    fn test_session_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BridgeSession>();
    }
}
