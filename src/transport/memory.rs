//! In-process broker.
//!
//! [`MemoryBroker`] stands in for a rosbridge server inside one process.
//! Transports created by its factory share the broker's routing table, so
//! [`MemoryBroker::publish`] reaches every live subscription on a topic.
//!
//! The broker can also be told to misbehave: refuse or never complete a
//! handshake, fail or panic while opening a subscription, fail to close
//! one. Counters record how many transports were created and how many were
//! live at once.
//!
//! Services answer with canned values registered through
//! [`MemoryBroker::serve`]. `/rosapi/services` lists them unless it is
//! served explicitly.
//!
//! # Example
//!
//! ```ignore
//! let broker = MemoryBroker::new();
//! broker.advertise("/chatter", "std_msgs/String");
//!
//! let session = BridgeSession::new(config, Arc::new(broker.factory()), sink);
//! session.connect("localhost", 9090).await?;
//!
//! broker.publish("/chatter", json!({"data": "hello"}));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::config::Endpoint;
use crate::error::{Error, Result};
use crate::identifiers::SubscriptionId;

use super::{
    FrameHandler, RemoteTopic, SubscriptionHandle, Transport, TransportFactory, panic_message,
};

// ============================================================================
// Types
// ============================================================================

/// Injected misbehaviour, keyed by host or topic.
#[derive(Debug, Default)]
struct Faults {
    refused_hosts: FxHashSet<String>,
    unreachable_hosts: FxHashSet<String>,
    panicking_hosts: FxHashSet<String>,
    slow_hosts: FxHashMap<String, u32>,
    failing_opens: FxHashSet<String>,
    panicking_opens: FxHashSet<String>,
    failing_closes: FxHashSet<String>,
    fail_create: bool,
}

/// rosapi service listing the services the broker answers.
const SERVICES_SERVICE: &str = "/rosapi/services";

/// Canned answer to a service call.
#[derive(Debug, Clone)]
enum ServiceReply {
    Values(Value),
    Failure(String),
}

/// One routed wire subscription.
struct Route {
    topic: String,
    transport: u64,
    handler: FrameHandler,
}

/// Broker state shared by every transport it created.
#[derive(Default)]
struct BrokerInner {
    faults: Mutex<Faults>,
    advertised: Mutex<Vec<RemoteTopic>>,
    services: Mutex<FxHashMap<String, ServiceReply>>,
    calls: Mutex<Vec<(String, Value)>>,
    routes: Mutex<FxHashMap<SubscriptionId, Route>>,
    transports: Mutex<FxHashMap<u64, Arc<AtomicBool>>>,
    next_transport: AtomicU64,
    created: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    liveness_polls: AtomicUsize,
    opens: AtomicUsize,
}

impl BrokerInner {
    fn mark_live(&self, flag: &AtomicBool) {
        if !flag.swap(true, Ordering::AcqRel) {
            let live = self.live.fetch_add(1, Ordering::AcqRel) + 1;
            self.max_live.fetch_max(live, Ordering::AcqRel);
        }
    }

    fn mark_dead(&self, transport: u64) {
        let flag = self.transports.lock().remove(&transport);
        if let Some(flag) = flag
            && flag.swap(false, Ordering::AcqRel)
        {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        self.routes.lock().retain(|_, route| route.transport != transport);
    }
}

// ============================================================================
// MemoryBroker
// ============================================================================

/// In-process pub/sub broker.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a factory producing transports attached to this broker.
    #[must_use]
    pub fn factory(&self) -> MemoryTransportFactory {
        MemoryTransportFactory {
            broker: self.clone(),
        }
    }

    // ========================================================================
    // Topics
    // ========================================================================

    /// Advertises a topic, as listed by `remote_topics`.
    pub fn advertise(&self, name: impl Into<String>, message_type: impl Into<String>) {
        let name = name.into();
        let message_type = message_type.into();
        let mut advertised = self.inner.advertised.lock();
        match advertised.iter_mut().find(|t| t.name == name) {
            Some(existing) => existing.message_type = message_type,
            None => advertised.push(RemoteTopic { name, message_type }),
        }
    }

    // ========================================================================
    // Services
    // ========================================================================

    /// Answers calls to `service` with `values`.
    pub fn serve(&self, service: impl Into<String>, values: Value) {
        self.inner
            .services
            .lock()
            .insert(service.into(), ServiceReply::Values(values));
    }

    /// Rejects calls to `service` with `message`.
    pub fn fail_service(&self, service: impl Into<String>, message: impl Into<String>) {
        self.inner
            .services
            .lock()
            .insert(service.into(), ServiceReply::Failure(message.into()));
    }

    /// Arguments of every call made to `service`, oldest first.
    #[must_use]
    pub fn service_calls(&self, service: &str) -> Vec<Value> {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|(name, _)| name == service)
            .map(|(_, args)| args.clone())
            .collect()
    }

    fn service_listing(&self) -> Value {
        let mut names: Vec<String> = self.inner.services.lock().keys().cloned().collect();
        names.sort();
        json!({ "services": names })
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Delivers `payload` to every live subscription on `topic`.
    ///
    /// Returns the number of handlers that received the frame. Handlers run
    /// on the caller's thread, outside any broker lock.
    pub fn publish(&self, topic: &str, payload: Value) -> usize {
        let handlers: Vec<FrameHandler> = {
            let transports = self.inner.transports.lock();
            self.inner
                .routes
                .lock()
                .values()
                .filter(|route| route.topic == topic)
                .filter(|route| {
                    transports
                        .get(&route.transport)
                        .is_some_and(|flag| flag.load(Ordering::Acquire))
                })
                .map(|route| Arc::clone(&route.handler))
                .collect()
        };

        let mut delivered = 0;
        for handler in handlers {
            let frame = payload.clone();
            match panic::catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    error!(topic, panic = %panic_message(panic.as_ref()), "Frame handler panicked");
                }
            }
        }
        delivered
    }

    /// Drops every live connection, as if the broker went away.
    pub fn kill_connections(&self) {
        let ids: Vec<u64> = self.inner.transports.lock().keys().copied().collect();
        for id in ids {
            self.inner.mark_dead(id);
        }
        debug!("Memory broker dropped all connections");
    }

    // ========================================================================
    // Fault Injection
    // ========================================================================

    /// `connect` to `host` returns an error.
    pub fn refuse_host(&self, host: impl Into<String>) {
        self.inner.faults.lock().refused_hosts.insert(host.into());
    }

    /// `connect` to `host` succeeds but the transport never becomes live.
    pub fn make_unreachable(&self, host: impl Into<String>) {
        self.inner.faults.lock().unreachable_hosts.insert(host.into());
    }

    /// `connect` to `host` panics.
    pub fn panic_on_connect(&self, host: impl Into<String>) {
        self.inner.faults.lock().panicking_hosts.insert(host.into());
    }

    /// Transports to `host` become live on the poll after `polls` liveness polls.
    pub fn delay_host(&self, host: impl Into<String>, polls: u32) {
        self.inner.faults.lock().slow_hosts.insert(host.into(), polls);
    }

    /// `open_subscription` on `topic` returns an error.
    pub fn fail_open(&self, topic: impl Into<String>) {
        self.inner.faults.lock().failing_opens.insert(topic.into());
    }

    /// `open_subscription` on `topic` panics.
    pub fn panic_on_open(&self, topic: impl Into<String>) {
        self.inner.faults.lock().panicking_opens.insert(topic.into());
    }

    /// `close_subscription` on `topic` returns an error.
    pub fn fail_close(&self, topic: impl Into<String>) {
        self.inner.faults.lock().failing_closes.insert(topic.into());
    }

    /// The factory refuses to create transports.
    pub fn fail_create(&self, fail: bool) {
        self.inner.faults.lock().fail_create = fail;
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        *self.inner.faults.lock() = Faults::default();
    }

    // ========================================================================
    // Counters
    // ========================================================================

    /// Number of transports created so far.
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.inner.created.load(Ordering::Acquire)
    }

    /// Number of transports live right now.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Highest number of transports that were ever live at once.
    #[must_use]
    pub fn max_live_count(&self) -> usize {
        self.inner.max_live.load(Ordering::Acquire)
    }

    /// Number of `is_alive` calls across all transports.
    #[must_use]
    pub fn liveness_polls(&self) -> usize {
        self.inner.liveness_polls.load(Ordering::Acquire)
    }

    /// Number of successful `open_subscription` calls so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::Acquire)
    }

    /// Number of wire subscriptions currently routed for `topic`.
    #[must_use]
    pub fn route_count(&self, topic: &str) -> usize {
        self.inner
            .routes
            .lock()
            .values()
            .filter(|route| route.topic == topic)
            .count()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("created", &self.created_count())
            .field("live", &self.live_count())
            .field("routes", &self.inner.routes.lock().len())
            .finish()
    }
}

// ============================================================================
// MemoryTransportFactory
// ============================================================================

/// Factory producing [`MemoryTransport`]s attached to one broker.
#[derive(Debug, Clone)]
pub struct MemoryTransportFactory {
    broker: MemoryBroker,
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>> {
        let inner = &self.broker.inner;
        if inner.faults.lock().fail_create {
            return Err(Error::connection(format!(
                "cannot create transport for {endpoint}"
            )));
        }

        let id = inner.next_transport.fetch_add(1, Ordering::AcqRel);
        inner.created.fetch_add(1, Ordering::AcqRel);

        Ok(Arc::new(MemoryTransport {
            id,
            endpoint: endpoint.clone(),
            broker: self.broker.clone(),
            alive: Arc::new(AtomicBool::new(false)),
            pending_polls: Mutex::new(None),
        }))
    }
}

// ============================================================================
// MemoryTransport
// ============================================================================

/// Transport attached to a [`MemoryBroker`].
pub struct MemoryTransport {
    id: u64,
    endpoint: Endpoint,
    broker: MemoryBroker,
    alive: Arc<AtomicBool>,
    /// Polls left before a delayed handshake completes.
    /// `Some(u32::MAX)` never completes.
    pending_polls: Mutex<Option<u32>>,
}

impl MemoryTransport {
    fn inner(&self) -> &BrokerInner {
        &self.broker.inner
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect(&self) -> Result<()> {
        let host = self.endpoint.host.as_str();
        let (refused, unreachable, panics, delay) = {
            let faults = self.inner().faults.lock();
            (
                faults.refused_hosts.contains(host),
                faults.unreachable_hosts.contains(host),
                faults.panicking_hosts.contains(host),
                faults.slow_hosts.get(host).copied(),
            )
        };

        if panics {
            panic!("handshake with {} blew up", self.endpoint);
        }
        if refused {
            return Err(Error::connection(format!(
                "connection to {} refused",
                self.endpoint
            )));
        }

        self.inner()
            .transports
            .lock()
            .insert(self.id, Arc::clone(&self.alive));

        if unreachable {
            *self.pending_polls.lock() = Some(u32::MAX);
        } else if let Some(polls) = delay {
            *self.pending_polls.lock() = Some(polls);
        } else {
            self.inner().mark_live(&self.alive);
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.inner().liveness_polls.fetch_add(1, Ordering::AcqRel);

        let mut pending = self.pending_polls.lock();
        match *pending {
            Some(u32::MAX) => {}
            Some(0) => {
                *pending = None;
                self.inner().mark_live(&self.alive);
            }
            Some(left) => *pending = Some(left - 1),
            None => {}
        }
        self.alive.load(Ordering::Acquire)
    }

    async fn disconnect(&self) -> Result<()> {
        *self.pending_polls.lock() = None;
        self.inner().mark_dead(self.id);
        self.alive.store(false, Ordering::Release);
        Ok(())
    }

    async fn open_subscription(
        &self,
        topic: &str,
        _message_type: &str,
        _buffer_depth: usize,
        on_frame: FrameHandler,
    ) -> Result<SubscriptionHandle> {
        self.ensure_alive()?;

        let (fails, panics) = {
            let faults = self.inner().faults.lock();
            (
                faults.failing_opens.contains(topic),
                faults.panicking_opens.contains(topic),
            )
        };
        if panics {
            panic!("broker crashed subscribing to {topic}");
        }
        if fails {
            return Err(Error::subscription(topic, "broker rejected subscribe"));
        }

        let id = SubscriptionId::generate(topic);
        self.inner().routes.lock().insert(
            id.clone(),
            Route {
                topic: topic.to_string(),
                transport: self.id,
                handler: on_frame,
            },
        );
        self.inner().opens.fetch_add(1, Ordering::AcqRel);

        Ok(SubscriptionHandle {
            id,
            topic: topic.to_string(),
        })
    }

    async fn close_subscription(&self, handle: &SubscriptionHandle) -> Result<()> {
        self.ensure_alive()?;

        if self.inner().faults.lock().failing_closes.contains(&handle.topic) {
            return Err(Error::subscription(
                &handle.topic,
                "broker rejected unsubscribe",
            ));
        }

        self.inner().routes.lock().remove(&handle.id);
        Ok(())
    }

    async fn call_service(&self, service: &str, args: Value) -> Result<Value> {
        self.ensure_alive()?;
        self.inner()
            .calls
            .lock()
            .push((service.to_string(), args));

        let reply = self.inner().services.lock().get(service).cloned();
        match reply {
            Some(ServiceReply::Values(values)) => Ok(values),
            Some(ServiceReply::Failure(message)) => Err(Error::service(service, message)),
            None if service == SERVICES_SERVICE => Ok(self.broker.service_listing()),
            None => Err(Error::service(service, "service does not exist")),
        }
    }

    async fn remote_topics(&self) -> Result<Vec<RemoteTopic>> {
        self.ensure_alive()?;
        Ok(self.inner().advertised.lock().clone())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.inner().mark_dead(self.id);
    }
}

// ============================================================================
// Tests
// ============================================================================
