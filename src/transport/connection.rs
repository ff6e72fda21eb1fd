//! WebSocket connection and event loop.
//!
//! This module handles the WebSocket connection to a rosbridge server,
//! including service call correlation and frame routing.
//!
//! # Event Loop
//!
//! The connection spawns a tokio task that handles:
//!
//! - The client handshake (bounded by a timeout)
//! - Incoming messages from the broker (frames, service responses, status)
//! - Outgoing operations from the transport
//! - Service call correlation by request id
//! - Frame routing to subscription handlers by topic

// ============================================================================
// Imports
// ============================================================================

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::{Value, from_str, to_string};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::{RequestId, SubscriptionId};
use crate::protocol::{Incoming, Operation};

use super::{FrameHandler, panic_message};

// ============================================================================
// Constants
// ============================================================================

/// Maximum pending service calls before rejecting new ones.
const MAX_PENDING_REQUESTS: usize = 100;

// ============================================================================
// Types
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type WsSink = SplitSink<WsStream, Message>;

/// Map of request IDs to response channels.
type CorrelationMap = FxHashMap<RequestId, oneshot::Sender<Result<Value>>>;

/// Map of topic to the handlers of every open subscription on it.
type RouteTable = FxHashMap<String, FxHashMap<SubscriptionId, FrameHandler>>;

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the event loop.
enum ConnectionCommand {
    /// Write an operation and report the outcome.
    Send {
        operation: Operation,
        written_tx: oneshot::Sender<Result<()>>,
    },
    /// Write a service call; the response arrives through correlation.
    Call {
        id: RequestId,
        operation: Operation,
        response_tx: oneshot::Sender<Result<Value>>,
    },
    /// Remove a timed-out correlation entry.
    RemoveCorrelation(RequestId),
    /// Shutdown the connection.
    Shutdown,
}

// ============================================================================
// Connection
// ============================================================================

/// WebSocket connection to a rosbridge server.
///
/// Handles service call correlation and frame routing. The connection
/// spawns an internal task that performs the handshake and then runs the
/// event loop.
///
/// # Thread Safety
///
/// `Connection` is `Send + Sync`. Frame handlers run on the event loop
/// task and must not block.
pub struct Connection {
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    /// Correlation map (shared with event loop).
    correlation: Arc<Mutex<CorrelationMap>>,
    /// Frame routes (shared with event loop).
    routes: Arc<RwLock<RouteTable>>,
    /// Set once the handshake completes, cleared when the loop exits.
    alive: Arc<AtomicBool>,
    /// Set by the first `shutdown`.
    closed: AtomicBool,
    /// Event loop task.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Starts connecting to `url`.
    ///
    /// Returns immediately; [`is_alive`](Self::is_alive) turns `true` once
    /// the handshake completes within `handshake_timeout`.
    pub(crate) fn spawn(url: Url, handshake_timeout: Duration) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let correlation = Arc::new(Mutex::new(CorrelationMap::default()));
        let routes = Arc::new(RwLock::new(RouteTable::default()));
        let alive = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(Self::run(
            url,
            handshake_timeout,
            command_rx,
            Arc::clone(&correlation),
            Arc::clone(&routes),
            Arc::clone(&alive),
        ));

        Self {
            command_tx,
            correlation,
            routes,
            alive,
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        }
    }

    /// Returns `true` while the WebSocket is open.
    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Registers a frame handler for a subscription.
    pub fn add_route(&self, topic: &str, id: SubscriptionId, handler: FrameHandler) {
        self.routes
            .write()
            .entry(topic.to_string())
            .or_default()
            .insert(id, handler);
    }

    /// Removes a frame handler. Returns `true` if it was registered.
    pub fn remove_route(&self, topic: &str, id: &SubscriptionId) -> bool {
        let mut routes = self.routes.write();
        let Some(handlers) = routes.get_mut(topic) else {
            return false;
        };
        let removed = handlers.remove(id).is_some();
        if handlers.is_empty() {
            routes.remove(topic);
        }
        removed
    }

    /// Writes an operation to the socket.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is not live
    /// - [`Error::WebSocket`] if the write fails
    pub async fn send(&self, operation: Operation) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::ConnectionClosed);
        }

        let (written_tx, written_rx) = oneshot::channel();
        self.command_tx
            .send(ConnectionCommand::Send {
                operation,
                written_tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;

        written_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Calls a service and waits for its response.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is closed
    /// - [`Error::RequestTimeout`] if no response arrives within `request_timeout`
    /// - [`Error::Protocol`] if too many calls are pending
    /// - [`Error::Service`] if the broker reported a failed call
    pub async fn call(
        &self,
        id: RequestId,
        operation: Operation,
        request_timeout: Duration,
    ) -> Result<Value> {
        if !self.is_alive() {
            return Err(Error::ConnectionClosed);
        }

        // Check pending request limit
        {
            let correlation = self.correlation.lock();
            if correlation.len() >= MAX_PENDING_REQUESTS {
                warn!(
                    pending = correlation.len(),
                    max = MAX_PENDING_REQUESTS,
                    "Too many pending service calls"
                );
                return Err(Error::protocol(format!(
                    "Too many pending service calls: {}/{}",
                    correlation.len(),
                    MAX_PENDING_REQUESTS
                )));
            }
        }

        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(ConnectionCommand::Call {
                id: id.clone(),
                operation,
                response_tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;

        match timeout(request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                let _ = self
                    .command_tx
                    .send(ConnectionCommand::RemoveCorrelation(id.clone()));

                Err(Error::request_timeout(
                    id,
                    request_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Returns the number of pending service calls.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.correlation.lock().len()
    }

    /// Shuts down the connection.
    ///
    /// A live socket is closed gracefully; a handshake still in progress
    /// is aborted. Routes are dropped immediately so no handler runs after
    /// this returns.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        self.routes.write().clear();

        let _ = self.command_tx.send(ConnectionCommand::Shutdown);

        if !was_alive && let Some(task) = self.task.lock().take() {
            task.abort();
            Self::fail_pending_requests(&self.correlation);
        }
    }

    /// Handshake followed by the event loop.
    async fn run(
        url: Url,
        handshake_timeout: Duration,
        command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
        correlation: Arc<Mutex<CorrelationMap>>,
        routes: Arc<RwLock<RouteTable>>,
        alive: Arc<AtomicBool>,
    ) {
        let ws_stream = match timeout(handshake_timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                warn!(%url, error = %e, "WebSocket handshake failed");
                return;
            }
            Err(_) => {
                warn!(
                    %url,
                    timeout_ms = handshake_timeout.as_millis() as u64,
                    "WebSocket handshake timed out"
                );
                return;
            }
        };

        alive.store(true, Ordering::Release);
        info!(%url, "Connected to rosbridge");

        Self::run_event_loop(ws_stream, command_rx, &correlation, &routes).await;

        alive.store(false, Ordering::Release);
        Self::fail_pending_requests(&correlation);

        debug!(%url, "Event loop terminated");
    }

    /// Event loop that handles WebSocket I/O.
    async fn run_event_loop(
        ws_stream: WsStream,
        mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
        correlation: &Arc<Mutex<CorrelationMap>>,
        routes: &Arc<RwLock<RouteTable>>,
    ) {
        let (mut ws_write, mut ws_read) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming messages from the broker
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_incoming_message(&text, correlation, routes);
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!("WebSocket closed by remote");
                            break;
                        }

                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            break;
                        }

                        None => {
                            debug!("WebSocket stream ended");
                            break;
                        }

                        // Ignore Binary, Ping, Pong
                        _ => {}
                    }
                }

                // Commands from the transport
                command = command_rx.recv() => {
                    match command {
                        Some(ConnectionCommand::Send { operation, written_tx }) => {
                            let result = Self::write_operation(&mut ws_write, &operation).await;
                            let _ = written_tx.send(result);
                        }

                        Some(ConnectionCommand::Call { id, operation, response_tx }) => {
                            correlation.lock().insert(id.clone(), response_tx);

                            if let Err(e) = Self::write_operation(&mut ws_write, &operation).await
                                && let Some(tx) = correlation.lock().remove(&id)
                            {
                                let _ = tx.send(Err(e));
                            }
                        }

                        Some(ConnectionCommand::RemoveCorrelation(id)) => {
                            correlation.lock().remove(&id);
                            debug!(%id, "Removed timed-out correlation");
                        }

                        Some(ConnectionCommand::Shutdown) => {
                            debug!("Shutdown command received");
                            let _ = ws_write.close().await;
                            break;
                        }

                        None => {
                            debug!("Command channel closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Serializes and writes one operation.
    async fn write_operation(ws_write: &mut WsSink, operation: &Operation) -> Result<()> {
        let json = to_string(operation)?;
        ws_write.send(Message::Text(json.into())).await?;
        trace!(op = operation.name(), "Operation sent");
        Ok(())
    }

    /// Handles an incoming text message from the broker.
    fn handle_incoming_message(
        text: &str,
        correlation: &Arc<Mutex<CorrelationMap>>,
        routes: &Arc<RwLock<RouteTable>>,
    ) {
        let incoming = match from_str::<Incoming>(text) {
            Ok(incoming) => incoming,
            Err(e) => {
                warn!(error = %e, "Failed to parse incoming message");
                return;
            }
        };

        match incoming {
            Incoming::Publish { topic, msg } => {
                // Clone handlers out so none runs under the route lock
                let handlers: Vec<FrameHandler> = routes
                    .read()
                    .get(&topic)
                    .map(|subs| subs.values().cloned().collect())
                    .unwrap_or_default();

                if handlers.is_empty() {
                    trace!(topic = %topic, "Frame for unrouted topic");
                }

                for handler in handlers {
                    let frame = msg.clone();
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                        error!(
                            topic = %topic,
                            panic = %panic_message(panic.as_ref()),
                            "Frame handler panicked"
                        );
                    }
                }
            }

            Incoming::ServiceResponse(response) => {
                let Some(id) = response.id.clone() else {
                    warn!(service = %response.service, "Service response without id");
                    return;
                };

                match correlation.lock().remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(response.into_result());
                    }
                    None => warn!(%id, "Response for unknown request"),
                }
            }

            Incoming::Status { level, msg } => match level.as_deref() {
                Some("error" | "warning") => warn!(?level, msg = %msg, "Broker status"),
                _ => debug!(?level, msg = %msg, "Broker status"),
            },

            Incoming::Unknown => trace!("Ignoring unsupported operation"),
        }
    }

    /// Fails all pending requests with ConnectionClosed error.
    fn fail_pending_requests(correlation: &Arc<Mutex<CorrelationMap>>) {
        let pending: Vec<_> = correlation.lock().drain().collect();
        let count = pending.len();

        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(count, "Failed pending requests on shutdown");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    fn counting_handler(count: &Arc<AtomicUsize>) -> FrameHandler {
        let count = Arc::clone(count);
        Arc::new(move |_frame: Value| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn exploding_handler(_frame: Value) {
        panic!("bad consumer");
    }

    #[test]
    fn test_constants() {
        assert_eq!(MAX_PENDING_REQUESTS, 100);
    }

    #[test]
    fn test_publish_routes_to_every_handler_on_topic() {
        let correlation = Arc::new(Mutex::new(CorrelationMap::default()));
        let routes = Arc::new(RwLock::new(RouteTable::default()));
        let hits = Arc::new(AtomicUsize::new(0));

        {
            let mut table = routes.write();
            let subs = table.entry("/chatter".to_string()).or_default();
            subs.insert(SubscriptionId::new("a"), counting_handler(&hits));
            subs.insert(SubscriptionId::new("b"), counting_handler(&hits));
        }

        Connection::handle_incoming_message(
            r#"{"op":"publish","topic":"/chatter","msg":{"data":"x"}}"#,
            &correlation,
            &routes,
        );
        Connection::handle_incoming_message(
            r#"{"op":"publish","topic":"/other","msg":{"data":"x"}}"#,
            &correlation,
            &routes,
        );

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_routing() {
        let correlation = Arc::new(Mutex::new(CorrelationMap::default()));
        let routes = Arc::new(RwLock::new(RouteTable::default()));
        let hits = Arc::new(AtomicUsize::new(0));

        {
            let mut table = routes.write();
            let subs = table.entry("/img".to_string()).or_default();
            subs.insert(SubscriptionId::new("bad"), Arc::new(exploding_handler));
            subs.insert(SubscriptionId::new("good"), counting_handler(&hits));
        }

        Connection::handle_incoming_message(
            r#"{"op":"publish","topic":"/img","msg":{}}"#,
            &correlation,
            &routes,
        );

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_service_response_resolves_correlation() {
        let correlation = Arc::new(Mutex::new(CorrelationMap::default()));
        let routes = Arc::new(RwLock::new(RouteTable::default()));
        let (tx, mut rx) = oneshot::channel();
        correlation.lock().insert(RequestId::new("call:1"), tx);

        Connection::handle_incoming_message(
            r#"{"op":"service_response","id":"call:1","service":"/s","values":{"ok":1},"result":true}"#,
            &correlation,
            &routes,
        );

        let values = rx.try_recv().expect("resolved").expect("success");
        assert_eq!(values["ok"], 1);
        assert!(correlation.lock().is_empty());
    }

    #[test]
    fn test_fail_pending_requests() {
        let correlation = Arc::new(Mutex::new(CorrelationMap::default()));
        let (tx, mut rx) = oneshot::channel();
        correlation.lock().insert(RequestId::new("call:2"), tx);

        Connection::fail_pending_requests(&correlation);

        assert!(matches!(rx.try_recv(), Ok(Err(Error::ConnectionClosed))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_never_goes_alive() {
        // Port 9 (discard) on localhost is almost never a WebSocket server
        let url = Url::parse("ws://127.0.0.1:9").expect("url");
        let connection = Connection::spawn(url, Duration::from_millis(200));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!connection.is_alive());

        let err = connection
            .send(Operation::unsubscribe(SubscriptionId::new("x"), "/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));

        connection.shutdown();
        assert!(!connection.is_alive());
    }

    #[tokio::test]
    async fn test_remove_route() {
        let url = Url::parse("ws://127.0.0.1:9").expect("url");
        let connection = Connection::spawn(url, Duration::from_millis(10));
        let hits = Arc::new(AtomicUsize::new(0));
        let id = SubscriptionId::new("s1");

        connection.add_route("/a", id.clone(), counting_handler(&hits));
        assert!(connection.remove_route("/a", &id));
        assert!(!connection.remove_route("/a", &id));

        connection.shutdown();
    }
}
