//! The hub: one explicit server-state object.
//!
//! [`Hub`] owns every piece of shared state the multiplexer needs:
//!
//! ```text
//! Hub
//!  ├── state: Mutex<ServerState>      registry + topic broker + streams
//!  ├── requests: RequestCoordinator   pending server → client requests
//!  ├── rpc: RpcRegistry               name → handler (RwLock)
//!  ├── auth: AuthGate
//!  ├── storage: Option<StorageBinding>
//!  └── events: mpsc::Sender<ServerEvent>
//! ```
//!
//! The registry, broker and stream registry share one mutex so that
//! [`Hub::disconnect`] purges a connection from all three atomically.  No lock
//! is ever held across an `.await`; outbound sends are non-blocking
//! `try_send`s on each connection's [`Transport`].
//!
//! The hub is created with [`Hub::new`], which also returns the receiving end
//! of the event channel, and torn down with [`Hub::shutdown`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use relay_core::{encode_frame, unix_millis, CloseReason, ConnectionId, OutboundMessage, SessionInfo};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::auth::AuthGate;
use crate::application::coordinator::{RequestCoordinator, RequestError};
use crate::application::events::{ServerEvent, StreamEndCause, EVENT_CHANNEL_CAPACITY};
use crate::application::heartbeat::{liveness, spawn_monitor, HeartbeatTarget, Liveness, TickOutcome};
use crate::application::ingestion::StorageBinding;
use crate::application::pubsub::TopicBroker;
use crate::application::registry::{AdmissionError, ConnectionRegistry, SessionStats};
use crate::application::rpc::{RpcError, RpcHandler, RpcRegistry};
use crate::application::streams::StreamRegistry;
use crate::application::transport::Transport;
use crate::domain::config::ServerConfig;

/// Version reported in `welcome` and `handshake_response`.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// State that must change together on teardown.
#[derive(Debug)]
pub struct ServerState {
    pub registry: ConnectionRegistry,
    pub broker: TopicBroker,
    pub streams: StreamRegistry,
}

/// Snapshot returned by [`Hub::stats`] and the `server.stats` RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub active_connections: usize,
    pub authenticated_connections: usize,
    pub total_connections: u64,
    pub topics: usize,
    pub subscriptions: usize,
    pub streams: usize,
    pub pending_requests: usize,
    pub uptime_secs: u64,
}

pub struct Hub {
    config: ServerConfig,
    auth: AuthGate,
    state: Mutex<ServerState>,
    requests: RequestCoordinator,
    rpc: RpcRegistry,
    storage: Option<StorageBinding>,
    events: mpsc::Sender<ServerEvent>,
    started_at: Instant,
    shutting_down: AtomicBool,
    self_ref: Weak<Hub>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("stats", &self.stats())
            .field("rpc", &self.rpc)
            .finish()
    }
}

impl Hub {
    /// Creates the hub and its event channel, and registers the built-in RPC
    /// methods (`echo`, `server.stats`, `server.time`).
    ///
    /// When auth is required but no token is configured, a random token is
    /// generated and logged once at `warn`.
    pub fn new(
        config: ServerConfig,
        storage: Option<StorageBinding>,
    ) -> (Arc<Hub>, mpsc::Receiver<ServerEvent>) {
        let (events, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (auth, generated) = AuthGate::new(config.auth.required, config.auth.token.clone());
        if let Some(token) = generated {
            warn!("auth.required is set but auth.token is not; generated token: {token}");
        }
        let max_connections = config.server.max_connections;

        let hub = Arc::new_cyclic(|weak: &Weak<Hub>| {
            let rpc = RpcRegistry::new();
            register_builtins(&rpc, weak.clone());
            Hub {
                config,
                auth,
                state: Mutex::new(ServerState {
                    registry: ConnectionRegistry::new(max_connections),
                    broker: TopicBroker::new(),
                    streams: StreamRegistry::new(),
                }),
                requests: RequestCoordinator::new(),
                rpc,
                storage,
                events,
                started_at: Instant::now(),
                shutting_down: AtomicBool::new(false),
                self_ref: weak.clone(),
            }
        });
        (hub, event_rx)
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }

    pub fn rpc(&self) -> &RpcRegistry {
        &self.rpc
    }

    pub fn requests(&self) -> &RequestCoordinator {
        &self.requests
    }

    pub fn storage(&self) -> Option<&StorageBinding> {
        self.storage.as_ref()
    }

    /// Locks the shared state.  Never hold the guard across an `.await`.
    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Admits a connection whose writer is already draining `transport`.
    ///
    /// On success the client receives `welcome`, `ClientConnected` is emitted
    /// and the heartbeat monitor starts.  On failure the transport is closed
    /// (1013 when full, 1001 during shutdown) and nothing is registered.
    ///
    /// # Errors
    ///
    /// [`AdmissionError`] describing the refusal.
    pub fn admit(
        &self,
        transport: Transport,
        remote_addr: Option<SocketAddr>,
        user_agent: Option<String>,
    ) -> Result<ConnectionId, AdmissionError> {
        if self.is_shutting_down() {
            transport.close(CloseReason::ServerShutdown);
            return Err(AdmissionError::ShuttingDown);
        }

        let authenticated = !self.auth.required();
        let admitted = {
            let mut state = self.state.lock();
            match state
                .registry
                .admit(transport.clone(), remote_addr, user_agent, authenticated)
            {
                Ok(id) => {
                    // Queued under the lock so `welcome` is the first frame.
                    transport.send(&self.welcome(id));
                    let session = state.registry.get_mut(&id).map(|conn| {
                        if self.config.heartbeat.enabled {
                            conn.set_heartbeat(spawn_monitor(
                                self.self_ref.clone(),
                                id,
                                self.config.heartbeat_interval(),
                            ));
                        }
                        conn.session.clone()
                    });
                    Ok((id, session))
                }
                Err(e) => Err(e),
            }
        };

        match admitted {
            Ok((id, session)) => {
                info!("connection {id} admitted from {remote_addr:?}");
                if let Some(session) = session {
                    self.emit(ServerEvent::ClientConnected { session });
                }
                Ok(id)
            }
            Err(e) => {
                warn!("refusing connection from {remote_addr:?}: {e}");
                transport.close(CloseReason::Overloaded);
                Err(e)
            }
        }
    }

    fn welcome(&self, id: ConnectionId) -> OutboundMessage {
        OutboundMessage::Welcome {
            connection_id: id,
            server_version: SERVER_VERSION.to_string(),
            auth_required: self.auth.required(),
            heartbeat_interval_ms: self
                .config
                .heartbeat
                .enabled
                .then(|| self.config.heartbeat_interval().as_millis() as u64),
            features: self.config.feature_set(),
        }
    }

    /// Tears a connection down.  Idempotent: the second call returns `None`.
    ///
    /// Subscriptions and owned streams are purged under the same lock as the
    /// registry entry; each owned stream is reported as ended.  Dropping the
    /// entry cancels its heartbeat monitor.
    pub fn disconnect(&self, id: ConnectionId) -> Option<SessionStats> {
        let (conn, stats, topics, streams) = {
            let mut state = self.state.lock();
            let (conn, stats) = state.registry.remove(&id)?;
            let topics = state.broker.remove_connection(id);
            let streams = state.streams.remove_owned_by(id);
            (conn, stats, topics, streams)
        };

        conn.transport.close(CloseReason::Normal);
        drop(conn);

        for stream in streams {
            self.emit(ServerEvent::StreamEnded {
                connection_id: id,
                stream_id: stream.stream_id,
                cause: StreamEndCause::Disconnect,
            });
        }
        info!(
            "connection {id} removed after {:?} ({} messages, {} topics)",
            stats.duration,
            stats.messages_received,
            topics.len()
        );
        self.emit(ServerEvent::ClientDisconnected {
            connection_id: id,
            stats,
        });
        Some(stats)
    }

    /// Closes the socket with `reason` and tears the connection down.
    pub fn close(&self, id: ConnectionId, reason: CloseReason) -> Option<SessionStats> {
        if let Some(transport) = self.transport_of(id) {
            transport.close(reason);
        }
        self.disconnect(id)
    }

    /// Fails pending requests, closes every connection with 1001 and
    /// refuses new ones.  Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let failed = self.requests.shutdown();
        let ids = {
            let state = self.state.lock();
            for conn in state.registry.iter() {
                conn.transport.close(CloseReason::ServerShutdown);
            }
            state.registry.ids()
        };
        info!(
            "hub shutting down: closing {} connections, failing {failed} pending requests",
            ids.len()
        );
        for id in ids {
            self.disconnect(id);
        }
    }

    /// Marks a liveness acknowledgement (WebSocket Pong, `heartbeat`, `ping`).
    pub fn record_heartbeat(&self, id: ConnectionId) {
        if let Some(conn) = self.state.lock().registry.get_mut(&id) {
            conn.record_heartbeat();
        }
    }

    // ── Lookups ───────────────────────────────────────────────────────────────

    pub fn transport_of(&self, id: ConnectionId) -> Option<Transport> {
        self.state
            .lock()
            .registry
            .get(&id)
            .map(|c| c.transport.clone())
    }

    pub fn session(&self, id: ConnectionId) -> Option<SessionInfo> {
        self.state
            .lock()
            .registry
            .get(&id)
            .map(|c| c.session.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn stats(&self) -> ServerStats {
        let state = self.state.lock();
        ServerStats {
            active_connections: state.registry.len(),
            authenticated_connections: state.registry.authenticated_count(),
            total_connections: state.registry.total_admitted(),
            topics: state.broker.topic_count(),
            subscriptions: state.broker.subscription_count(),
            streams: state.streams.len(),
            pending_requests: self.requests.pending_count(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Sends one frame to one connection.  `false` if unknown, closed or full.
    pub fn send_to(&self, id: ConnectionId, msg: &OutboundMessage) -> bool {
        match self.state.lock().registry.get(&id) {
            Some(conn) => conn.transport.send(msg),
            None => false,
        }
    }

    /// Sends a `publish` frame to every open subscriber of `topic` except
    /// `exclude` (normally the publishing connection, which is also named as
    /// the publisher).  Returns the number of successful sends.
    pub fn publish(&self, topic: &str, data: Value, exclude: Option<ConnectionId>) -> usize {
        let frame = OutboundMessage::Publish {
            topic: topic.to_string(),
            data,
            publisher: exclude,
        };
        let Ok(text) = encode_frame(&frame) else {
            return 0;
        };

        let state = self.state.lock();
        let delivered = state
            .broker
            .subscribers(topic)
            .into_iter()
            .filter(|id| Some(*id) != exclude)
            .filter_map(|id| state.registry.get(&id))
            .filter(|conn| conn.transport.send_text(text.clone()))
            .count();
        debug!("published to {topic}: {delivered} recipients");
        delivered
    }

    /// Sends a `broadcast` frame to every open connection, or only to those
    /// whose client category equals `category`.
    pub fn broadcast(&self, data: Value, category: Option<&str>) -> usize {
        let frame = OutboundMessage::Broadcast {
            data,
            category: category.map(str::to_owned),
        };
        let Ok(text) = encode_frame(&frame) else {
            return 0;
        };

        let state = self.state.lock();
        state
            .registry
            .iter()
            .filter(|conn| category.map_or(true, |c| conn.session.client_type == c))
            .filter(|conn| conn.transport.send_text(text.clone()))
            .count()
    }

    /// Sends a correlated `request` to a client and waits for its `response`.
    ///
    /// # Errors
    ///
    /// - [`RequestError::ConnectionClosed`] if the connection is unknown,
    ///   closed, or its queue is full;
    /// - [`RequestError::Remote`] if the client answered `success: false`;
    /// - [`RequestError::Timeout`] after `timeout`;
    /// - [`RequestError::Shutdown`] if the hub shuts down first.
    pub async fn send_request(
        &self,
        id: ConnectionId,
        endpoint: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        let transport = self
            .transport_of(id)
            .filter(Transport::is_open)
            .ok_or(RequestError::ConnectionClosed)?;

        let (guard, rx) = self.requests.register(id, endpoint, timeout)?;
        let frame = OutboundMessage::Request {
            request_id: guard.request_id().to_string(),
            endpoint: endpoint.to_string(),
            data,
        };
        if !transport.send(&frame) {
            return Err(RequestError::ConnectionClosed);
        }
        debug!("request {} sent to {id} ({endpoint})", guard.request_id());
        self.requests.wait(guard, rx, timeout).await
    }

    /// [`send_request`](Self::send_request) with `requests.default_timeout_ms`.
    pub async fn send_request_default(
        &self,
        id: ConnectionId,
        endpoint: &str,
        data: Value,
    ) -> Result<Value, RequestError> {
        let timeout = self.config.default_request_timeout();
        self.send_request(id, endpoint, data, timeout).await
    }

    /// Queues an event for the application.  Drops it if the channel is full.
    pub fn emit(&self, event: ServerEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("event channel full; dropping {}", event.name());
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!("no event consumer; dropping {}", event.name());
            }
        }
    }
}

impl HeartbeatTarget for Hub {
    fn heartbeat_tick(&self, id: ConnectionId, interval: Duration) -> TickOutcome {
        let state = self.state.lock();
        let Some(conn) = state.registry.get(&id) else {
            return TickOutcome::Gone;
        };
        if !conn.transport.is_open() {
            return TickOutcome::Gone;
        }
        match liveness(conn.last_heartbeat, Instant::now(), interval) {
            Liveness::Expired => TickOutcome::Expired,
            Liveness::Alive => {
                conn.transport.ping();
                TickOutcome::Probed
            }
        }
    }

    fn expire(&self, id: ConnectionId) {
        self.close(id, CloseReason::HeartbeatTimeout);
    }
}

// ── Built-in RPC methods ──────────────────────────────────────────────────────

/// `server.stats`: live counters from the hub.
struct StatsMethod {
    hub: Weak<Hub>,
}

#[async_trait::async_trait]
impl RpcHandler for StatsMethod {
    async fn call(&self, _params: Value, _session: SessionInfo) -> Result<Value, RpcError> {
        let hub = self
            .hub
            .upgrade()
            .ok_or_else(|| RpcError::Failed("server is shutting down".to_string()))?;
        serde_json::to_value(hub.stats()).map_err(|e| RpcError::Failed(e.to_string()))
    }
}

fn register_builtins(rpc: &RpcRegistry, hub: Weak<Hub>) {
    rpc.register_fn("echo", |params, _session| Ok(params));
    rpc.register_fn("server.time", |_params, _session| {
        Ok(json!({ "serverTime": unix_millis() }))
    });
    rpc.register("server.stats", Arc::new(StatsMethod { hub }));
}

// ── Tests ─────────────────────────────────────────────────────────────────────
