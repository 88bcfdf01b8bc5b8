//! Message router: decode, gate, dispatch.
//!
//! Every inbound frame passes through the same pipeline:
//!
//! 1. size ceiling (`payload_too_large`);
//! 2. decode (`invalid_format`, or `unknown_type` naming the type);
//! 3. received-count and last-activity update;
//! 4. auth gate (`authentication_required`), then feature gate
//!    (`feature_disabled`);
//! 5. exhaustive dispatch on [`InboundMessage`].
//!
//! Rejections are `error` frames; the connection stays open.  Handlers that
//! await (RPC calls, storage writes) run on their own tasks so the reader
//! keeps processing frames in arrival order.

use std::sync::Arc;

use relay_core::protocol::messages::{
    DataMessage, HandshakeMessage, RequestMessage, ResponseMessage, RpcCallMessage,
    StreamDataMessage, StreamStartMessage,
};
use relay_core::{
    decode_frame, unix_millis, CloseReason, ConnectionId, ErrorCode, InboundMessage, MessageKind,
    OutboundMessage, ProtocolError, UNKNOWN_CLIENT_TYPE,
};
use tracing::{debug, info, warn};

use crate::application::auth::AUTH_FAILURE_GRACE;
use crate::application::coordinator::{RequestError, Responder};
use crate::application::events::{ServerEvent, StreamEndCause};
use crate::application::hub::{Hub, SERVER_VERSION};
use crate::application::ingestion::{self, DEFAULT_DATA_TYPE};
use crate::application::streams::StreamInfo;
use crate::domain::config::FeaturesConfig;

/// Error text for frames that fail to decode.
pub const INVALID_FORMAT_ERROR: &str = "invalid message format";

/// Fallback error text for a failed `response` that carries none.
const REMOTE_FAILURE_ERROR: &str = "request failed";

/// Routes one text frame from `id`.
pub fn route_text(hub: &Arc<Hub>, id: ConnectionId, text: &str) {
    let limit = hub.config().limits.max_payload_bytes;
    if text.len() > limit {
        warn!("connection {id}: {} byte frame exceeds {limit}", text.len());
        hub.send_to(
            id,
            &OutboundMessage::error(
                ErrorCode::PayloadTooLarge,
                format!("payload of {} bytes exceeds limit of {limit} bytes", text.len()),
            ),
        );
        return;
    }

    let msg = match decode_frame(text) {
        Ok(msg) => msg,
        Err(ProtocolError::UnknownMessageType(type_name)) => {
            debug!("connection {id}: unknown message type {type_name}");
            hub.send_to(
                id,
                &OutboundMessage::error_for(
                    ErrorCode::UnknownType,
                    format!("unknown message type: {type_name}"),
                    None,
                    Some(&type_name),
                ),
            );
            return;
        }
        Err(e) => {
            debug!("connection {id}: {e}");
            hub.send_to(
                id,
                &OutboundMessage::error(ErrorCode::InvalidFormat, INVALID_FORMAT_ERROR),
            );
            return;
        }
    };

    route_message(hub, id, msg);
}

/// Routes one binary frame.  Accepted only with `features.binary`, and then
/// treated as UTF-8 JSON text.
pub fn route_binary(hub: &Arc<Hub>, id: ConnectionId, bytes: &[u8]) {
    if !hub.config().features.binary {
        hub.send_to(
            id,
            &OutboundMessage::error(ErrorCode::FeatureDisabled, "binary frames are disabled"),
        );
        return;
    }
    let limit = hub.config().limits.max_payload_bytes;
    if bytes.len() > limit {
        hub.send_to(
            id,
            &OutboundMessage::error(
                ErrorCode::PayloadTooLarge,
                format!("payload of {} bytes exceeds limit of {limit} bytes", bytes.len()),
            ),
        );
        return;
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => route_text(hub, id, text),
        Err(_) => {
            hub.send_to(
                id,
                &OutboundMessage::error(ErrorCode::InvalidFormat, INVALID_FORMAT_ERROR),
            );
        }
    }
}

/// Gates and dispatches an already-decoded message.
pub fn route_message(hub: &Arc<Hub>, id: ConnectionId, msg: InboundMessage) {
    let kind = msg.kind();

    let authenticated = {
        let mut state = hub.state();
        let Some(conn) = state.registry.get_mut(&id) else {
            debug!("connection {id}: frame after teardown dropped");
            return;
        };
        conn.record_inbound();
        conn.session.authenticated
    };

    if hub.auth().required() && kind.requires_auth() && !authenticated {
        debug!("connection {id}: {kind} refused before auth");
        hub.send_to(
            id,
            &OutboundMessage::error_for(
                ErrorCode::AuthenticationRequired,
                "authentication required",
                msg.request_id(),
                Some(kind.as_str()),
            ),
        );
        return;
    }

    if !feature_enabled(&hub.config().features, kind) {
        hub.send_to(
            id,
            &OutboundMessage::error_for(
                ErrorCode::FeatureDisabled,
                format!("{kind} is disabled on this server"),
                msg.request_id(),
                Some(kind.as_str()),
            ),
        );
        return;
    }

    debug!("connection {id}: {kind}");
    match msg {
        InboundMessage::Handshake(m) => handle_handshake(hub, id, m),
        InboundMessage::Auth(m) => handle_auth(hub, id, &m.token),
        InboundMessage::Data(m) => handle_data(hub, id, m),
        InboundMessage::Request(m) => handle_request(hub, id, m),
        InboundMessage::Response(m) => handle_response(hub, id, m),
        InboundMessage::Subscribe(m) => handle_subscribe(hub, id, m.topic),
        InboundMessage::Unsubscribe(m) => handle_unsubscribe(hub, id, m.topic),
        InboundMessage::Publish(m) => {
            let publish_count = hub.publish(&m.topic, m.data, Some(id));
            hub.send_to(
                id,
                &OutboundMessage::PublishResponse {
                    topic: m.topic,
                    success: true,
                    publish_count,
                },
            );
        }
        InboundMessage::RpcCall(m) => handle_rpc_call(hub, id, m),
        InboundMessage::StreamStart(m) => handle_stream_start(hub, id, m),
        InboundMessage::StreamData(m) => handle_stream_data(hub, id, m),
        InboundMessage::StreamEnd(m) => handle_stream_end(hub, id, m.stream_id),
        InboundMessage::Heartbeat => {
            hub.record_heartbeat(id);
            hub.send_to(
                id,
                &OutboundMessage::HeartbeatResponse {
                    server_time: unix_millis(),
                },
            );
        }
        InboundMessage::Ping => {
            hub.record_heartbeat(id);
            hub.send_to(id, &OutboundMessage::Pong);
        }
    }
}

/// Whether the interaction pattern behind `kind` is switched on.
pub fn feature_enabled(features: &FeaturesConfig, kind: MessageKind) -> bool {
    match kind {
        MessageKind::Request | MessageKind::Response => features.request_response,
        MessageKind::Subscribe | MessageKind::Unsubscribe | MessageKind::Publish => {
            features.pubsub
        }
        MessageKind::RpcCall => features.rpc,
        MessageKind::StreamStart | MessageKind::StreamData | MessageKind::StreamEnd => {
            features.streaming
        }
        MessageKind::Handshake
        | MessageKind::Auth
        | MessageKind::Data
        | MessageKind::Heartbeat
        | MessageKind::Ping => true,
    }
}

// ── Lifecycle handlers ────────────────────────────────────────────────────────

fn handle_handshake(hub: &Arc<Hub>, id: ConnectionId, m: HandshakeMessage) {
    let claimed = m.client_type;
    let accepted = claimed == UNKNOWN_CLIENT_TYPE || hub.config().is_allowed_client_type(&claimed);

    let snapshot = {
        let mut state = hub.state();
        let Some(conn) = state.registry.get_mut(&id) else {
            return;
        };
        if accepted {
            conn.session.client_type = claimed.clone();
        }
        conn.session.capabilities = m.capabilities;
        conn.session.version = m.version;
        (conn.session.client_type.clone(), conn.session.authenticated)
    };
    let (client_type, authenticated) = snapshot;

    if accepted {
        info!("connection {id}: handshake as {client_type}");
    } else {
        warn!("connection {id}: handshake with disallowed client type {claimed}");
    }

    hub.send_to(
        id,
        &OutboundMessage::HandshakeResponse {
            success: accepted,
            connection_id: id,
            client_type,
            server_version: SERVER_VERSION.to_string(),
            auth_required: hub.auth().required(),
            authenticated,
            features: hub.config().feature_set(),
            error: (!accepted).then(|| format!("client type not allowed: {claimed}")),
        },
    );
}

fn handle_auth(hub: &Arc<Hub>, id: ConnectionId, token: &str) {
    if hub.auth().verify(token) {
        match hub.state().registry.get_mut(&id) {
            Some(conn) => conn.session.authenticated = true,
            None => return,
        }
        hub.send_to(
            id,
            &OutboundMessage::AuthResponse {
                success: true,
                authenticated: true,
                error: None,
            },
        );
        if hub.auth().required() {
            info!("connection {id}: authenticated");
            hub.emit(ServerEvent::ClientAuthenticated { connection_id: id });
        }
        return;
    }

    warn!("connection {id}: authentication failed; closing in {AUTH_FAILURE_GRACE:?}");
    hub.send_to(
        id,
        &OutboundMessage::AuthResponse {
            success: false,
            authenticated: false,
            error: Some("invalid token".to_string()),
        },
    );
    let weak = Arc::downgrade(hub);
    tokio::spawn(async move {
        tokio::time::sleep(AUTH_FAILURE_GRACE).await;
        if let Some(hub) = weak.upgrade() {
            hub.close(id, CloseReason::AuthenticationFailed);
        }
    });
}

// ── Data ingestion ────────────────────────────────────────────────────────────

fn handle_data(hub: &Arc<Hub>, id: ConnectionId, m: DataMessage) {
    let data_type = m
        .data_type
        .unwrap_or_else(|| DEFAULT_DATA_TYPE.to_string());
    let request_id = m.request_id;

    let payload = match ingestion::validate(&hub.config().ingestion, &data_type, m.data.as_ref()) {
        Ok(payload) => payload.clone(),
        Err(e) => {
            debug!("connection {id}: {data_type} rejected: {e}");
            hub.send_to(
                id,
                &OutboundMessage::DataResponse {
                    request_id,
                    success: false,
                    data_type,
                    insert_id: None,
                    error: Some(e.to_string()),
                },
            );
            return;
        }
    };

    hub.emit(ServerEvent::DataReceived {
        connection_id: id,
        data_type: data_type.clone(),
        data: payload.clone(),
    });

    let Some(storage) = hub.storage().cloned() else {
        hub.send_to(
            id,
            &OutboundMessage::DataResponse {
                request_id,
                success: true,
                data_type,
                insert_id: None,
                error: None,
            },
        );
        return;
    };

    let hub = Arc::clone(hub);
    tokio::spawn(async move {
        let record = ingestion::build_record(&payload, id, &data_type, unix_millis());
        let response = match storage.persist(&data_type, record).await {
            Ok(receipt) => {
                hub.emit(ServerEvent::DatabaseInsert {
                    connection_id: id,
                    table: data_type.clone(),
                    insert_id: receipt.insert_id.clone(),
                });
                OutboundMessage::DataResponse {
                    request_id,
                    success: true,
                    data_type,
                    insert_id: Some(receipt.insert_id),
                    error: None,
                }
            }
            Err(e) => {
                warn!("connection {id}: storing {data_type} failed: {e}");
                hub.emit(ServerEvent::DatabaseError {
                    connection_id: id,
                    table: data_type.clone(),
                    error: e.to_string(),
                });
                OutboundMessage::DataResponse {
                    request_id,
                    success: false,
                    data_type,
                    insert_id: None,
                    error: Some(e.to_string()),
                }
            }
        };
        hub.send_to(id, &response);
    });
}

// ── Request / response ────────────────────────────────────────────────────────

fn handle_request(hub: &Arc<Hub>, id: ConnectionId, m: RequestMessage) {
    if hub.transport_of(id).is_none() {
        return;
    }
    hub.emit(ServerEvent::RequestReceived {
        connection_id: id,
        endpoint: m.endpoint,
        data: m.data,
        responder: Responder::new(id, m.request_id, Arc::downgrade(hub)),
    });
}

fn handle_response(hub: &Arc<Hub>, id: ConnectionId, m: ResponseMessage) {
    let result = if m.success {
        Ok(m.data)
    } else {
        Err(RequestError::Remote(
            m.error.unwrap_or_else(|| REMOTE_FAILURE_ERROR.to_string()),
        ))
    };
    hub.requests().resolve(id, &m.request_id.to_string(), result);
}

// ── Pub/sub ───────────────────────────────────────────────────────────────────

fn handle_subscribe(hub: &Arc<Hub>, id: ConnectionId, topic: String) {
    {
        let mut state = hub.state();
        if state.registry.get(&id).is_none() {
            return;
        }
        state.broker.subscribe(id, &topic);
    }
    debug!("connection {id}: subscribed to {topic}");
    hub.send_to(
        id,
        &OutboundMessage::SubscribeResponse {
            topic,
            success: true,
        },
    );
}

fn handle_unsubscribe(hub: &Arc<Hub>, id: ConnectionId, topic: String) {
    hub.state().broker.unsubscribe(id, &topic);
    hub.send_to(
        id,
        &OutboundMessage::UnsubscribeResponse {
            topic,
            success: true,
        },
    );
}

// ── RPC ───────────────────────────────────────────────────────────────────────

fn handle_rpc_call(hub: &Arc<Hub>, id: ConnectionId, m: RpcCallMessage) {
    let Some(session) = hub.session(id) else {
        return;
    };
    let hub = Arc::clone(hub);
    tokio::spawn(async move {
        let response = match hub.rpc().invoke(&m.method, m.params, session).await {
            Ok(result) => OutboundMessage::RpcResponse {
                request_id: m.request_id,
                success: true,
                result: Some(result),
                error: None,
            },
            Err(e) => {
                debug!("connection {id}: rpc {} failed: {e}", m.method);
                OutboundMessage::RpcResponse {
                    request_id: m.request_id,
                    success: false,
                    result: None,
                    error: Some(e.to_string()),
                }
            }
        };
        hub.send_to(id, &response);
    });
}

// ── Streams ───────────────────────────────────────────────────────────────────

fn handle_stream_start(hub: &Arc<Hub>, id: ConnectionId, m: StreamStartMessage) {
    let replaced = {
        let mut state = hub.state();
        if state.registry.get(&id).is_none() {
            return;
        }
        state.streams.start(StreamInfo {
            stream_id: m.stream_id.clone(),
            owner: id,
            stream_type: m.stream_type.clone(),
            started_at_ms: unix_millis(),
        })
    };
    if let Some(previous) = replaced {
        warn!(
            "stream {} restarted by {id}; replacing entry owned by {}",
            m.stream_id, previous.owner
        );
    }

    hub.send_to(
        id,
        &OutboundMessage::StreamStartResponse {
            stream_id: m.stream_id.clone(),
            stream_type: m.stream_type.clone(),
            success: true,
        },
    );
    hub.emit(ServerEvent::StreamStarted {
        connection_id: id,
        stream_id: m.stream_id,
        stream_type: m.stream_type,
    });
}

fn handle_stream_data(hub: &Arc<Hub>, id: ConnectionId, m: StreamDataMessage) {
    hub.emit(ServerEvent::StreamData {
        connection_id: id,
        stream_id: m.stream_id,
        data: m.data,
        sequence_number: m.sequence_number,
    });
}

fn handle_stream_end(hub: &Arc<Hub>, id: ConnectionId, stream_id: String) {
    let ended = hub.state().streams.end(&stream_id);
    hub.send_to(
        id,
        &OutboundMessage::StreamEndResponse {
            stream_id: stream_id.clone(),
            success: true,
        },
    );
    if let Some(info) = ended {
        hub.emit(ServerEvent::StreamEnded {
            connection_id: info.owner,
            stream_id,
            cause: StreamEndCause::Client,
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ingestion::{InsertReceipt, MockDataStore, StorageBinding, StorageError};
    use crate::application::transport::{Outbound, Transport, TransportReceiver};
    use crate::domain::config::{KindRules, ServerConfig};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    // ── Harness ───────────────────────────────────────────────────────────────

    struct Harness {
        hub: Arc<Hub>,
        events: mpsc::Receiver<ServerEvent>,
    }

    struct Client {
        id: ConnectionId,
        rx: TransportReceiver,
    }

    impl Harness {
        fn new(config: ServerConfig) -> Self {
            Self::with_storage(config, None)
        }

        fn with_storage(mut config: ServerConfig, storage: Option<StorageBinding>) -> Self {
            config.heartbeat.enabled = false;
            let (hub, events) = Hub::new(config, storage);
            Self { hub, events }
        }

        fn connect(&self) -> Client {
            let (transport, mut rx) = Transport::channel(64);
            let id = self.hub.admit(transport, None, None).expect("admit");
            // Discard the welcome frame.
            let _ = rx.frames.try_recv();
            Client { id, rx }
        }

        fn send(&self, client: &Client, text: &str) {
            route_text(&self.hub, client.id, text);
        }

        /// Pending events, minus the `client-connected` ones from `connect`.
        fn events(&mut self) -> Vec<ServerEvent> {
            std::iter::from_fn(|| self.events.try_recv().ok())
                .filter(|e| !matches!(e, ServerEvent::ClientConnected { .. }))
                .collect()
        }
    }

    impl Client {
        fn frames(&mut self) -> Vec<Value> {
            std::iter::from_fn(|| self.rx.frames.try_recv().ok())
                .filter_map(|f| match f {
                    Outbound::Text(t) => serde_json::from_str(&t).ok(),
                    Outbound::Ping => None,
                })
                .collect()
        }

        fn single(&mut self) -> Value {
            let mut frames = self.frames();
            assert_eq!(frames.len(), 1, "expected one frame, got {frames:?}");
            frames.remove(0)
        }
    }

    fn auth_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.auth.required = true;
        config.auth.token = Some("s3cret".to_string());
        config
    }

    /// Lets spawned handler tasks run to completion.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    // ── Decode errors ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_malformed_frame_gets_invalid_format() {
        // Arrange
        let h = Harness::new(ServerConfig::default());
        let mut c = h.connect();

        // Act
        h.send(&c, "{not json");

        // Assert
        let frame = c.single();
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["code"], "invalid_format");
        assert_eq!(frame["error"], INVALID_FORMAT_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_type_names_the_type() {
        let h = Harness::new(ServerConfig::default());
        let mut c = h.connect();

        h.send(&c, r#"{"type":"teleport"}"#);

        let frame = c.single();
        assert_eq!(frame["code"], "unknown_type");
        assert_eq!(frame["error"], "unknown message type: teleport");
        assert_eq!(frame["messageType"], "teleport");
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let mut config = ServerConfig::default();
        config.limits.max_payload_bytes = 16;
        let h = Harness::new(config);
        let mut c = h.connect();

        h.send(&c, r#"{"type":"publish","topic":"t","data":"0123456789"}"#);

        assert_eq!(c.single()["code"], "payload_too_large");
    }

    #[tokio::test]
    async fn test_counters_updated_for_routed_frames_only() {
        let h = Harness::new(ServerConfig::default());
        let mut c = h.connect();

        h.send(&c, "garbage");
        h.send(&c, r#"{"type":"ping"}"#);
        h.send(&c, r#"{"type":"ping"}"#);
        c.frames();

        assert_eq!(h.hub.session(c.id).unwrap().messages_received, 2);
    }

    // ── Auth gate ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_gated_kind_before_auth_is_refused_with_request_id() {
        // Arrange
        let h = Harness::new(auth_config());
        let mut c = h.connect();

        // Act
        h.send(&c, r#"{"type":"rpc_call","requestId":"r1","method":"echo"}"#);

        // Assert
        let frame = c.single();
        assert_eq!(frame["code"], "authentication_required");
        assert_eq!(frame["requestId"], "r1");
        assert_eq!(frame["messageType"], "rpc_call");
    }

    #[tokio::test]
    async fn test_refusal_echoes_numeric_request_id_as_number() {
        let h = Harness::new(auth_config());
        let mut c = h.connect();

        h.send(&c, r#"{"type":"data","requestId":12,"data":{}}"#);

        let frame = c.single();
        assert_eq!(frame["code"], "authentication_required");
        assert_eq!(frame["requestId"], json!(12));
    }

    #[tokio::test]
    async fn test_exempt_kinds_work_before_auth() {
        let h = Harness::new(auth_config());
        let mut c = h.connect();

        h.send(&c, r#"{"type":"ping"}"#);
        h.send(&c, r#"{"type":"heartbeat"}"#);
        h.send(&c, r#"{"type":"handshake","clientType":"device"}"#);

        let types: Vec<Value> = c.frames().into_iter().map(|f| f["type"].clone()).collect();
        assert_eq!(types, vec!["pong", "heartbeat_response", "handshake_response"]);
    }

    #[tokio::test]
    async fn test_successful_auth_unlocks_gated_kinds() {
        // Arrange
        let mut h = Harness::new(auth_config());
        let mut c = h.connect();

        // Act
        h.send(&c, r#"{"type":"auth","token":"s3cret"}"#);
        h.send(&c, r#"{"type":"subscribe","topic":"t"}"#);

        // Assert
        let frames = c.frames();
        assert_eq!(frames[0]["type"], "auth_response");
        assert_eq!(frames[0]["success"], true);
        assert_eq!(frames[1]["type"], "subscribe_response");
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, ServerEvent::ClientAuthenticated { connection_id } if *connection_id == c.id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_token_closes_after_grace_period() {
        // Arrange
        let h = Harness::new(auth_config());
        let mut c = h.connect();

        // Act
        h.send(&c, r#"{"type":"auth","token":"wrong"}"#);
        let reply = c.single();
        tokio::time::sleep(Duration::from_millis(900)).await;
        let open_before_grace = c.rx.close.borrow().is_none();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Assert
        assert_eq!(reply["success"], false);
        assert!(open_before_grace);
        assert_eq!(
            *c.rx.close.borrow(),
            Some(CloseReason::AuthenticationFailed)
        );
        assert_eq!(h.hub.connection_count(), 0);
    }

    // ── Feature gate ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_disabled_pattern_is_refused() {
        let mut config = ServerConfig::default();
        config.features.pubsub = false;
        let h = Harness::new(config);
        let mut c = h.connect();

        h.send(&c, r#"{"type":"subscribe","topic":"t"}"#);

        let frame = c.single();
        assert_eq!(frame["code"], "feature_disabled");
        assert_eq!(h.hub.stats().subscriptions, 0);
    }

    #[tokio::test]
    async fn test_binary_frames_refused_unless_enabled() {
        let h = Harness::new(ServerConfig::default());
        let mut c = h.connect();
        route_binary(&h.hub, c.id, br#"{"type":"ping"}"#);
        assert_eq!(c.single()["code"], "feature_disabled");

        let mut config = ServerConfig::default();
        config.features.binary = true;
        let h = Harness::new(config);
        let mut c = h.connect();
        route_binary(&h.hub, c.id, br#"{"type":"ping"}"#);
        assert_eq!(c.single()["type"], "pong");
    }

    #[test]
    fn test_feature_map_leaves_lifecycle_and_data_always_on() {
        let features = FeaturesConfig {
            request_response: false,
            pubsub: false,
            rpc: false,
            streaming: false,
            binary: false,
        };
        for kind in MessageKind::ALL {
            let expected = matches!(
                kind,
                MessageKind::Handshake
                    | MessageKind::Auth
                    | MessageKind::Data
                    | MessageKind::Heartbeat
                    | MessageKind::Ping
            );
            assert_eq!(feature_enabled(&features, kind), expected, "{kind}");
        }
    }

    // ── Handshake ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_handshake_records_allowed_client_type() {
        let h = Harness::new(ServerConfig::default());
        let mut c = h.connect();

        h.send(
            &c,
            r#"{"type":"handshake","clientType":"device","capabilities":["stream"],"version":"3"}"#,
        );

        let frame = c.single();
        assert_eq!(frame["success"], true);
        assert_eq!(frame["clientType"], "device");
        assert_eq!(frame["connectionId"], c.id.to_string());
        let session = h.hub.session(c.id).unwrap();
        assert_eq!(session.client_type, "device");
        assert_eq!(session.capabilities, vec!["stream"]);
        assert_eq!(session.version.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_handshake_with_disallowed_type_stays_unknown() {
        let h = Harness::new(ServerConfig::default());
        let mut c = h.connect();

        h.send(&c, r#"{"type":"handshake","clientType":"toaster"}"#);

        let frame = c.single();
        assert_eq!(frame["success"], false);
        assert_eq!(frame["clientType"], UNKNOWN_CLIENT_TYPE);
        assert_eq!(frame["error"], "client type not allowed: toaster");
    }

    // ── Pub/sub ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_publish_fans_out_and_acknowledges_count() {
        // Arrange
        let h = Harness::new(ServerConfig::default());
        let mut a = h.connect();
        let mut b = h.connect();
        let mut publisher = h.connect();
        h.send(&a, r#"{"type":"subscribe","topic":"sensor_data"}"#);
        h.send(&b, r#"{"type":"subscribe","topic":"sensor_data"}"#);
        h.send(&publisher, r#"{"type":"subscribe","topic":"sensor_data"}"#);
        a.frames();
        b.frames();
        publisher.frames();

        // Act
        h.send(
            &publisher,
            r#"{"type":"publish","topic":"sensor_data","data":{"t":21}}"#,
        );

        // Assert
        let ack = publisher.single();
        assert_eq!(ack["type"], "publish_response");
        assert_eq!(ack["publishCount"], 2);
        for client in [&mut a, &mut b] {
            let frame = client.single();
            assert_eq!(frame["type"], "publish");
            assert_eq!(frame["topic"], "sensor_data");
            assert_eq!(frame["data"], json!({"t": 21}));
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_never_subscribed_is_acknowledged() {
        let h = Harness::new(ServerConfig::default());
        let mut c = h.connect();

        h.send(&c, r#"{"type":"unsubscribe","topic":"nothing"}"#);

        let frame = c.single();
        assert_eq!(frame["type"], "unsubscribe_response");
        assert_eq!(frame["success"], true);
    }

    // ── RPC ───────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_rpc_unknown_method() {
        let h = Harness::new(ServerConfig::default());
        let mut c = h.connect();

        h.send(&c, r#"{"type":"rpc_call","requestId":5,"method":"nope"}"#);
        settle().await;

        let frame = c.single();
        assert_eq!(frame["type"], "rpc_response");
        assert_eq!(frame["requestId"], json!(5));
        assert_eq!(frame["success"], false);
        assert_eq!(frame["error"], "method not found: nope");
    }

    #[tokio::test]
    async fn test_rpc_echo() {
        let h = Harness::new(ServerConfig::default());
        let mut c = h.connect();

        h.send(
            &c,
            r#"{"type":"rpc_call","requestId":"e","method":"echo","params":{"a":[1,2]}}"#,
        );
        settle().await;

        let frame = c.single();
        assert_eq!(frame["success"], true);
        assert_eq!(frame["result"], json!({"a": [1, 2]}));
    }

    #[tokio::test]
    async fn test_rpc_panic_becomes_error_response() {
        let h = Harness::new(ServerConfig::default());
        h.hub.rpc().register_fn("explode", |_, _| panic!("handler exploded"));
        let mut c = h.connect();

        h.send(&c, r#"{"type":"rpc_call","requestId":"p","method":"explode"}"#);
        settle().await;

        let frame = c.single();
        assert_eq!(frame["success"], false);
        assert_eq!(frame["error"], "handler exploded");
        assert_eq!(h.hub.connection_count(), 1);
    }

    // ── Request / response ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_client_request_reaches_application_and_is_answered() {
        // Arrange
        let mut h = Harness::new(ServerConfig::default());
        let mut c = h.connect();

        // Act
        h.send(
            &c,
            r#"{"type":"request","requestId":"q1","endpoint":"/devices","data":{"page":1}}"#,
        );
        let mut events = h.events();
        let ServerEvent::RequestReceived {
            endpoint,
            data,
            responder,
            ..
        } = events.remove(0)
        else {
            panic!("expected request-received");
        };
        responder.ok(json!(["d1"]));

        // Assert
        assert_eq!(endpoint, "/devices");
        assert_eq!(data, json!({"page": 1}));
        let frame = c.single();
        assert_eq!(frame["type"], "response");
        assert_eq!(frame["requestId"], "q1");
        assert_eq!(frame["data"], json!(["d1"]));
    }

    #[tokio::test]
    async fn test_client_response_resolves_server_request() {
        // Arrange
        let h = Harness::new(ServerConfig::default());
        let mut c = h.connect();
        let hub = Arc::clone(&h.hub);
        let id = c.id;
        let pending = tokio::spawn(async move {
            hub.send_request(id, "/status", json!({}), Duration::from_secs(5))
                .await
        });
        settle().await;
        let request = c.single();
        let request_id = request["requestId"].as_str().unwrap().to_string();

        // Act
        h.send(
            &c,
            &format!(r#"{{"type":"response","requestId":"{request_id}","success":false,"error":"busy"}}"#),
        );

        // Assert
        assert_eq!(
            pending.await.unwrap(),
            Err(RequestError::Remote("busy".into()))
        );
    }

    // ── Ingestion ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_data_failing_validation_gets_failure_response() {
        // Arrange
        let mut config = ServerConfig::default();
        config.ingestion.kinds.insert(
            "temperature".into(),
            KindRules {
                required: vec!["value".into()],
                numeric: vec![],
            },
        );
        let mut h = Harness::new(config);
        let mut c = h.connect();

        // Act
        h.send(
            &c,
            r#"{"type":"data","dataType":"temperature","requestId":"d1","data":{"deviceId":"x"}}"#,
        );

        // Assert
        let frame = c.single();
        assert_eq!(frame["type"], "data_response");
        assert_eq!(frame["success"], false);
        assert_eq!(frame["requestId"], "d1");
        assert_eq!(frame["error"], "missing required field: value");
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn test_scalar_data_cannot_bypass_required_fields() {
        // Arrange
        let mut config = ServerConfig::default();
        config.ingestion.required_fields = vec!["deviceId".into()];
        let mut h = Harness::new(config);
        let mut c = h.connect();

        // Act
        h.send(&c, r#"{"type":"data","requestId":"d2","data":42}"#);

        // Assert
        let frame = c.single();
        assert_eq!(frame["type"], "data_response");
        assert_eq!(frame["success"], false);
        assert_eq!(frame["requestId"], "d2");
        assert_eq!(frame["error"], "missing required field: deviceId");
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_sensor_data_is_ingested_as_sensor() {
        let mut h = Harness::new(ServerConfig::default());
        let mut c = h.connect();

        h.send(&c, r#"{"type":"sensor_data","payload":{"t":1}}"#);

        let frame = c.single();
        assert_eq!(frame["success"], true);
        assert_eq!(frame["dataType"], "sensor");
        let events = h.events();
        assert!(matches!(
            &events[0],
            ServerEvent::DataReceived { data_type, .. } if data_type == "sensor"
        ));
    }

    #[tokio::test]
    async fn test_data_is_stored_when_storage_configured() {
        // Arrange
        let mut store = MockDataStore::new();
        store
            .expect_post_data()
            .withf(|table, record| table == "generic" && record["value"] == 1)
            .times(1)
            .returning(|_, _| Ok(InsertReceipt { insert_id: json!(42) }));
        let mut h = Harness::with_storage(
            ServerConfig::default(),
            Some(StorageBinding::new(Arc::new(store))),
        );
        let mut c = h.connect();

        // Act
        h.send(&c, r#"{"type":"data","data":{"value":1}}"#);
        settle().await;

        // Assert
        let frame = c.single();
        assert_eq!(frame["success"], true);
        assert_eq!(frame["insertId"], 42);
        let names: Vec<&str> = h.events().iter().map(ServerEvent::name).collect();
        assert_eq!(names, vec!["data-received", "database-insert"]);
    }

    #[tokio::test]
    async fn test_storage_failure_is_reported() {
        let mut store = MockDataStore::new();
        store
            .expect_post_data()
            .returning(|_, _| Err(StorageError::Backend("offline".into())));
        let mut h = Harness::with_storage(
            ServerConfig::default(),
            Some(StorageBinding::new(Arc::new(store))),
        );
        let mut c = h.connect();

        h.send(&c, r#"{"type":"data","data":{"value":1}}"#);
        settle().await;

        let frame = c.single();
        assert_eq!(frame["success"], false);
        assert_eq!(frame["error"], "storage backend failed: offline");
        let names: Vec<&str> = h.events().iter().map(ServerEvent::name).collect();
        assert_eq!(names, vec!["data-received", "database-error"]);
    }

    // ── Streams ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_stream_lifecycle_events() {
        // Arrange
        let mut h = Harness::new(ServerConfig::default());
        let mut c = h.connect();

        // Act
        h.send(&c, r#"{"type":"stream_start","streamId":"cam","streamType":"video"}"#);
        for seq in 0..3 {
            h.send(
                &c,
                &format!(r#"{{"type":"stream_data","streamId":"cam","sequenceNumber":{seq},"data":[{seq}]}}"#),
            );
        }
        h.send(&c, r#"{"type":"stream_end","streamId":"cam"}"#);
        h.send(&c, r#"{"type":"stream_data","streamId":"ghost","data":1}"#);

        // Assert
        let acks: Vec<Value> = c.frames().into_iter().map(|f| f["type"].clone()).collect();
        assert_eq!(acks, vec!["stream_start_response", "stream_end_response"]);
        let names: Vec<&str> = h.events().iter().map(ServerEvent::name).collect();
        assert_eq!(
            names,
            vec![
                "stream-started",
                "stream-data",
                "stream-data",
                "stream-data",
                "stream-ended",
                "stream-data"
            ]
        );
        assert_eq!(h.hub.stats().streams, 0);
    }

    #[tokio::test]
    async fn test_stream_end_unknown_is_acknowledged_without_event() {
        let mut h = Harness::new(ServerConfig::default());
        let mut c = h.connect();

        h.send(&c, r#"{"type":"stream_end","streamId":"never"}"#);

        assert_eq!(c.single()["type"], "stream_end_response");
        assert!(h.events().is_empty());
    }
}
