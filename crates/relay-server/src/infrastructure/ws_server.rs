//! WebSocket server: accept loop and per-connection tasks.
//!
//! Each accepted TCP stream is upgraded to a WebSocket and served by two
//! tasks:
//!
//! - **writer**: drains the connection's [`Transport`] queue into the socket
//!   and, when a close is requested, sends a Close frame with the requested
//!   code and reason;
//! - **reader**: feeds text and binary frames to the router and records
//!   Pong frames as heartbeats.
//!
//! Whichever finishes first ends the session, and the connection is then torn
//! down through [`Hub::disconnect`], which is idempotent.
//!
//! The accept loop polls `running` every 200 ms so that a Ctrl+C handler can
//! stop it without cancelling the task.  Once stopped, it shuts the hub down
//! and waits for the session tasks so every client receives its 1001 Close
//! frame before [`serve`] returns.
//!
//! Frames larger than twice `limits.max_payload_bytes` are refused by the
//! WebSocket layer itself and close the connection with 1009; smaller
//! oversized frames reach the router and get a `payload_too_large` reply.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_core::CloseReason;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::application::hub::Hub;
use crate::application::router::{route_binary, route_text};
use crate::application::transport::{
    Outbound, Transport, TransportReceiver, OUTBOUND_QUEUE_CAPACITY,
};

/// How often the accept loop re-checks the `running` flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// How long a refused connection's writer gets to deliver its Close frame.
const REFUSAL_FLUSH: Duration = Duration::from_secs(1);

/// How long [`serve`] waits for open sessions after shutting the hub down.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds the listener for `hub.config().listen_addr()` and serves until
/// `running` is cleared.
///
/// # Errors
///
/// Returns an error if the listen address is invalid or cannot be bound.
pub async fn run_server(hub: Arc<Hub>, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let addr = hub.config().listen_addr()?;
    let listener = bind_listener(addr).await?;
    serve(listener, hub, running).await
}

/// Binds a TCP listener.
///
/// # Errors
///
/// Returns an error if the port is in use or the process lacks permission.
pub async fn bind_listener(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {addr}"))
}

/// Runs the accept loop on an already-bound listener.
///
/// Each connection gets its own task.  When `running` is cleared the loop
/// stops accepting, calls [`Hub::shutdown`] and waits up to
/// [`SHUTDOWN_DRAIN`] for the session tasks to deliver their Close frames.
///
/// # Errors
///
/// Returns an error only if the listener's local address cannot be read.
pub async fn serve(
    listener: TcpListener,
    hub: Arc<Hub>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let local = listener
        .local_addr()
        .context("failed to read listener address")?;
    info!("relay server listening on ws://{local}");
    if hub.config().server.compression {
        info!("server.compression is set; permessage-deflate is not negotiated");
    }

    let mut sessions = JoinSet::new();
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        tokio::select! {
            accepted = timeout(ACCEPT_POLL, listener.accept()) => match accepted {
                Ok(Ok((stream, peer_addr))) => {
                    debug!("tcp connection from {peer_addr}");
                    sessions.spawn(handle_connection(stream, peer_addr, Arc::clone(&hub)));
                }
                Ok(Err(e)) => {
                    error!("accept error: {e}");
                }
                Err(_) => {}
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    drain_sessions(&hub, sessions).await;
    Ok(())
}

/// Closes every connection and waits for the session tasks to finish.
async fn drain_sessions(hub: &Hub, mut sessions: JoinSet<()>) {
    hub.shutdown();
    let open = sessions.len();
    let drained = timeout(SHUTDOWN_DRAIN, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    match drained {
        Ok(()) => debug!("{open} sessions drained"),
        Err(_) => warn!(
            "{} of {open} sessions still open after {SHUTDOWN_DRAIN:?}; aborting them",
            sessions.len()
        ),
    }
}

/// WebSocket limits derived from `limits.max_payload_bytes`.
fn websocket_config(max_payload_bytes: usize) -> WebSocketConfig {
    let ceiling = max_payload_bytes.saturating_mul(2);
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(ceiling);
    config.max_frame_size = Some(ceiling);
    config
}

// ── Per-connection handler ────────────────────────────────────────────────────

async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, hub: Arc<Hub>) {
    match run_session(stream, peer_addr, hub).await {
        Ok(()) => debug!("session {peer_addr} finished"),
        Err(e) => warn!("session {peer_addr} ended with error: {e:#}"),
    }
}

async fn run_session(stream: TcpStream, peer_addr: SocketAddr, hub: Arc<Hub>) -> anyhow::Result<()> {
    let mut user_agent = None;
    let capture_user_agent = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        user_agent = req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Ok(resp)
    };
    let config = websocket_config(hub.config().limits.max_payload_bytes);
    let ws_stream = accept_hdr_async_with_config(stream, capture_user_agent, Some(config))
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;

    let (sink, source) = ws_stream.split();
    let (transport, outbound) = Transport::channel(OUTBOUND_QUEUE_CAPACITY);
    let mut writer = tokio::spawn(write_loop(sink, outbound, peer_addr));

    let id = match hub.admit(transport, Some(peer_addr), user_agent) {
        Ok(id) => id,
        Err(e) => {
            // `admit` already requested the close; let the writer send it.
            let _ = timeout(REFUSAL_FLUSH, &mut writer).await;
            writer.abort();
            debug!("session {peer_addr} refused: {e}");
            return Ok(());
        }
    };

    let mut reader = tokio::spawn(read_loop(source, Arc::clone(&hub), id));

    let writer_done = tokio::select! {
        _ = &mut reader => {
            debug!("connection {id}: reader ended");
            false
        }
        _ = &mut writer => {
            debug!("connection {id}: writer ended");
            true
        }
    };

    hub.disconnect(id);
    if !writer_done {
        // The writer sends the Close frame `disconnect` just requested.
        let _ = timeout(REFUSAL_FLUSH, &mut writer).await;
    }
    writer.abort();
    reader.abort();
    Ok(())
}

/// Drains queued frames into the socket until a close is requested or the
/// socket fails.  Queued frames go out before the Close frame.
async fn write_loop(mut sink: WsSink, mut outbound: TransportReceiver, peer_addr: SocketAddr) {
    loop {
        tokio::select! {
            biased;
            frame = outbound.frames.recv() => {
                let msg = match frame {
                    Some(Outbound::Text(text)) => WsMessage::Text(text),
                    Some(Outbound::Ping) => WsMessage::Ping(Vec::new()),
                    None => break,
                };
                if let Err(e) = sink.send(msg).await {
                    debug!("session {peer_addr}: send failed: {e}");
                    return;
                }
            }
            changed = outbound.close.changed() => {
                if changed.is_err() {
                    break;
                }
                let reason = *outbound.close.borrow_and_update();
                if let Some(reason) = reason {
                    // Flush what was queued before the close was requested.
                    while let Ok(Outbound::Text(text)) = outbound.frames.try_recv() {
                        if sink.send(WsMessage::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    send_close(&mut sink, reason, peer_addr).await;
                    return;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn send_close(sink: &mut WsSink, reason: CloseReason, peer_addr: SocketAddr) {
    debug!("session {peer_addr}: closing with {reason}");
    let frame = CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: reason.reason().into(),
    };
    if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
        debug!("session {peer_addr}: close frame not delivered: {e}");
    }
    let _ = sink.flush().await;
}

/// Feeds inbound frames to the router until the peer closes or errors.
async fn read_loop(mut source: WsSource, hub: Arc<Hub>, id: relay_core::ConnectionId) {
    while let Some(frame) = source.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(WsError::ConnectionClosed | WsError::Protocol(_)) => {
                debug!("connection {id}: socket closed");
                break;
            }
            Err(WsError::Capacity(e)) => {
                warn!("connection {id}: {e}");
                hub.close(id, CloseReason::MessageTooBig);
                break;
            }
            Err(e) => {
                warn!("connection {id}: WebSocket error: {e}");
                break;
            }
        };

        match msg {
            WsMessage::Text(text) => route_text(&hub, id, &text),
            WsMessage::Binary(bytes) => route_binary(&hub, id, &bytes),
            WsMessage::Ping(_) => {
                // tungstenite queues the Pong reply itself.
            }
            WsMessage::Pong(_) => hub.record_heartbeat(id),
            WsMessage::Close(frame) => {
                debug!("connection {id}: close frame received: {frame:?}");
                break;
            }
            WsMessage::Frame(_) => {}
        }
    }
}
