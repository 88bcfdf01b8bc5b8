//! Shared harness for the end-to-end tests: a real server on an ephemeral
//! port and thin JSON helpers over a tokio-tungstenite client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_core::ConnectionId;
use relay_server::application::{Hub, ServerEvent, StorageBinding};
use relay_server::domain::ServerConfig;
use relay_server::infrastructure::{bind_listener, serve};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound for any single wait in these tests.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub hub: Arc<Hub>,
    pub events: mpsc::Receiver<ServerEvent>,
    pub addr: SocketAddr,
    running: Arc<AtomicBool>,
}

impl TestServer {
    pub async fn start(config: ServerConfig) -> Self {
        Self::start_with_storage(config, None).await
    }

    pub async fn start_with_storage(config: ServerConfig, storage: Option<StorageBinding>) -> Self {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind");
        let addr = listener.local_addr().unwrap();
        let (hub, events) = Hub::new(config, storage);
        let running = Arc::new(AtomicBool::new(true));
        tokio::spawn(serve(listener, Arc::clone(&hub), Arc::clone(&running)));
        Self {
            hub,
            events,
            addr,
            running,
        }
    }

    /// Connects a client and consumes its `welcome` frame.
    pub async fn connect(&self) -> (Ws, ConnectionId) {
        let mut ws = self.connect_raw().await;
        let welcome = recv_json(&mut ws).await;
        assert_eq!(welcome["type"], "welcome", "first frame was {welcome}");
        let id = welcome["connectionId"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .expect("connectionId");
        (ws, id)
    }

    /// Connects without reading anything.
    pub async fn connect_raw(&self) -> Ws {
        let (ws, _response) = connect_async(format!("ws://{}", self.addr))
            .await
            .expect("connect");
        ws
    }

    /// Waits for the next event called `name`, skipping others.
    pub async fn next_event(&mut self, name: &str) -> ServerEvent {
        timeout(STEP_TIMEOUT, async {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                if event.name() == name {
                    return event;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {name} event"))
    }

    /// Polls until the hub has `n` live connections.
    pub async fn wait_for_connections(&self, n: usize) {
        timeout(STEP_TIMEOUT, async {
            while self.hub.connection_count() != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("connection count never reached {n}"));
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.hub.shutdown();
    }
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.expect("send");
}

/// Next text frame as JSON, skipping WebSocket pings.
pub async fn recv_json(ws: &mut Ws) -> Value {
    match recv_frame(ws).await {
        Message::Text(text) => serde_json::from_str(&text).expect("json frame"),
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Next text frame whose `type` is `kind`, skipping others.
pub async fn recv_type(ws: &mut Ws, kind: &str) -> Value {
    loop {
        let frame = recv_json(ws).await;
        if frame["type"] == kind {
            return frame;
        }
    }
}

/// Next frame that is not a Ping or Pong.
pub async fn recv_frame(ws: &mut Ws) -> Message {
    timeout(STEP_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(msg)) => return msg,
                Some(Err(e)) => panic!("socket error: {e}"),
                None => panic!("socket ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

/// Reads until a Close frame arrives and returns it.
pub async fn recv_close(ws: &mut Ws) -> CloseFrame<'static> {
    loop {
        if let Message::Close(frame) = recv_frame(ws).await {
            return frame.expect("close frame without code");
        }
    }
}
