//! Outbound half of a connection, decoupled from the socket.
//!
//! A [`Transport`] is a cheap, cloneable handle that application code uses to
//! push frames to one client.  Frames go into a bounded channel drained by the
//! connection's writer task (see `infrastructure::ws_server`), so sending never
//! blocks and never awaits: a full or closed channel is a failed send.
//!
//! Closing is signalled separately through a `watch` channel so that a close
//! request is delivered even when the frame queue is full.  The first close
//! wins; later calls are no-ops.

use std::sync::Arc;

use relay_core::{encode_frame, CloseReason, OutboundMessage};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

/// Default per-connection outbound queue depth.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// A frame queued for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// WebSocket-level liveness probe.
    Ping,
}

/// Sending side of a connection.
#[derive(Debug, Clone)]
pub struct Transport {
    frames: mpsc::Sender<Outbound>,
    close: Arc<watch::Sender<Option<CloseReason>>>,
}

/// Receiving side, owned by the writer task.
#[derive(Debug)]
pub struct TransportReceiver {
    pub frames: mpsc::Receiver<Outbound>,
    pub close: watch::Receiver<Option<CloseReason>>,
}

impl Transport {
    /// Creates a connected transport pair with the given queue depth.
    pub fn channel(capacity: usize) -> (Transport, TransportReceiver) {
        let (frames_tx, frames_rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = watch::channel(None);
        (
            Transport {
                frames: frames_tx,
                close: Arc::new(close_tx),
            },
            TransportReceiver {
                frames: frames_rx,
                close: close_rx,
            },
        )
    }

    /// `true` until [`close`](Self::close) is called or the writer goes away.
    pub fn is_open(&self) -> bool {
        self.close.borrow().is_none() && !self.frames.is_closed()
    }

    /// The close reason, once one has been requested.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close.borrow()
    }

    /// Encodes and queues a message.  Returns `false` if the frame was not
    /// queued.
    pub fn send(&self, msg: &OutboundMessage) -> bool {
        match encode_frame(msg) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                error!("failed to encode {} frame: {e}", msg.type_name());
                false
            }
        }
    }

    /// Queues an already-encoded frame.  Used by fan-out paths that encode
    /// once for many recipients.
    pub fn send_text(&self, text: String) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.frames.try_send(Outbound::Text(text)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("outbound queue full; frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queues a WebSocket Ping probe.
    pub fn ping(&self) -> bool {
        self.is_open() && self.frames.try_send(Outbound::Ping).is_ok()
    }

    /// Requests that the writer close the socket with `reason`.
    ///
    /// Returns `true` if this call initiated the close.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.close.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }
}
