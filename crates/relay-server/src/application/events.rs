//! Events the hub reports to the hosting application.
//!
//! Delivered over the bounded channel returned by `Hub::new`.  Emission never
//! blocks: if the consumer falls behind, events are dropped with a warning.
//! A dropped `RequestReceived` still answers the client, because its
//! [`Responder`] sends a failure when dropped.

use relay_core::{ConnectionId, SessionInfo};
use serde_json::Value;

use crate::application::coordinator::Responder;
use crate::application::registry::SessionStats;

/// Depth of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndCause {
    /// The client sent `stream_end`.
    Client,
    /// The owning connection was torn down.
    Disconnect,
}

#[derive(Debug)]
pub enum ServerEvent {
    ClientConnected {
        session: SessionInfo,
    },
    ClientDisconnected {
        connection_id: ConnectionId,
        stats: SessionStats,
    },
    ClientAuthenticated {
        connection_id: ConnectionId,
    },
    /// A `data` frame passed validation.
    DataReceived {
        connection_id: ConnectionId,
        data_type: String,
        data: Value,
    },
    StreamStarted {
        connection_id: ConnectionId,
        stream_id: String,
        stream_type: String,
    },
    /// Pass-through of a `stream_data` frame.  Emitted for unknown stream ids
    /// too.
    StreamData {
        connection_id: ConnectionId,
        stream_id: String,
        data: Value,
        sequence_number: Option<u64>,
    },
    StreamEnded {
        connection_id: ConnectionId,
        stream_id: String,
        cause: StreamEndCause,
    },
    DatabaseInsert {
        connection_id: ConnectionId,
        table: String,
        insert_id: Value,
    },
    DatabaseError {
        connection_id: ConnectionId,
        table: String,
        error: String,
    },
    /// A client `request`; answer it through `responder`.
    RequestReceived {
        connection_id: ConnectionId,
        endpoint: String,
        data: Value,
        responder: Responder,
    },
}

impl ServerEvent {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ClientConnected { .. } => "client-connected",
            ServerEvent::ClientDisconnected { .. } => "client-disconnected",
            ServerEvent::ClientAuthenticated { .. } => "client-authenticated",
            ServerEvent::DataReceived { .. } => "data-received",
            ServerEvent::StreamStarted { .. } => "stream-started",
            ServerEvent::StreamData { .. } => "stream-data",
            ServerEvent::StreamEnded { .. } => "stream-ended",
            ServerEvent::DatabaseInsert { .. } => "database-insert",
            ServerEvent::DatabaseError { .. } => "database-error",
            ServerEvent::RequestReceived { .. } => "request-received",
        }
    }
}
